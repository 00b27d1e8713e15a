//! # 流式响应内容合成
//!
//! 从 SSE 事件流中按协议累积模型的可见文本与工具调用，
//! 在流结束后合成一份完整转写用于日志展示。

use crate::config::types::ServiceType;
use serde_json::Value;
use std::collections::BTreeMap;

/// 工具调用累积器
#[derive(Debug, Clone, Default)]
struct ToolCall {
    id: String,
    name: String,
    arguments: String,
}

/// 流合成器
pub struct StreamSynthesizer {
    service_type: ServiceType,
    content: String,
    tool_calls: BTreeMap<usize, ToolCall>,
    parse_failed: bool,
    /// responses 协议按 output_index 分段累积
    responses_text: BTreeMap<usize, String>,
}

impl StreamSynthesizer {
    #[must_use]
    pub fn new(service_type: ServiceType) -> Self {
        Self {
            service_type,
            content: String::new(),
            tool_calls: BTreeMap::new(),
            parse_failed: false,
            responses_text: BTreeMap::new(),
        }
    }

    /// 处理一个 SSE data 载荷（已解析为 JSON）
    pub fn process(&mut self, data: &Value) {
        self.parse_failed = false;
        match self.service_type {
            ServiceType::Gemini => self.process_gemini(data),
            ServiceType::Openai => self.process_openai(data),
            ServiceType::Claude => self.process_claude(data),
            ServiceType::Responses => self.process_responses(data),
        }
    }

    /// 处理一行原始 data 文本；非 JSON 时记一次解析失败
    pub fn process_data_line(&mut self, payload: &str) {
        let trimmed = payload.trim();
        if trimmed.is_empty() || trimmed == "[DONE]" {
            return;
        }
        match serde_json::from_str::<Value>(trimmed) {
            Ok(data) => self.process(&data),
            Err(_) => {
                if !self.parse_failed {
                    self.parse_failed = true;
                    self.content
                        .push_str("\n[解析警告: 部分JSON解析失败，将显示原始文本内容]");
                }
            }
        }
    }

    fn process_responses(&mut self, data: &Value) {
        let type_str = data.get("type").and_then(Value::as_str).unwrap_or("");
        let index = data
            .get("output_index")
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize;

        match type_str {
            "response.output_text.delta" => {
                if let Some(delta) = data.get("delta").and_then(Value::as_str) {
                    self.responses_text.entry(index).or_default().push_str(delta);
                }
            }
            "response.output_text.done" => {
                if let Some(text) = data.get("text").and_then(Value::as_str) {
                    if !text.is_empty() {
                        self.responses_text.insert(index, text.to_string());
                    }
                }
            }
            "response.completed" => {
                // 兜底：从最终响应提取文本
                let Some(output) = data
                    .get("response")
                    .and_then(|r| r.get("output"))
                    .and_then(Value::as_array)
                else {
                    return;
                };
                for (i, item) in output.iter().enumerate() {
                    if item.get("type").and_then(Value::as_str) != Some("message") {
                        continue;
                    }
                    let Some(content) = item.get("content").and_then(Value::as_array) else {
                        continue;
                    };
                    for block in content {
                        if block.get("type").and_then(Value::as_str) != Some("output_text") {
                            continue;
                        }
                        if let Some(text) = block.get("text").and_then(Value::as_str) {
                            if !text.is_empty() {
                                self.responses_text.insert(i, text.to_string());
                                break;
                            }
                        }
                    }
                }
            }
            "response.output_item.added" => {
                if let Some(item) = data.get("item") {
                    if item.get("type").and_then(Value::as_str) == Some("function_call") {
                        let acc = self.tool_calls.entry(index).or_default();
                        if let Some(id) = item.get("id").and_then(Value::as_str) {
                            if !id.is_empty() {
                                acc.id = id.to_string();
                            }
                        }
                        if let Some(name) = item.get("name").and_then(Value::as_str) {
                            if !name.is_empty() {
                                acc.name = name.to_string();
                            }
                        }
                    }
                }
            }
            "response.function_call_arguments.delta" => {
                let acc = self.tool_calls.entry(index).or_default();
                if let Some(id) = data.get("item_id").and_then(Value::as_str) {
                    if !id.is_empty() {
                        acc.id = id.to_string();
                    }
                }
                if let Some(delta) = data.get("delta").and_then(Value::as_str) {
                    acc.arguments.push_str(delta);
                }
            }
            "response.function_call_arguments.done" => {
                let acc = self.tool_calls.entry(index).or_default();
                if let Some(id) = data.get("item_id").and_then(Value::as_str) {
                    if !id.is_empty() {
                        acc.id = id.to_string();
                    }
                }
                if let Some(args) = data.get("arguments").and_then(Value::as_str) {
                    if !args.is_empty() {
                        acc.arguments = args.to_string();
                    }
                }
                if let Some(name) = data
                    .get("item")
                    .and_then(|i| i.get("name"))
                    .and_then(Value::as_str)
                {
                    if !name.is_empty() {
                        acc.name = name.to_string();
                    }
                }
            }
            _ => {}
        }
    }

    fn process_gemini(&mut self, data: &Value) {
        let Some(parts) = data
            .get("candidates")
            .and_then(Value::as_array)
            .and_then(|c| c.first())
            .and_then(|c| c.get("content"))
            .and_then(|c| c.get("parts"))
            .and_then(Value::as_array)
        else {
            return;
        };

        for part in parts {
            if let Some(text) = part.get("text").and_then(Value::as_str) {
                self.content.push_str(text);
            }
            if let Some(function_call) = part.get("functionCall") {
                let name = function_call
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                let args = function_call
                    .get("args")
                    .map(Value::to_string)
                    .unwrap_or_else(|| "null".to_string());
                self.content.push_str("\nTool Call: ");
                self.content.push_str(name);
                self.content.push('(');
                self.content.push_str(&args);
                self.content.push(')');
            }
        }
    }

    fn process_openai(&mut self, data: &Value) {
        let Some(delta) = data
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|c| c.first())
            .and_then(|c| c.get("delta"))
        else {
            return;
        };

        if let Some(text) = delta.get("content").and_then(Value::as_str) {
            self.content.push_str(text);
        }

        if let Some(tool_calls) = delta.get("tool_calls").and_then(Value::as_array) {
            for tc in tool_calls {
                let index = tc.get("index").and_then(Value::as_u64).unwrap_or(0) as usize;
                let acc = self.tool_calls.entry(index).or_default();
                if let Some(id) = tc.get("id").and_then(Value::as_str) {
                    acc.id = id.to_string();
                }
                if let Some(function) = tc.get("function") {
                    if let Some(name) = function.get("name").and_then(Value::as_str) {
                        acc.name = name.to_string();
                    }
                    if let Some(args) = function.get("arguments").and_then(Value::as_str) {
                        acc.arguments.push_str(args);
                    }
                }
            }
        }
    }

    fn process_claude(&mut self, data: &Value) {
        let event_type = data.get("type").and_then(Value::as_str).unwrap_or("");
        match event_type {
            "message_start" => {
                if let Some(content) = data
                    .get("message")
                    .and_then(|m| m.get("content"))
                    .and_then(Value::as_array)
                {
                    for block in content {
                        if let Some(text) = block.get("text").and_then(Value::as_str) {
                            self.content.push_str(text);
                        }
                    }
                }
            }
            "content_block_start" => {
                let Some(block) = data.get("content_block") else {
                    return;
                };
                let index = data.get("index").and_then(Value::as_u64).unwrap_or(0) as usize;
                match block.get("type").and_then(Value::as_str) {
                    Some("tool_use") => {
                        let acc = self.tool_calls.entry(index).or_default();
                        if let Some(id) = block.get("id").and_then(Value::as_str) {
                            acc.id = id.to_string();
                        }
                        if let Some(name) = block.get("name").and_then(Value::as_str) {
                            acc.name = name.to_string();
                        }
                    }
                    Some("text") => {
                        if let Some(text) = block.get("text").and_then(Value::as_str) {
                            self.content.push_str(text);
                        }
                    }
                    _ => {}
                }
            }
            "content_block_delta" => {
                let Some(delta) = data.get("delta") else {
                    return;
                };
                match delta.get("type").and_then(Value::as_str) {
                    Some("text_delta") => {
                        if let Some(text) = delta.get("text").and_then(Value::as_str) {
                            self.content.push_str(text);
                        }
                    }
                    Some("input_json_delta") => {
                        if let Some(partial) = delta.get("partial_json").and_then(Value::as_str) {
                            let index =
                                data.get("index").and_then(Value::as_u64).unwrap_or(0) as usize;
                            self.tool_calls
                                .entry(index)
                                .or_default()
                                .arguments
                                .push_str(partial);
                        }
                    }
                    // thinking_delta 不进入合成内容
                    _ => {}
                }
            }
            "message_delta" => {
                if let Some(text) = data
                    .get("delta")
                    .and_then(|d| d.get("text"))
                    .and_then(Value::as_str)
                {
                    self.content.push_str(text);
                }
            }
            _ => {}
        }
    }

    /// 合成最终转写内容（即使有解析错误也返回部分结果）
    #[must_use]
    pub fn synthesized_content(&mut self) -> String {
        let mut result = if self.service_type == ServiceType::Responses
            && !self.responses_text.is_empty()
        {
            self.responses_text
                .values()
                .filter(|text| !text.is_empty())
                .cloned()
                .collect::<Vec<_>>()
                .join("\n")
        } else {
            self.content.clone()
        };

        if !self.tool_calls.is_empty() {
            self.merge_split_tool_calls();
            for (index, tool) in &self.tool_calls {
                let args = if tool.arguments.is_empty() {
                    "{}"
                } else {
                    &tool.arguments
                };
                let name = if tool.name.is_empty() {
                    "unknown_function"
                } else {
                    &tool.name
                };
                let id = if tool.id.is_empty() {
                    format!("tool_{index}")
                } else {
                    tool.id.clone()
                };

                result.push_str("\nTool Call: ");
                result.push_str(name);
                result.push('(');
                // 参数能解析时重新序列化为紧凑 JSON
                match serde_json::from_str::<Value>(args) {
                    Ok(parsed) => result.push_str(&parsed.to_string()),
                    Err(_) => result.push_str(args),
                }
                result.push_str(") [ID: ");
                result.push_str(&id);
                result.push(']');
            }
        }

        result
    }

    /// 修复分裂的工具调用。
    ///
    /// 问题场景：上游把一次工具调用拆成相邻两个 block——前一个有
    /// name 和 id 但参数为空，后一个没有 name 但有完整参数。
    /// 当两者 id 一致（或后者 id 为空）时合并为一个。
    fn merge_split_tool_calls(&mut self) {
        if self.tool_calls.len() < 2 {
            return;
        }

        let indices: Vec<usize> = self.tool_calls.keys().copied().collect();
        let mut to_delete = Vec::new();
        let mut i = 0;
        while i + 1 < indices.len() {
            let curr_idx = indices[i];
            let next_idx = indices[i + 1];
            let (Some(curr), Some(next)) = (
                self.tool_calls.get(&curr_idx).cloned(),
                self.tool_calls.get(&next_idx).cloned(),
            ) else {
                i += 1;
                continue;
            };
            if curr.id.is_empty() {
                i += 1;
                continue;
            }

            let curr_args_empty = curr.arguments.is_empty() || curr.arguments == "{}";
            let next_has_no_name = next.name.is_empty();
            let next_has_args = !next.arguments.is_empty() && next.arguments != "{}";
            let ids_compatible = next.id.is_empty() || next.id == curr.id;

            if !curr.name.is_empty()
                && curr_args_empty
                && next_has_no_name
                && next_has_args
                && ids_compatible
            {
                if let Some(entry) = self.tool_calls.get_mut(&curr_idx) {
                    entry.arguments = next.arguments;
                }
                to_delete.push(next_idx);
                i += 2;
            } else {
                i += 1;
            }
        }

        for index in to_delete {
            self.tool_calls.remove(&index);
        }
    }

    /// 是否处理到了工具调用
    #[must_use]
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}
