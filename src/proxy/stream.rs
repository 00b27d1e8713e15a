//! # 流式拦截器
//!
//! 把上游 SSE 流逐帧转发给下游，途中原位改写已知字段：
//! messages 协议的 message_start 用量兜底、gemini 协议的
//! thoughtSignature 注入/剥离。帧边界与事件顺序保持不变。
//! 流结束后汇总用量、模型与转写内容交给 finalize 回调做归因；
//! 下游断开时停止读取且不触发 finalize（不计数、不记日志）。

use crate::config::types::ServiceType;
use crate::metrics::Usage;
use crate::proxy::synthesizer::StreamSynthesizer;
use crate::utils::sse::SseFrameCodec;
use axum::body::Body;
use bytes::Bytes;
use futures::StreamExt;
use serde_json::Value;
use std::io;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::codec::FramedRead;
use tokio_util::io::StreamReader;

/// 跳过 Gemini thought signature 校验的占位签名（兼容部分第三方上游）
pub const DUMMY_THOUGHT_SIGNATURE: &str = "skip_thought_signature_validator";

/// 拦截策略与上下文
#[derive(Debug, Clone)]
pub struct StreamScope {
    pub service_type: ServiceType,
    /// 从请求体估算的输入 token（message_start 兜底用）
    pub estimated_input_tokens: i64,
    /// messages 协议是否启用 message_start 用量兜底
    pub patch_input_tokens: bool,
    /// 为缺失 thoughtSignature 的工具调用注入占位签名
    pub inject_dummy_thought_signature: bool,
    /// 完全剥离 thoughtSignature 字段
    pub strip_thought_signature: bool,
}

/// 流结束后的归因数据
#[derive(Debug, Clone, Default)]
pub struct StreamOutcome {
    pub usage: Usage,
    pub model: String,
    pub transcript: String,
}

/// 拦截 SSE 流并返回下游响应体。
///
/// 背压：仅以下游消费速度读取上游（有界通道）。
pub fn intercept_sse<F>(upstream: reqwest::Response, scope: StreamScope, finalize: F) -> Body
where
    F: FnOnce(StreamOutcome) + Send + 'static,
{
    let (tx, rx) = tokio::sync::mpsc::channel::<std::result::Result<Bytes, io::Error>>(16);

    tokio::spawn(async move {
        let byte_stream = upstream
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| io::Error::other(e.to_string())));
        let reader = StreamReader::new(byte_stream);
        let mut frames = FramedRead::new(reader, SseFrameCodec::new());

        let mut synthesizer = StreamSynthesizer::new(scope.service_type);
        let mut usage = Usage::default();
        let mut model = String::new();
        let mut saw_usage = false;

        while let Some(next) = frames.next().await {
            let frame = match next {
                Ok(frame) => frame,
                Err(err) => {
                    // 中途的读错误无法再改变响应头：转发错误并结束
                    let _ = tx.send(Err(err)).await;
                    break;
                }
            };

            let out = match frame.data_json() {
                Some(mut data) => {
                    synthesizer.process(&data);
                    update_usage_from_event(
                        scope.service_type,
                        &data,
                        &mut usage,
                        &mut model,
                        &mut saw_usage,
                    );

                    let mut modified = false;
                    if scope.patch_input_tokens
                        && patch_message_start_usage(&mut data, scope.estimated_input_tokens)
                    {
                        modified = true;
                    }
                    if (scope.inject_dummy_thought_signature || scope.strip_thought_signature)
                        && patch_thought_signatures(
                            &mut data,
                            scope.inject_dummy_thought_signature,
                            scope.strip_thought_signature,
                        )
                    {
                        modified = true;
                    }

                    if modified {
                        frame.with_data(&data)
                    } else {
                        frame.into_raw()
                    }
                }
                None => frame.into_raw(),
            };

            if tx.send(Ok(out)).await.is_err() {
                // 下游断开：停止读取，不做归因
                return;
            }
        }

        finalize(StreamOutcome {
            usage,
            model,
            transcript: synthesizer.synthesized_content(),
        });
    });

    Body::from_stream(ReceiverStream::new(rx))
}

/// 处理非流式 JSON 响应体：签名改写 + 用量提取。
/// 返回 (输出 body, 归因数据)。
#[must_use]
pub fn process_json_body(body: &[u8], scope: &StreamScope) -> (Vec<u8>, StreamOutcome) {
    let Ok(mut data) = serde_json::from_slice::<Value>(body) else {
        return (body.to_vec(), StreamOutcome::default());
    };

    let mut usage = Usage::default();
    let mut model = String::new();
    let mut saw_usage = false;
    update_usage_from_event(
        scope.service_type,
        &data,
        &mut usage,
        &mut model,
        &mut saw_usage,
    );

    let mut modified = false;
    if (scope.inject_dummy_thought_signature || scope.strip_thought_signature)
        && patch_thought_signatures(
            &mut data,
            scope.inject_dummy_thought_signature,
            scope.strip_thought_signature,
        )
    {
        modified = true;
    }

    let transcript = extract_transcript(scope.service_type, &data);
    let out = if modified {
        serde_json::to_vec(&data).unwrap_or_else(|_| body.to_vec())
    } else {
        body.to_vec()
    };

    (
        out,
        StreamOutcome {
            usage,
            model,
            transcript,
        },
    )
}

/// message_start 用量兜底。
///
/// input_tokens 为 null/0/<10 且无 cache-read token 时以估算值替换；
/// 存在 cache-read 时说明上游口径如此，不做改写。
fn patch_message_start_usage(data: &mut Value, estimated: i64) -> bool {
    if data.get("type").and_then(Value::as_str) != Some("message_start") {
        return false;
    }
    let Some(usage) = data
        .get_mut("message")
        .and_then(|m| m.get_mut("usage"))
        .and_then(Value::as_object_mut)
    else {
        return false;
    };

    let cache_read = usage
        .get("cache_read_input_tokens")
        .and_then(Value::as_i64)
        .unwrap_or(0);
    if cache_read > 0 {
        return false;
    }

    let input = usage.get("input_tokens").and_then(Value::as_i64);
    match input {
        None | Some(0) => {}
        Some(n) if n < 10 => {}
        _ => return false,
    }
    if estimated <= 0 {
        return false;
    }
    usage.insert("input_tokens".to_string(), Value::from(estimated));
    true
}

/// Gemini thoughtSignature 处理。
///
/// 约定：thoughtSignature 序列化在 part 层级（与 functionCall 同级）。
/// 上游放在 functionCall 内部时先提升到 part 层级；注入模式下缺失
/// 签名的工具调用补占位签名；剥离模式下移除全部签名字段。
fn patch_thought_signatures(data: &mut Value, inject: bool, strip: bool) -> bool {
    let Some(candidates) = data.get_mut("candidates").and_then(Value::as_array_mut) else {
        return false;
    };

    let mut modified = false;
    for candidate in candidates {
        let Some(parts) = candidate
            .get_mut("content")
            .and_then(|c| c.get_mut("parts"))
            .and_then(Value::as_array_mut)
        else {
            continue;
        };

        for part in parts {
            let Some(part_map) = part.as_object_mut() else {
                continue;
            };

            // functionCall 内部的签名先取出（历史兼容的放置位置）
            let mut inner_signature = None;
            if let Some(function_call) = part_map
                .get_mut("functionCall")
                .and_then(Value::as_object_mut)
            {
                for field in ["thoughtSignature", "thought_signature"] {
                    if let Some(sig) = function_call.remove(field) {
                        if inner_signature.is_none() {
                            inner_signature = sig.as_str().map(String::from);
                        }
                        modified = true;
                    }
                }
            }

            if strip {
                for field in ["thoughtSignature", "thought_signature"] {
                    if part_map.remove(field).is_some() {
                        modified = true;
                    }
                }
                continue;
            }

            let has_function_call = part_map.contains_key("functionCall");
            if !has_function_call {
                continue;
            }

            let has_part_signature = part_map.contains_key("thoughtSignature");
            if !has_part_signature {
                if let Some(sig) = inner_signature {
                    part_map.insert("thoughtSignature".to_string(), Value::String(sig));
                    modified = true;
                } else if inject {
                    part_map.insert(
                        "thoughtSignature".to_string(),
                        Value::String(DUMMY_THOUGHT_SIGNATURE.to_string()),
                    );
                    modified = true;
                }
            }
        }
    }
    modified
}

/// 按协议从事件中更新用量与模型
fn update_usage_from_event(
    service_type: ServiceType,
    data: &Value,
    usage: &mut Usage,
    model: &mut String,
    saw_usage: &mut bool,
) {
    match service_type {
        ServiceType::Claude => {
            let event_type = data.get("type").and_then(Value::as_str).unwrap_or("");
            match event_type {
                "message_start" => {
                    if let Some(message) = data.get("message") {
                        if let Some(m) = message.get("model").and_then(Value::as_str) {
                            *model = m.to_string();
                        }
                        if let Some(u) = message.get("usage") {
                            merge_claude_usage(u, usage, saw_usage);
                        }
                    }
                }
                "message_delta" => {
                    if let Some(u) = data.get("usage") {
                        merge_claude_usage(u, usage, saw_usage);
                    }
                }
                _ => {
                    // 非流式整体响应
                    if let Some(u) = data.get("usage") {
                        merge_claude_usage(u, usage, saw_usage);
                    }
                    if let Some(m) = data.get("model").and_then(Value::as_str) {
                        if model.is_empty() {
                            *model = m.to_string();
                        }
                    }
                }
            }
        }
        ServiceType::Responses => {
            let response = if data.get("type").and_then(Value::as_str)
                == Some("response.completed")
            {
                data.get("response")
            } else if data.get("object").and_then(Value::as_str) == Some("response") {
                Some(data)
            } else {
                None
            };
            if let Some(response) = response {
                if let Some(m) = response.get("model").and_then(Value::as_str) {
                    *model = m.to_string();
                }
                if let Some(u) = response.get("usage") {
                    *saw_usage = true;
                    usage.input_tokens = u
                        .get("input_tokens")
                        .and_then(Value::as_i64)
                        .unwrap_or(usage.input_tokens);
                    usage.output_tokens = u
                        .get("output_tokens")
                        .and_then(Value::as_i64)
                        .unwrap_or(usage.output_tokens);
                    if let Some(cached) = u
                        .get("input_tokens_details")
                        .and_then(|d| d.get("cached_tokens"))
                        .and_then(Value::as_i64)
                    {
                        usage.cache_read_input_tokens = cached;
                    }
                }
            }
        }
        ServiceType::Openai => {
            if let Some(m) = data.get("model").and_then(Value::as_str) {
                if model.is_empty() {
                    *model = m.to_string();
                }
            }
            if let Some(u) = data.get("usage").filter(|u| !u.is_null()) {
                *saw_usage = true;
                usage.input_tokens = u
                    .get("prompt_tokens")
                    .and_then(Value::as_i64)
                    .unwrap_or(usage.input_tokens);
                usage.output_tokens = u
                    .get("completion_tokens")
                    .and_then(Value::as_i64)
                    .unwrap_or(usage.output_tokens);
                if let Some(cached) = u
                    .get("prompt_tokens_details")
                    .and_then(|d| d.get("cached_tokens"))
                    .and_then(Value::as_i64)
                {
                    usage.cache_read_input_tokens = cached;
                }
            }
        }
        ServiceType::Gemini => {
            if let Some(m) = data.get("modelVersion").and_then(Value::as_str) {
                *model = m.to_string();
            }
            if let Some(u) = data.get("usageMetadata") {
                *saw_usage = true;
                usage.input_tokens = u
                    .get("promptTokenCount")
                    .and_then(Value::as_i64)
                    .unwrap_or(usage.input_tokens);
                let candidates = u
                    .get("candidatesTokenCount")
                    .and_then(Value::as_i64)
                    .unwrap_or(0);
                let thoughts = u
                    .get("thoughtsTokenCount")
                    .and_then(Value::as_i64)
                    .unwrap_or(0);
                if candidates + thoughts > 0 {
                    usage.output_tokens = candidates + thoughts;
                }
                if let Some(cached) = u
                    .get("cachedContentTokenCount")
                    .and_then(Value::as_i64)
                {
                    usage.cache_read_input_tokens = cached;
                }
            }
        }
    }
}

fn merge_claude_usage(u: &Value, usage: &mut Usage, saw_usage: &mut bool) {
    *saw_usage = true;
    if let Some(v) = u.get("input_tokens").and_then(Value::as_i64) {
        usage.input_tokens = v;
    }
    if let Some(v) = u.get("output_tokens").and_then(Value::as_i64) {
        usage.output_tokens = v;
    }
    if let Some(v) = u.get("cache_creation_input_tokens").and_then(Value::as_i64) {
        usage.cache_creation_input_tokens = v;
    }
    if let Some(v) = u
        .get("cache_creation_5m_input_tokens")
        .and_then(Value::as_i64)
    {
        usage.cache_creation_5m_input_tokens = v;
    }
    if let Some(v) = u
        .get("cache_creation_1h_input_tokens")
        .and_then(Value::as_i64)
    {
        usage.cache_creation_1h_input_tokens = v;
    }
    if let Some(v) = u.get("cache_read_input_tokens").and_then(Value::as_i64) {
        usage.cache_read_input_tokens = v;
    }
}

/// 从非流式响应体提取可见文本（用于日志转写）
fn extract_transcript(service_type: ServiceType, data: &Value) -> String {
    let mut out = String::new();
    match service_type {
        ServiceType::Claude => {
            if let Some(content) = data.get("content").and_then(Value::as_array) {
                for block in content {
                    if let Some(text) = block.get("text").and_then(Value::as_str) {
                        out.push_str(text);
                    }
                }
            }
        }
        ServiceType::Openai => {
            if let Some(text) = data
                .get("choices")
                .and_then(Value::as_array)
                .and_then(|c| c.first())
                .and_then(|c| c.get("message"))
                .and_then(|m| m.get("content"))
                .and_then(Value::as_str)
            {
                out.push_str(text);
            }
        }
        ServiceType::Responses => {
            if let Some(output) = data.get("output").and_then(Value::as_array) {
                for item in output {
                    if let Some(content) = item.get("content").and_then(Value::as_array) {
                        for block in content {
                            if let Some(text) = block.get("text").and_then(Value::as_str) {
                                out.push_str(text);
                            }
                        }
                    }
                }
            }
        }
        ServiceType::Gemini => {
            if let Some(parts) = data
                .get("candidates")
                .and_then(Value::as_array)
                .and_then(|c| c.first())
                .and_then(|c| c.get("content"))
                .and_then(|c| c.get("parts"))
                .and_then(Value::as_array)
            {
                for part in parts {
                    if let Some(text) = part.get("text").and_then(Value::as_str) {
                        out.push_str(text);
                    }
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_patch_message_start_replaces_low_input() {
        let mut data = json!({"type":"message_start","message":{"usage":{"input_tokens":3,"output_tokens":0}}});
        assert!(patch_message_start_usage(&mut data, 1200));
        assert_eq!(data["message"]["usage"]["input_tokens"], 1200);

        let mut data =
            json!({"type":"message_start","message":{"usage":{"output_tokens":0}}});
        assert!(patch_message_start_usage(&mut data, 800));
        assert_eq!(data["message"]["usage"]["input_tokens"], 800);
    }

    #[test]
    fn test_patch_message_start_keeps_cache_read() {
        let mut data = json!({"type":"message_start","message":{"usage":{"input_tokens":2,"cache_read_input_tokens":500}}});
        assert!(!patch_message_start_usage(&mut data, 1200));
        assert_eq!(data["message"]["usage"]["input_tokens"], 2);
    }

    #[test]
    fn test_patch_message_start_keeps_real_counts() {
        let mut data = json!({"type":"message_start","message":{"usage":{"input_tokens":123}}});
        assert!(!patch_message_start_usage(&mut data, 999));
        // message_delta 不碰
        let mut data = json!({"type":"message_delta","usage":{"input_tokens":0}});
        assert!(!patch_message_start_usage(&mut data, 999));
    }

    #[test]
    fn test_inject_dummy_thought_signature_at_part_level() {
        let mut data = json!({"candidates":[{"content":{"parts":[
            {"functionCall":{"name":"f","args":{}}}
        ]}}]});
        assert!(patch_thought_signatures(&mut data, true, false));
        let part = &data["candidates"][0]["content"]["parts"][0];
        assert_eq!(part["thoughtSignature"], DUMMY_THOUGHT_SIGNATURE);
        assert!(part["functionCall"].get("thoughtSignature").is_none());
    }

    #[test]
    fn test_inner_signature_lifted_to_part_level() {
        let mut data = json!({"candidates":[{"content":{"parts":[
            {"functionCall":{"name":"f","thoughtSignature":"real-sig"}}
        ]}}]});
        assert!(patch_thought_signatures(&mut data, true, false));
        let part = &data["candidates"][0]["content"]["parts"][0];
        assert_eq!(part["thoughtSignature"], "real-sig");
        assert!(part["functionCall"].get("thoughtSignature").is_none());
    }

    #[test]
    fn test_strip_thought_signature() {
        let mut data = json!({"candidates":[{"content":{"parts":[
            {"functionCall":{"name":"f"},"thoughtSignature":"sig"}
        ]}}]});
        assert!(patch_thought_signatures(&mut data, false, true));
        let part = &data["candidates"][0]["content"]["parts"][0];
        assert!(part.get("thoughtSignature").is_none());
    }

    #[test]
    fn test_text_part_not_injected() {
        let mut data = json!({"candidates":[{"content":{"parts":[{"text":"hello"}]}}]});
        assert!(!patch_thought_signatures(&mut data, true, false));
    }

    #[test]
    fn test_claude_usage_extraction() {
        let mut usage = Usage::default();
        let mut model = String::new();
        let mut saw = false;
        update_usage_from_event(
            ServiceType::Claude,
            &json!({"type":"message_start","message":{"model":"claude-sonnet-4","usage":{"input_tokens":100,"cache_read_input_tokens":50}}}),
            &mut usage,
            &mut model,
            &mut saw,
        );
        update_usage_from_event(
            ServiceType::Claude,
            &json!({"type":"message_delta","usage":{"output_tokens":42}}),
            &mut usage,
            &mut model,
            &mut saw,
        );
        assert_eq!(model, "claude-sonnet-4");
        assert_eq!(usage.input_tokens, 100);
        assert_eq!(usage.cache_read_input_tokens, 50);
        assert_eq!(usage.output_tokens, 42);
        assert!(saw);
    }

    #[test]
    fn test_responses_usage_extraction() {
        let mut usage = Usage::default();
        let mut model = String::new();
        let mut saw = false;
        update_usage_from_event(
            ServiceType::Responses,
            &json!({"type":"response.completed","response":{"model":"gpt-5","usage":{"input_tokens":10,"output_tokens":20,"input_tokens_details":{"cached_tokens":5}}}}),
            &mut usage,
            &mut model,
            &mut saw,
        );
        assert_eq!(model, "gpt-5");
        assert_eq!(usage.input_tokens, 10);
        assert_eq!(usage.output_tokens, 20);
        assert_eq!(usage.cache_read_input_tokens, 5);
    }

    #[test]
    fn test_gemini_usage_includes_thoughts() {
        let mut usage = Usage::default();
        let mut model = String::new();
        let mut saw = false;
        update_usage_from_event(
            ServiceType::Gemini,
            &json!({"modelVersion":"gemini-2.5-pro","usageMetadata":{"promptTokenCount":7,"candidatesTokenCount":30,"thoughtsTokenCount":12,"cachedContentTokenCount":3}}),
            &mut usage,
            &mut model,
            &mut saw,
        );
        assert_eq!(usage.input_tokens, 7);
        assert_eq!(usage.output_tokens, 42);
        assert_eq!(usage.cache_read_input_tokens, 3);
    }

    #[test]
    fn test_process_json_body_extracts_transcript() {
        let body = br#"{"model":"claude-sonnet-4","content":[{"type":"text","text":"hi"}],"usage":{"input_tokens":5,"output_tokens":2}}"#;
        let scope = StreamScope {
            service_type: ServiceType::Claude,
            estimated_input_tokens: 0,
            patch_input_tokens: false,
            inject_dummy_thought_signature: false,
            strip_thought_signature: false,
        };
        let (out, outcome) = process_json_body(body, &scope);
        assert_eq!(out, body.to_vec());
        assert_eq!(outcome.transcript, "hi");
        assert_eq!(outcome.usage.input_tokens, 5);
        assert_eq!(outcome.model, "claude-sonnet-4");
    }
}
