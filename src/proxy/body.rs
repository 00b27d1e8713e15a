//! # 请求体预处理
//!
//! 入站请求体的清洗与信息提取：空 signature 字段剔除、调用方标识、
//! 模型名、流式标记、输入 token 估算与思考强度规整。

use crate::config::redirect::redirect_reasoning_effort;
use crate::linfo;
use crate::logging::{LogComponent, LogStage};
use axum::http::HeaderMap;
use serde_json::Value;
use std::collections::HashMap;

/// 递归移除 `messages[*].content[*].signature` 的空值（空串或 null）。
///
/// 返回 (新 body, 是否有修改)。仅处理已知路径，保持其余 JSON 原样。
pub fn remove_empty_signatures(body: &[u8], enable_log: bool) -> (Vec<u8>, bool) {
    if body.is_empty() || !body.windows(11).any(|w| w == b"\"signature\"") {
        return (body.to_vec(), false);
    }

    let Ok(mut data) = serde_json::from_slice::<Value>(body) else {
        return (body.to_vec(), false);
    };

    let removed = remove_empty_signatures_in_messages(&mut data);
    if removed == 0 {
        return (body.to_vec(), false);
    }

    if enable_log {
        linfo!(
            "system",
            LogStage::RequestModify,
            LogComponent::Proxy,
            "signature_scrub",
            &format!("已移除 {removed} 个空 signature 字段")
        );
    }

    match serde_json::to_vec(&data) {
        Ok(bytes) => (bytes, true),
        Err(_) => (body.to_vec(), false),
    }
}

fn remove_empty_signatures_in_messages(data: &mut Value) -> usize {
    let Some(messages) = data.get_mut("messages").and_then(Value::as_array_mut) else {
        return 0;
    };

    let mut removed = 0;
    for message in messages {
        let Some(content) = message.get_mut("content").and_then(Value::as_array_mut) else {
            continue;
        };
        for block in content {
            let Some(map) = block.as_object_mut() else {
                continue;
            };
            let empty = match map.get("signature") {
                Some(Value::Null) => true,
                Some(Value::String(s)) => s.is_empty(),
                _ => false,
            };
            if empty {
                map.remove("signature");
                removed += 1;
            }
        }
    }
    removed
}

/// 提取调用方标识。
/// 优先级：Conversation_id 头 > Session_id 头 > body prompt_cache_key >
/// body metadata.user_id > 空。Gemini 额外接受特权用户头。
#[must_use]
pub fn extract_caller_id(headers: &HeaderMap, body: &[u8]) -> String {
    for header in [
        "Conversation_id",
        "Session_id",
        "X-Gemini-Api-Privileged-User-Id",
    ] {
        if let Some(value) = headers.get(header).and_then(|v| v.to_str().ok()) {
            if !value.is_empty() {
                return value.to_string();
            }
        }
    }

    let Ok(value) = serde_json::from_slice::<Value>(body) else {
        return String::new();
    };
    if let Some(cache_key) = value.get("prompt_cache_key").and_then(Value::as_str) {
        if !cache_key.is_empty() {
            return cache_key.to_string();
        }
    }
    if let Some(user_id) = value
        .get("metadata")
        .and_then(|m| m.get("user_id"))
        .and_then(Value::as_str)
    {
        if !user_id.is_empty() {
            return user_id.to_string();
        }
    }
    String::new()
}

/// 提取请求的模型名
#[must_use]
pub fn extract_model(body: &[u8]) -> String {
    serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|v| v.get("model").and_then(Value::as_str).map(String::from))
        .unwrap_or_default()
}

/// 请求是否声明流式
#[must_use]
pub fn extract_stream_flag(body: &[u8]) -> bool {
    serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|v| v.get("stream").and_then(Value::as_bool))
        .unwrap_or(false)
}

/// 从请求体粗估输入 token 数：遍历所有字符串叶子，按 4 字节/token 折算。
/// 用于上游漏报 input_tokens 时的流内兜底填充。
#[must_use]
pub fn estimate_input_tokens(body: &[u8]) -> i64 {
    let Ok(value) = serde_json::from_slice::<Value>(body) else {
        return (body.len() / 4) as i64;
    };
    let mut chars = 0usize;
    accumulate_text_len(&value, &mut chars);
    (chars / 4) as i64
}

fn accumulate_text_len(value: &Value, total: &mut usize) {
    match value {
        Value::String(s) => *total += s.len(),
        Value::Array(items) => {
            for item in items {
                accumulate_text_len(item, total);
            }
        }
        Value::Object(map) => {
            for child in map.values() {
                accumulate_text_len(child, total);
            }
        }
        _ => {}
    }
}

/// 模型特定的思考强度规整：gpt-5.2 与 gpt-5.3-codex 不支持 minimal，
/// 先归一到 low，再走重定向映射。
pub fn normalize_reasoning_effort(body: &mut Value) {
    let Some(model) = body.get("model").and_then(Value::as_str) else {
        return;
    };
    let needs_normalize = model.starts_with("gpt-5.2") || model.starts_with("gpt-5.3-codex");
    if !needs_normalize {
        return;
    }
    if let Some(reasoning) = body.get_mut("reasoning").and_then(Value::as_object_mut) {
        if reasoning.get("effort").and_then(Value::as_str) == Some("minimal") {
            reasoning.insert("effort".to_string(), Value::String("low".to_string()));
        }
    }
    if body.get("reasoning_effort").and_then(Value::as_str) == Some("minimal") {
        if let Some(map) = body.as_object_mut() {
            map.insert(
                "reasoning_effort".to_string(),
                Value::String("low".to_string()),
            );
        }
    }
}

/// 应用思考强度重定向映射（reasoning.effort 与顶层 reasoning_effort）。
/// 返回重定向后的最终 effort（用于日志）。
pub fn apply_reasoning_redirect(
    body: &mut Value,
    mapping: &HashMap<String, String>,
) -> Option<String> {
    let mut applied = None;

    if let Some(reasoning) = body.get_mut("reasoning").and_then(Value::as_object_mut) {
        if let Some(effort) = reasoning.get("effort").and_then(Value::as_str) {
            let redirected = redirect_reasoning_effort(effort, mapping);
            applied = Some(redirected.clone());
            reasoning.insert("effort".to_string(), Value::String(redirected));
        }
    }

    if let Some(effort) = body.get("reasoning_effort").and_then(Value::as_str) {
        let redirected = redirect_reasoning_effort(effort, mapping);
        if applied.is_none() {
            applied = Some(redirected.clone());
        }
        if let Some(map) = body.as_object_mut() {
            map.insert("reasoning_effort".to_string(), Value::String(redirected));
        }
    }

    applied
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_empty_signature_removed() {
        let body = br#"{"messages":[{"content":[{"type":"tool_use","signature":"","text":"x"}]}]}"#;
        let (out, modified) = remove_empty_signatures(body, false);
        assert!(modified);
        let value: Value = serde_json::from_slice(&out).unwrap();
        let block = &value["messages"][0]["content"][0];
        assert!(block.get("signature").is_none());
        assert_eq!(block["text"], "x");
    }

    #[test]
    fn test_null_signature_removed_non_empty_kept() {
        let body = br#"{"messages":[{"content":[{"signature":null},{"signature":"keep-me"}]}]}"#;
        let (out, modified) = remove_empty_signatures(body, false);
        assert!(modified);
        let value: Value = serde_json::from_slice(&out).unwrap();
        assert!(value["messages"][0]["content"][0].get("signature").is_none());
        assert_eq!(value["messages"][0]["content"][1]["signature"], "keep-me");
    }

    #[test]
    fn test_body_without_signature_untouched() {
        let body = br#"{"messages":[{"content":[{"text":"hello"}]}]}"#;
        let (out, modified) = remove_empty_signatures(body, false);
        assert!(!modified);
        assert_eq!(out, body.to_vec());
    }

    #[test]
    fn test_caller_id_priority() {
        let mut headers = HeaderMap::new();
        headers.insert("Conversation_id", "conv-1".parse().unwrap());
        headers.insert("Session_id", "sess-1".parse().unwrap());
        let body = br#"{"prompt_cache_key":"pck-1","metadata":{"user_id":"u-1"}}"#;
        assert_eq!(extract_caller_id(&headers, body), "conv-1");

        headers.remove("Conversation_id");
        assert_eq!(extract_caller_id(&headers, body), "sess-1");

        let headers = HeaderMap::new();
        assert_eq!(extract_caller_id(&headers, body), "pck-1");

        let body = br#"{"metadata":{"user_id":"u-1"}}"#;
        assert_eq!(extract_caller_id(&headers, body), "u-1");

        assert_eq!(extract_caller_id(&headers, b"{}"), "");
    }

    #[test]
    fn test_gpt52_minimal_normalized_to_low() {
        let mut body = json!({"model":"gpt-5.2","reasoning":{"effort":"minimal"}});
        normalize_reasoning_effort(&mut body);
        assert_eq!(body["reasoning"]["effort"], "low");

        let mut body = json!({"model":"gpt-5.3-codex","reasoning":{"effort":"minimal"}});
        normalize_reasoning_effort(&mut body);
        assert_eq!(body["reasoning"]["effort"], "low");

        // 其他模型不变
        let mut body = json!({"model":"gpt-5.1","reasoning":{"effort":"minimal"}});
        normalize_reasoning_effort(&mut body);
        assert_eq!(body["reasoning"]["effort"], "minimal");
    }

    #[test]
    fn test_reasoning_redirect_both_fields() {
        let mut mapping = HashMap::new();
        mapping.insert("low".to_string(), "xhigh".to_string());
        mapping.insert("medium".to_string(), "high".to_string());

        let mut body = json!({"reasoning":{"effort":"low"},"reasoning_effort":"medium"});
        let applied = apply_reasoning_redirect(&mut body, &mapping);
        assert_eq!(body["reasoning"]["effort"], "xhigh");
        assert_eq!(body["reasoning_effort"], "high");
        assert_eq!(applied.as_deref(), Some("xhigh"));
    }

    #[test]
    fn test_estimate_input_tokens() {
        let body = br#"{"messages":[{"content":"aaaaaaaaaaaaaaaa"}]}"#;
        // 16 个字符的内容 + "aaaa..."外的短字段，约 4+ tokens
        assert!(estimate_input_tokens(body) >= 4);
        assert_eq!(extract_model(b"{}"), "");
    }

    #[test]
    fn test_stream_flag() {
        assert!(extract_stream_flag(br#"{"stream":true}"#));
        assert!(!extract_stream_flag(br#"{"stream":false}"#));
        assert!(!extract_stream_flag(b"{}"));
    }
}
