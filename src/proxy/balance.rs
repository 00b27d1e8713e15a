//! # 上游错误体识别
//!
//! 两类特殊响应的识别：
//! - "包装的 2xx 错误"：HTTP 2xx 但 JSON body 携带
//!   statusCode/errorMessage/responseBody 的错误封装；
//! - "余额不足"：命中后对 Key 硬熔断到本地 0 点。
//!
//! 余额匹配使用窄的子串组合，不要在无度量的情况下放宽。

use serde_json::Value;

/// body 是否呈现"包装的 2xx 错误"结构
#[must_use]
pub fn looks_like_wrapped_upstream_error(body: &str) -> bool {
    let trimmed = body.trim_start();
    if !trimmed.starts_with('{') {
        return false;
    }
    let Ok(value) = serde_json::from_str::<Value>(trimmed) else {
        return false;
    };
    let Some(obj) = value.as_object() else {
        return false;
    };
    obj.contains_key("statusCode")
        || obj.contains_key("errorMessage")
        || obj.contains_key("responseBody")
}

/// 从包装错误中解析 (statusCode, 摘要)；statusCode 缺失时为 0
#[must_use]
pub fn parse_wrapped_upstream_error(body: &str) -> (u16, String) {
    let Ok(value) = serde_json::from_str::<Value>(body) else {
        return (0, body.to_string());
    };
    let code = value
        .get("statusCode")
        .and_then(Value::as_i64)
        .and_then(|c| u16::try_from(c).ok())
        .unwrap_or(0);
    (code, extract_wrapped_error_summary(&value, body))
}

fn extract_wrapped_error_summary(value: &Value, fallback: &str) -> String {
    for field in ["errorMessage", "responseBody", "error"] {
        if let Some(text) = value.get(field).and_then(Value::as_str) {
            if !text.trim().is_empty() {
                return text.to_string();
            }
        }
    }
    fallback.to_string()
}

/// 文本是否命中"余额不足"关键词
fn looks_like_insufficient_balance_text(msg: &str) -> bool {
    let lowered = msg.to_lowercase();
    if lowered.contains("余额不足") || lowered.contains("额度不足") || lowered.contains("积分不足")
    {
        return true;
    }
    if lowered.contains("insufficient") && lowered.contains("balance") {
        return true;
    }
    if lowered.contains("insufficient")
        && (lowered.contains("quota") || lowered.contains("credit"))
    {
        return true;
    }
    false
}

/// 标准错误响应的 error.message 是否命中余额不足
fn error_message_matches(body: &[u8]) -> bool {
    let Ok(value) = serde_json::from_slice::<Value>(body) else {
        return false;
    };
    if let Some(message) = value
        .get("error")
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
    {
        return looks_like_insufficient_balance_text(message);
    }
    false
}

/// body 是否表明"余额不足"。
///
/// 同时覆盖"2xx 但 body 是错误封装"的场景：从 responseBody /
/// errorMessage 中提取后再匹配；body 非 JSON 或被截断时按关键词兜底。
#[must_use]
pub fn is_insufficient_balance_body(body: &[u8]) -> bool {
    if error_message_matches(body) {
        return true;
    }

    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    if text.is_empty() {
        return false;
    }

    if looks_like_wrapped_upstream_error(text) {
        if let Ok(value) = serde_json::from_str::<Value>(text) {
            if let Some(inner) = value.get("responseBody").and_then(Value::as_str) {
                if error_message_matches(inner.as_bytes())
                    || looks_like_insufficient_balance_text(inner)
                {
                    return true;
                }
            }
            if let Some(message) = value.get("errorMessage").and_then(Value::as_str) {
                if looks_like_insufficient_balance_text(message) {
                    return true;
                }
            }
        }
    }

    looks_like_insufficient_balance_text(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrapped_error_detected() {
        assert!(looks_like_wrapped_upstream_error(
            r#"{"statusCode":403,"errorMessage":"denied"}"#
        ));
        assert!(looks_like_wrapped_upstream_error(r#"{"responseBody":"x"}"#));
        assert!(!looks_like_wrapped_upstream_error(r#"{"ok":true}"#));
        assert!(!looks_like_wrapped_upstream_error("plain text"));
    }

    #[test]
    fn test_parse_wrapped_error_status_and_summary() {
        let (code, summary) =
            parse_wrapped_upstream_error(r#"{"statusCode":403,"errorMessage":"denied"}"#);
        assert_eq!(code, 403);
        assert_eq!(summary, "denied");

        let (code, _) = parse_wrapped_upstream_error(r#"{"errorMessage":"x"}"#);
        assert_eq!(code, 0);
    }

    #[test]
    fn test_insufficient_balance_error_message() {
        let body = br#"{"error":{"message":"Insufficient balance, please top up"}}"#;
        assert!(is_insufficient_balance_body(body));
        let body = br#"{"error":{"message":"insufficient quota for this key"}}"#;
        assert!(is_insufficient_balance_body(body));
    }

    #[test]
    fn test_insufficient_balance_chinese() {
        assert!(is_insufficient_balance_body("API Key额度不足".as_bytes()));
        assert!(is_insufficient_balance_body("账户余额不足".as_bytes()));
        assert!(is_insufficient_balance_body("积分不足".as_bytes()));
    }

    #[test]
    fn test_wrapped_envelope_inner_balance() {
        let body = r#"{"statusCode":403,"errorMessage":"err","responseBody":"{\"error\":\"API Key额度不足\"}"}"#;
        assert!(is_insufficient_balance_body(body.as_bytes()));
    }

    #[test]
    fn test_negative_cases() {
        assert!(!is_insufficient_balance_body(b"{\"ok\":true}"));
        assert!(!is_insufficient_balance_body(b"rate limit exceeded"));
        // "insufficient" 单独出现不命中
        assert!(!is_insufficient_balance_body(
            b"insufficient data for analysis"
        ));
    }
}
