//! 敏感信息脱敏

use std::collections::HashMap;

/// 脱敏 API Key（用于显示与日志）
pub fn mask_api_key(api_key: &str) -> String {
    if api_key.len() > 8 {
        format!(
            "{}...{}",
            &api_key[..4],
            &api_key[api_key.len().saturating_sub(4)..]
        )
    } else if !api_key.is_empty() {
        "***".to_string()
    } else {
        "<empty>".to_string()
    }
}

/// 掩码 user_id（保护隐私）
///
/// 使用字符切片确保 UTF-8 安全。
pub fn mask_user_id(user_id: &str) -> String {
    if user_id.is_empty() {
        return "***".to_string();
    }
    let runes: Vec<char> = user_id.chars().collect();
    let n = runes.len();
    let take = |range: std::ops::Range<usize>| runes[range].iter().collect::<String>();
    match n {
        0..=4 => format!("{}***", take(0..1)),
        5..=8 => format!("{}***{}", take(0..2), take(n - 1..n)),
        9..=16 => format!("{}***{}", take(0..3), take(n - 2..n)),
        _ => format!("{}***{}", take(0..8), take(n - 4..n)),
    }
}

const SENSITIVE_HEADERS: [&str; 7] = [
    "authorization",
    "proxy-authorization",
    "x-api-key",
    "api-key",
    "x-goog-api-key",
    "cookie",
    "set-cookie",
];

/// 对请求头做敏感信息脱敏，保留前后少量字符便于排障
pub fn mask_sensitive_headers(headers: &HashMap<String, String>) -> HashMap<String, String> {
    headers
        .iter()
        .map(|(name, value)| {
            let lowered = name.to_ascii_lowercase();
            if SENSITIVE_HEADERS.contains(&lowered.as_str()) {
                let masked = if value.len() > 16 {
                    format!(
                        "{}...{}",
                        &value[..8],
                        &value[value.len().saturating_sub(4)..]
                    )
                } else {
                    "****".to_string()
                };
                (name.clone(), masked)
            } else {
                (name.clone(), value.clone())
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_api_key() {
        assert_eq!(mask_api_key("sk-abcdefghijklmn"), "sk-a...klmn");
        assert_eq!(mask_api_key("short"), "***");
        assert_eq!(mask_api_key(""), "<empty>");
    }

    #[test]
    fn test_mask_user_id_utf8_safe() {
        assert_eq!(mask_user_id(""), "***");
        assert_eq!(mask_user_id("abc"), "a***");
        assert_eq!(mask_user_id("会话标识测试"), "会***识");
        let long = mask_user_id("conversation-0123456789abcdef");
        assert!(long.starts_with("conversa"));
        assert!(long.ends_with("cdef"));
    }

    #[test]
    fn test_mask_sensitive_headers() {
        let mut headers = HashMap::new();
        headers.insert(
            "Authorization".to_string(),
            "Bearer sk-0123456789abcdef".to_string(),
        );
        headers.insert("Content-Type".to_string(), "application/json".to_string());
        let masked = mask_sensitive_headers(&headers);
        assert!(masked["Authorization"].contains("..."));
        assert_eq!(masked["Content-Type"], "application/json");
    }
}
