//! # Key 熔断日志存储
//!
//! 保存"某 Key 的最后一次失败日志"（按 apiType + keyId 覆盖更新），
//! 仅用于管理端查询展示，不参与转发链路。序列化后的日志上限 8 KiB，
//! 超限时对响应体/错误信息做 UTF-8 安全的中间截断。

use crate::config::ApiType;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::RwLock;

const MAX_KEY_CIRCUIT_LOG_BYTES: usize = 8 * 1024;
const TRUNCATE_MARKER: &str = "\n...(中间省略)...\n";

/// 熔断日志条目（序列化为存储的 JSON 字符串）
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct KeyCircuitLog {
    timestamp: DateTime<Utc>,
    base_url: String,
    #[serde(skip_serializing_if = "is_zero")]
    status_code: u16,
    #[serde(skip_serializing_if = "String::is_empty")]
    error_message: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    response_body: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    truncated: bool,
}

fn is_zero(v: &u16) -> bool {
    *v == 0
}

/// 构建熔断日志 JSON，总长不超过 8 KiB。
///
/// 预算初始按 响应体:错误信息 = 80:20 划分，超限时每轮乘 0.8 重试，
/// 最多 6 轮；最终兜底对整个字符串做截断（JSON 转义可能导致超长，
/// 此时不再保证 JSON 合法性，但绝不超过上限）。
#[must_use]
pub fn build_key_circuit_log_json(
    base_url: &str,
    status_code: u16,
    response_body: &str,
    error_message: &str,
) -> String {
    let mut entry = KeyCircuitLog {
        timestamp: Utc::now(),
        base_url: base_url.to_string(),
        status_code,
        error_message: String::new(),
        response_body: String::new(),
        truncated: false,
    };

    let overhead = serde_json::to_string(&entry).map(|s| s.len()).unwrap_or(0);
    let available = MAX_KEY_CIRCUIT_LOG_BYTES.saturating_sub(overhead);

    let mut resp_budget = (available as f64 * 0.8) as usize;
    let mut err_budget = available.saturating_sub(resp_budget);

    let (resp_trunc, resp_did) = truncate_middle_utf8(response_body, resp_budget);
    let (err_trunc, err_did) = truncate_middle_utf8(error_message, err_budget);
    entry.response_body = resp_trunc;
    entry.error_message = err_trunc;
    entry.truncated = resp_did || err_did;

    for _ in 0..6 {
        if let Ok(serialized) = serde_json::to_string(&entry) {
            if serialized.len() <= MAX_KEY_CIRCUIT_LOG_BYTES {
                return serialized;
            }
        }
        entry.truncated = true;
        resp_budget = (resp_budget as f64 * 0.8) as usize;
        err_budget = (err_budget as f64 * 0.8) as usize;
        entry.response_body = truncate_middle_utf8(response_body, resp_budget).0;
        entry.error_message = truncate_middle_utf8(error_message, err_budget).0;
    }

    let serialized = serde_json::to_string(&entry).unwrap_or_default();
    truncate_middle_utf8(&serialized, MAX_KEY_CIRCUIT_LOG_BYTES).0
}

/// UTF-8 安全的中间截断；返回 (结果, 是否发生截断)
fn truncate_middle_utf8(s: &str, max_bytes: usize) -> (String, bool) {
    if max_bytes == 0 {
        return (String::new(), !s.is_empty());
    }
    if s.len() <= max_bytes {
        return (s.to_string(), false);
    }

    let marker = TRUNCATE_MARKER;
    if max_bytes <= marker.len() {
        let mut out = &marker[..max_bytes.min(marker.len())];
        while !out.is_empty() && !marker.is_char_boundary(out.len()) {
            out = &out[..out.len() - 1];
        }
        return (out.to_string(), true);
    }

    let keep = max_bytes - marker.len();
    let head_bytes = keep / 2;
    let tail_bytes = keep - head_bytes;

    let head = safe_utf8_prefix(s, head_bytes);
    let tail = safe_utf8_suffix(s, tail_bytes);
    (format!("{head}{marker}{tail}"), true)
}

fn safe_utf8_prefix(s: &str, n: usize) -> &str {
    if n >= s.len() {
        return s;
    }
    let mut end = n;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

fn safe_utf8_suffix(s: &str, n: usize) -> &str {
    if n >= s.len() {
        return s;
    }
    let mut start = s.len() - n;
    while start < s.len() && !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

#[derive(Debug, Clone)]
struct Entry {
    log: String,
    updated_at: DateTime<Utc>,
}

/// 纯内存 Key 熔断日志存储（TTL 过期，默认 7 天）
pub struct KeyCircuitLogStore {
    ttl: chrono::Duration,
    map: RwLock<HashMap<String, Entry>>,
}

impl KeyCircuitLogStore {
    #[must_use]
    pub fn new(ttl: chrono::Duration) -> Self {
        let ttl = if ttl <= chrono::Duration::zero() {
            chrono::Duration::days(7)
        } else {
            ttl
        };
        Self {
            ttl,
            map: RwLock::new(HashMap::new()),
        }
    }

    fn entry_key(api_type: ApiType, key_id: &str) -> String {
        format!("{api_type}|{key_id}")
    }

    /// 覆盖写入最新的失败日志
    pub fn upsert(&self, api_type: ApiType, key_id: &str, log: String) {
        if key_id.is_empty() {
            return;
        }
        let now = Utc::now();
        if let Ok(mut map) = self.map.write() {
            Self::cleanup_locked(&mut map, self.ttl, now);
            map.insert(
                Self::entry_key(api_type, key_id),
                Entry {
                    log,
                    updated_at: now,
                },
            );
        }
    }

    /// 查询最新的失败日志；过期条目被移除并返回 None
    #[must_use]
    pub fn get(&self, api_type: ApiType, key_id: &str) -> Option<String> {
        if key_id.is_empty() {
            return None;
        }
        let now = Utc::now();
        let mut map = self.map.write().ok()?;
        Self::cleanup_locked(&mut map, self.ttl, now);
        let key = Self::entry_key(api_type, key_id);
        match map.get(&key) {
            Some(entry) if now - entry.updated_at <= self.ttl => Some(entry.log.clone()),
            Some(_) => {
                map.remove(&key);
                None
            }
            None => None,
        }
    }

    fn cleanup_locked(map: &mut HashMap<String, Entry>, ttl: chrono::Duration, now: DateTime<Utc>) {
        let cutoff = now - ttl;
        map.retain(|_, entry| entry.updated_at >= cutoff);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_overwrites() {
        let store = KeyCircuitLogStore::new(chrono::Duration::days(7));
        store.upsert(ApiType::Messages, "k1", "first".to_string());
        store.upsert(ApiType::Messages, "k1", "second".to_string());
        assert_eq!(store.get(ApiType::Messages, "k1").unwrap(), "second");
        // 不同 apiType 隔离
        assert!(store.get(ApiType::Gemini, "k1").is_none());
    }

    #[test]
    fn test_build_json_under_cap_stays_valid() {
        let log = build_key_circuit_log_json(
            "https://upstream.example.com",
            429,
            r#"{"error":"rate limited"}"#,
            "too many requests",
        );
        assert!(log.len() <= MAX_KEY_CIRCUIT_LOG_BYTES);
        let parsed: serde_json::Value = serde_json::from_str(&log).unwrap();
        assert_eq!(parsed["statusCode"], 429);
        assert_eq!(parsed["responseBody"], r#"{"error":"rate limited"}"#);
        assert!(parsed.get("truncated").is_none());
    }

    #[test]
    fn test_build_json_truncates_oversized_body() {
        let huge_body = "响应体内容".repeat(2000);
        let log = build_key_circuit_log_json("https://u.example.com", 500, &huge_body, "err");
        assert!(log.len() <= MAX_KEY_CIRCUIT_LOG_BYTES);
        let parsed: serde_json::Value = serde_json::from_str(&log).unwrap();
        assert_eq!(parsed["truncated"], true);
        let body = parsed["responseBody"].as_str().unwrap();
        assert!(body.contains("...(中间省略)..."));
        // 头尾都应保留原始内容
        assert!(body.starts_with("响应体"));
    }

    #[test]
    fn test_truncate_middle_utf8_boundary_safe() {
        let s = "中文字符串测试内容";
        for max in 0..s.len() + 2 {
            let (out, _) = truncate_middle_utf8(s, max);
            assert!(out.len() <= max || s.len() <= max);
            // 结果必须是合法 UTF-8（String 类型本身保证，这里验证无 panic）
            let _ = out.chars().count();
        }
    }

    #[test]
    fn test_truncate_keeps_head_and_tail() {
        let s = format!("{}{}{}", "A".repeat(100), "B".repeat(9000), "C".repeat(100));
        let (out, did) = truncate_middle_utf8(&s, 1000);
        assert!(did);
        assert!(out.starts_with('A'));
        assert!(out.ends_with('C'));
        assert!(out.len() <= 1000);
    }
}
