//! Key 标识哈希
//!
//! 对外暴露的 Key 标识一律使用 SHA-256 前 16 位十六进制，
//! 避免在指标、日志与管理端泄露原始 API Key。

use sha2::{Digest, Sha256};

/// 生成指标键：`hash16(baseURL + "|" + apiKey)`。
///
/// 同一个 Key 在不同 BaseURL 下拥有独立的指标记录。
pub fn metrics_key(base_url: &str, api_key: &str) -> String {
    hash16(&format!("{base_url}|{api_key}"))
}

/// 生成 Key 标识：`hash16(apiKey)`，用于请求日志与熔断日志的外部标识。
pub fn hash_api_key(api_key: &str) -> String {
    hash16(api_key)
}

fn hash16(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let hex = digest
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<String>();
    hex[..16].to_string()
}
