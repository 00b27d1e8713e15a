//! # Key 探活
//!
//! 管理端"检测"按钮：对 (baseURL, apiKey) 发起一次最小的真实请求，
//! 识别包装的 2xx 错误与余额不足。发现余额不足时立即硬熔断到本地
//! 0 点，避免后续无意义重试。

use crate::config::ApiType;
use crate::management::handlers::{error_response, parse_api};
use crate::proxy::balance::{
    is_insufficient_balance_body, looks_like_wrapped_upstream_error, parse_wrapped_upstream_error,
};
use crate::proxy::handler::build_upstream_url;
use crate::proxy::AppState;
use crate::utils::next_local_midnight;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateKeyPayload {
    pub api_key: String,
    pub base_url: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateKeyResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_error: Option<String>,
}

fn probe_body(api_type: ApiType) -> serde_json::Value {
    match api_type {
        ApiType::Messages => json!({
            "model": "claude-3-5-haiku-20241022",
            "max_tokens": 1,
            "messages": [{"role": "user", "content": "你好"}],
        }),
        ApiType::Responses => json!({
            "model": "gpt-5.2",
            "input": [{
                "type": "message",
                "role": "user",
                "content": [{"type": "input_text", "text": "你好"}],
            }],
            "stream": true,
        }),
        ApiType::Gemini => json!({
            "contents": [{"role": "user", "parts": [{"text": "你好"}]}],
        }),
    }
}

fn probe_suffix(api_type: ApiType) -> &'static str {
    match api_type {
        ApiType::Messages => "/messages",
        ApiType::Responses => "/responses",
        ApiType::Gemini => "/models/gemini-2.0-flash:generateContent",
    }
}

pub async fn validate_key(
    State(state): State<Arc<AppState>>,
    Path(api): Path<String>,
    Json(payload): Json<ValidateKeyPayload>,
) -> Response {
    let api_type = match parse_api(&api) {
        Ok(api_type) => api_type,
        Err(resp) => return resp,
    };
    let api_key = payload.api_key.trim().to_string();
    let base_url = payload.base_url.trim().to_string();
    if api_key.is_empty() || base_url.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "Invalid request body");
    }

    let url = build_upstream_url(&base_url, api_type, probe_suffix(api_type));
    let client = state.clients.standard_client(Duration::from_secs(10), false);
    let mut request = client
        .post(&url)
        .header("Content-Type", "application/json")
        .json(&probe_body(api_type));
    request = match api_type {
        ApiType::Messages => request
            .header("x-api-key", &api_key)
            .header("anthropic-version", "2023-06-01"),
        ApiType::Responses => request.header("Authorization", format!("Bearer {api_key}")),
        ApiType::Gemini => request.header("x-goog-api-key", &api_key),
    };

    let response = match request.send().await {
        Ok(response) => response,
        Err(err) => {
            return Json(ValidateKeyResponse {
                success: false,
                status_code: Some(502),
                upstream_error: Some(format!("上游错误: {err}")),
            })
            .into_response();
        }
    };

    let status = response.status().as_u16();
    // 只取前 8 KiB 做判定，避免整读流式响应
    let peek = match response.bytes().await {
        Ok(bytes) => {
            let limit = bytes.len().min(8 * 1024);
            bytes.slice(..limit)
        }
        Err(_) => bytes::Bytes::new(),
    };
    let peek_text = String::from_utf8_lossy(&peek).trim().to_string();
    let insufficient = is_insufficient_balance_body(&peek);

    if insufficient {
        let until = next_local_midnight(Utc::now());
        state
            .metrics
            .suspend_key_until(&base_url, &api_key, until, "insufficient_balance");
        state.config.set_key_cooldown(&api_key, until);
    }

    if !(200..300).contains(&status) {
        return Json(ValidateKeyResponse {
            success: false,
            status_code: Some(status),
            upstream_error: Some(summarize_upstream_error(status, &peek_text)),
        })
        .into_response();
    }

    if looks_like_wrapped_upstream_error(&peek_text) {
        // 2xx 但 body 是错误封装：按封装内的 statusCode 返回，缺省 502
        let (wrapped_status, summary) = parse_wrapped_upstream_error(&peek_text);
        let effective = if wrapped_status == 0 { 502 } else { wrapped_status };
        return Json(ValidateKeyResponse {
            success: false,
            status_code: Some(effective),
            upstream_error: Some(summarize_upstream_error(effective, &summary)),
        })
        .into_response();
    }

    Json(ValidateKeyResponse {
        success: true,
        status_code: None,
        upstream_error: None,
    })
    .into_response()
}

fn summarize_upstream_error(status_code: u16, raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return "上游错误".to_string();
    }
    const MAX_CHARS: usize = 512;
    let shortened: String = trimmed.chars().take(MAX_CHARS).collect();
    let suffix = if trimmed.chars().count() > MAX_CHARS {
        "…"
    } else {
        ""
    };
    format!("上游错误: HTTP {status_code} - {shortened}{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_suffix_per_api() {
        assert_eq!(probe_suffix(ApiType::Messages), "/messages");
        assert_eq!(probe_suffix(ApiType::Responses), "/responses");
        assert!(probe_suffix(ApiType::Gemini).contains("generateContent"));
    }

    #[test]
    fn test_summarize_truncates() {
        let long = "x".repeat(2000);
        let summary = summarize_upstream_error(500, &long);
        assert!(summary.chars().count() < 600);
        assert!(summary.ends_with('…'));
        assert_eq!(summarize_upstream_error(500, "  "), "上游错误");
    }
}
