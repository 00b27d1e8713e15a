//! 集成测试公共脚手架

use llm_gateway::config::{ApiType, UpstreamChannel};
use llm_gateway::server::build_router;
use llm_gateway::{AppState, EnvConfig};
use serde_json::json;
use std::sync::Arc;

pub struct TestHarness {
    pub state: Arc<AppState>,
    pub router: axum::Router,
    _config_dir: tempfile::TempDir,
}

/// 构建测试用的应用状态与路由（独立临时配置文件）
pub fn harness(overrides: impl FnOnce(&mut EnvConfig)) -> TestHarness {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut env = EnvConfig {
        config_path: dir
            .path()
            .join("config.json")
            .to_string_lossy()
            .to_string(),
        metrics_window_size: 3,
        metrics_failure_threshold: 0.5,
        ..EnvConfig::default()
    };
    overrides(&mut env);
    let state = AppState::new(env).expect("app state");
    let router = build_router(Arc::clone(&state));
    TestHarness {
        state,
        router,
        _config_dir: dir,
    }
}

/// 构建一个渠道配置
pub fn channel(service_type: &str, base_urls: &[&str], api_keys: &[&str]) -> UpstreamChannel {
    serde_json::from_value(json!({
        "name": "test-channel",
        "baseUrls": base_urls,
        "apiKeys": api_keys,
        "serviceType": service_type,
    }))
    .expect("channel json")
}

/// 向测试状态添加渠道
pub fn add_channel(harness: &TestHarness, api_type: ApiType, ch: UpstreamChannel) {
    harness
        .state
        .config
        .add_channel(api_type, ch)
        .expect("add channel");
}

/// 构造 POST 请求
pub fn post_json(uri: &str, body: serde_json::Value) -> axum::http::Request<axum::body::Body> {
    axum::http::Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(axum::body::Body::from(body.to_string()))
        .expect("request")
}

/// 读取响应 body 文本
pub async fn body_text(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    String::from_utf8_lossy(&bytes).to_string()
}
