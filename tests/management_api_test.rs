//! 管理端接口与鉴权

mod common;

use common::{add_channel, body_text, channel, harness, post_json};
use llm_gateway::config::ApiType;
use serde_json::json;
use tower::util::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn get(uri: &str) -> axum::http::Request<axum::body::Body> {
    axum::http::Request::builder()
        .method("GET")
        .uri(uri)
        .body(axum::body::Body::empty())
        .expect("request")
}

/// 渠道 CRUD 全流程
#[tokio::test]
async fn test_channel_crud_roundtrip() {
    let h = harness(|_| {});

    // 创建
    let response = h
        .router
        .clone()
        .oneshot(post_json(
            "/api/messages/channels",
            json!({
                "name": "primary",
                "baseUrls": ["https://upstream.example.com"],
                "apiKeys": ["sk-1", "sk-2"],
                "serviceType": "claude",
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    // 列表含脱敏 Key
    let response = h
        .router
        .clone()
        .oneshot(get("/api/messages/channels"))
        .await
        .unwrap();
    let body = body_text(response).await;
    assert!(body.contains("primary"));
    assert!(!body.contains("\"sk-1\""));
    assert!(body.contains("keyMask"));

    // 越界更新报错
    let response = h
        .router
        .clone()
        .oneshot(
            axum::http::Request::builder()
                .method("PUT")
                .uri("/api/messages/channels/9")
                .header("content-type", "application/json")
                .body(axum::body::Body::from(
                    json!({"name":"x","serviceType":"claude"}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    assert!(body_text(response).await.contains("error"));

    // 删除
    let response = h
        .router
        .clone()
        .oneshot(
            axum::http::Request::builder()
                .method("DELETE")
                .uri("/api/messages/channels/0")
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
}

/// Key 禁用与元信息
#[tokio::test]
async fn test_key_meta_disable_enable() {
    let h = harness(|_| {});
    add_channel(
        &h,
        ApiType::Messages,
        channel("claude", &["https://u.example.com"], &["sk-1"]),
    );

    let response = h
        .router
        .clone()
        .oneshot(
            axum::http::Request::builder()
                .method("PUT")
                .uri("/api/messages/channels/0/keys/0/meta")
                .header("content-type", "application/json")
                .body(axum::body::Body::from(
                    json!({"disabled": true, "description": "备用"}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert!(h.state.config.get_config().messages.channels[0].is_api_key_disabled("sk-1"));

    // 恢复启用且描述为空 -> 元信息条目移除
    let response = h
        .router
        .clone()
        .oneshot(
            axum::http::Request::builder()
                .method("PUT")
                .uri("/api/messages/channels/0/keys/0/meta")
                .header("content-type", "application/json")
                .body(axum::body::Body::from(
                    json!({"disabled": false, "description": ""}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let config = h.state.config.get_config();
    assert!(config.messages.channels[0].api_key_meta.is_empty());
}

/// 请求日志查询与重置
#[tokio::test]
async fn test_logs_query_and_reset() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/responses"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "object": "response",
            "output": [],
            "usage": {"input_tokens": 1, "output_tokens": 1},
        })))
        .mount(&server)
        .await;

    let h = harness(|_| {});
    add_channel(
        &h,
        ApiType::Responses,
        channel("responses", &[&server.uri()], &["rk1"]),
    );

    for _ in 0..3 {
        let response = h
            .router
            .clone()
            .oneshot(post_json(
                "/v1/responses",
                json!({"model": "gpt-5.2", "input": []}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
    }

    let response = h
        .router
        .clone()
        .oneshot(get("/api/responses/logs?limit=2&offset=0"))
        .await
        .unwrap();
    let body = body_text(response).await;
    let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(parsed["total"], 3);
    assert_eq!(parsed["totalRequests"], 3);
    assert_eq!(parsed["logs"].as_array().unwrap().len(), 2);

    // 重置 Key 后日志被隐藏、计数清零
    let response = h
        .router
        .clone()
        .oneshot(post_json("/api/responses/channels/0/keys/0/reset", json!({})))
        .await
        .unwrap();
    let body = body_text(response).await;
    let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(parsed["success"], true);
    assert_eq!(parsed["count"], 3);

    assert_eq!(
        h.state.request_logs.get_total_request_count(ApiType::Responses),
        0
    );
}

/// 包装 2xx 余额不足：探测接口报告失败并硬熔断到本地 0 点
#[tokio::test]
async fn test_validate_key_wrapped_2xx_insufficient_balance() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/responses"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "statusCode": 403,
            "errorMessage": "上游拒绝",
            "responseBody": "{\"error\":\"API Key额度不足\"}",
        })))
        .mount(&server)
        .await;

    let h = harness(|_| {});

    let response = h
        .router
        .clone()
        .oneshot(post_json(
            "/api/responses/validate-key",
            json!({"apiKey": "rk-broke", "baseUrl": server.uri()}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let parsed: serde_json::Value =
        serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(parsed["success"], false);
    assert_eq!(parsed["statusCode"], 403);

    // Key 已被硬熔断（到下一个本地 0 点）
    assert!(h
        .state
        .metrics
        .is_key_hard_suspended(&server.uri(), "rk-broke"));
    let snap = h
        .state
        .metrics
        .get_key_metrics(&server.uri(), "rk-broke")
        .unwrap();
    assert_eq!(snap.suspend_reason, "insufficient_balance");
    assert!(snap.suspend_until.is_some());
}

/// 鉴权：设置 PROXY_ACCESS_KEY 后缺失/错误密钥 401，/health 豁免
#[tokio::test]
async fn test_access_key_auth() {
    let h = harness(|env| {
        env.proxy_access_key = "secret-key".to_string();
    });

    let response = h
        .router
        .clone()
        .oneshot(get("/api/messages/channels"))
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    let mut request = get("/api/messages/channels");
    request
        .headers_mut()
        .insert("x-api-key", "secret-key".parse().unwrap());
    let response = h.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), 200);

    // 健康检查不鉴权
    let response = h.router.clone().oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), 200);
}

/// 全局映射配置接口
#[tokio::test]
async fn test_global_mapping_endpoints() {
    let h = harness(|_| {});

    let response = h
        .router
        .clone()
        .oneshot(
            axum::http::Request::builder()
                .method("PUT")
                .uri("/api/global/reasoning-mapping")
                .header("content-type", "application/json")
                .body(axum::body::Body::from(
                    json!({"mapping": {"LOW": "XHIGH"}}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let response = h
        .router
        .clone()
        .oneshot(get("/api/global/reasoning-mapping"))
        .await
        .unwrap();
    let parsed: serde_json::Value =
        serde_json::from_str(&body_text(response).await).unwrap();
    // 键值均小写化
    assert_eq!(parsed["mapping"]["low"], "xhigh");
}

/// 仪表盘聚合返回渠道、指标与活跃度
#[tokio::test]
async fn test_dashboard_shape() {
    let h = harness(|_| {});
    add_channel(
        &h,
        ApiType::Gemini,
        channel("gemini", &["https://g.example.com"], &["gk-1"]),
    );

    let response = h
        .router
        .clone()
        .oneshot(get("/api/gemini/dashboard"))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let parsed: serde_json::Value =
        serde_json::from_str(&body_text(response).await).unwrap();
    let channels = parsed["channels"].as_array().unwrap();
    assert_eq!(channels.len(), 1);
    assert!(channels[0]["metrics"]["keyMetrics"].is_array());
    assert_eq!(
        channels[0]["activity"]["segments"].as_array().unwrap().len(),
        150
    );
}
