//! 调度与故障转移的端到端场景

mod common;

use common::{add_channel, body_text, channel, harness, post_json};
use llm_gateway::config::ApiType;
use serde_json::json;
use tower::util::ServiceExt;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// 单渠道 Key 跳过：熔断中的 Key 被绕过，请求只带好 Key 上游打一次
#[tokio::test]
async fn test_suspended_key_is_skipped() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/responses"))
        .and(header("Authorization", "Bearer rk-good"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "object": "response",
            "model": "gpt-5.2",
            "output": [],
            "usage": {"input_tokens": 1, "output_tokens": 1},
        })))
        .expect(1)
        .mount(&server)
        .await;

    let h = harness(|_| {});
    add_channel(
        &h,
        ApiType::Responses,
        channel("responses", &[&server.uri()], &["rk-suspended", "rk-good"]),
    );

    // windowSize=3, threshold=0.5：三次失败后 rk-suspended 软熔断
    for _ in 0..3 {
        h.state
            .metrics
            .record_failure_with_status(&server.uri(), "rk-suspended", 500);
    }

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

    // 上游恰好收到一次请求，且带的是 rk-good（expect(1) + header 匹配共同保证）
    server.verify().await;
}

/// 渠道内多 URL 故障转移：BAD 返回 429 后在 GOOD 上重试成功
#[tokio::test]
async fn test_multi_url_failover_within_channel() {
    let bad = MockServer::start().await;
    let good = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/responses"))
        .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
        .expect(1)
        .mount(&bad)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/responses"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({
                "object": "response",
                "model": "gpt-5.2",
                "output": [{"type":"message","content":[{"type":"output_text","text":"from-good"}]}],
                "usage": {"input_tokens": 2, "output_tokens": 3},
            })),
        )
        .expect(1)
        .mount(&good)
        .await;

    let h = harness(|_| {});
    add_channel(
        &h,
        ApiType::Responses,
        channel("responses", &[&bad.uri(), &good.uri()], &["rk1"]),
    );

    let mut request = post_json("/v1/responses", json!({"model": "gpt-5.2", "input": []}));
    request
        .headers_mut()
        .insert("Conversation_id", "conv_baseurl_failover".parse().unwrap());

    let response = h.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), 200);
    let body = body_text(response).await;
    assert!(body.contains("from-good"));

    bad.verify().await;
    good.verify().await;
}

/// 探测模式：所有 Key 均软熔断时调度器仍返回一个槽位
#[tokio::test]
async fn test_probe_mode_lets_traffic_through() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/responses"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "object": "response",
            "model": "gpt-5.2",
            "output": [],
            "usage": {"input_tokens": 1, "output_tokens": 1},
        })))
        .expect(1)
        .mount(&server)
        .await;

    let h = harness(|_| {});
    add_channel(
        &h,
        ApiType::Responses,
        channel("responses", &[&server.uri()], &["rk-only"]),
    );
    for _ in 0..3 {
        h.state
            .metrics
            .record_failure_with_status(&server.uri(), "rk-only", 500);
    }
    assert!(h
        .state
        .metrics
        .should_suspend_key(&server.uri(), "rk-only"));

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

    // 探测成功后熔断解除
    assert!(!h
        .state
        .metrics
        .should_suspend_key(&server.uri(), "rk-only"));
}

/// 空渠道池返回稳定的 503 错误码
#[tokio::test]
async fn test_empty_pool_returns_503_with_code() {
    let h = harness(|_| {});
    let response = h
        .router
        .clone()
        .oneshot(post_json(
            "/v1/responses",
            json!({"model": "gpt-5.2", "input": []}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), 503);
    let body = body_text(response).await;
    assert!(body.contains("NO_RESPONSES_UPSTREAM"));
}

/// 会话亲和：同一 Conversation_id 的请求粘在同一槽位
#[tokio::test]
async fn test_affinity_stickiness_across_requests() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/responses"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "object": "response",
            "model": "gpt-5.2",
            "output": [],
            "usage": {"input_tokens": 1, "output_tokens": 1},
        })))
        .mount(&server)
        .await;

    let h = harness(|_| {});
    add_channel(
        &h,
        ApiType::Responses,
        channel("responses", &[&server.uri()], &["rk-a", "rk-b"]),
    );

    for _ in 0..2 {
        let mut request = post_json("/v1/responses", json!({"model": "gpt-5.2", "input": []}));
        request
            .headers_mut()
            .insert("Conversation_id", "conv-sticky".parse().unwrap());
        let response = h.router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), 200);
    }

    // 两次请求都应打在第一个 Key 上
    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);
    for received in &requests {
        assert_eq!(
            received.headers.get("authorization").unwrap(),
            "Bearer rk-a"
        );
    }
    assert_eq!(
        h.state
            .scheduler
            .affinity()
            .get_preferred_slot(ApiType::Responses, "conv-sticky"),
        Some((0, Some(0)))
    );
}
