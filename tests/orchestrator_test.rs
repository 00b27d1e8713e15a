//! 编排器行为：取消、预处理、流式归因

mod common;

use common::{add_channel, body_text, channel, harness, post_json};
use llm_gateway::config::ApiType;
use serde_json::json;
use std::time::Duration;
use tower::util::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// 客户端取消：请求中途断开后不计数、不写请求日志
#[tokio::test]
async fn test_client_cancellation_records_nothing() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/responses"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_delay(Duration::from_secs(5))
                .set_body_json(json!({"object": "response", "output": []})),
        )
        .mount(&server)
        .await;

    let h = harness(|_| {});
    add_channel(
        &h,
        ApiType::Responses,
        channel("responses", &[&server.uri()], &["rk1"]),
    );

    let router = h.router.clone();
    let task = tokio::spawn(async move {
        router
            .oneshot(post_json(
                "/v1/responses",
                json!({"model": "gpt-5.2", "input": []}),
            ))
            .await
    });
    tokio::time::sleep(Duration::from_millis(200)).await;
    task.abort();
    let _ = task.await;

    // 取消不是失败：指标零记录，日志为空
    assert!(h.state.metrics.get_key_metrics(&server.uri(), "rk1").is_none());
    assert_eq!(
        h.state.request_logs.get_total_request_count(ApiType::Responses),
        0
    );
    let page = h.state.request_logs.query(ApiType::Responses, 50, 0);
    assert_eq!(page.total, 0);
}

/// 空 signature 清洗：上游收到的 body 不再携带空 signature 字段
#[tokio::test]
async fn test_empty_signature_scrubbed_before_upstream() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "model": "claude-sonnet-4",
            "content": [{"type": "text", "text": "ok"}],
            "usage": {"input_tokens": 1, "output_tokens": 1},
        })))
        .mount(&server)
        .await;

    let h = harness(|_| {});
    add_channel(
        &h,
        ApiType::Messages,
        channel("claude", &[&server.uri()], &["sk-1"]),
    );

    let response = h
        .router
        .clone()
        .oneshot(post_json(
            "/v1/messages",
            json!({
                "model": "claude-sonnet-4",
                "messages": [{"role": "assistant", "content": [
                    {"type": "tool_use", "signature": "", "text": "x"}
                ]}],
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let upstream_body = String::from_utf8_lossy(&requests[0].body).to_string();
    assert!(!upstream_body.contains("signature"));
    assert!(upstream_body.contains("\"text\":\"x\""));
}

/// 思考强度重定向：minimal 先按模型规则归一为 low，再映射为 xhigh
#[tokio::test]
async fn test_reasoning_effort_redirection() {
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
    let mut mapping = std::collections::HashMap::new();
    mapping.insert("low".to_string(), "xhigh".to_string());
    h.state.config.set_global_reasoning_mapping(mapping).unwrap();

    let response = h
        .router
        .clone()
        .oneshot(post_json(
            "/v1/responses",
            json!({"model": "gpt-5.2", "reasoning": {"effort": "minimal"}}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let requests = server.received_requests().await.unwrap();
    let upstream_body = String::from_utf8_lossy(&requests[0].body).to_string();
    assert!(upstream_body.contains("\"effort\":\"xhigh\""));
}

/// 模型重定向：渠道映射优先于全局映射
#[tokio::test]
async fn test_model_redirection_channel_over_global() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "model": "channel-target",
            "content": [],
            "usage": {"input_tokens": 1, "output_tokens": 1},
        })))
        .mount(&server)
        .await;

    let h = harness(|_| {});
    let mut ch = channel("claude", &[&server.uri()], &["sk-1"]);
    ch.model_mapping
        .insert("claude-sonnet-4".to_string(), "channel-target".to_string());
    add_channel(&h, ApiType::Messages, ch);

    let mut global = std::collections::HashMap::new();
    global.insert("claude-sonnet-4".to_string(), "global-target".to_string());
    h.state.config.set_global_model_mapping(global).unwrap();

    let response = h
        .router
        .clone()
        .oneshot(post_json(
            "/v1/messages",
            json!({"model": "claude-sonnet-4", "messages": []}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let requests = server.received_requests().await.unwrap();
    let upstream_body = String::from_utf8_lossy(&requests[0].body).to_string();
    assert!(upstream_body.contains("\"model\":\"channel-target\""));
}

/// SSE 流式转发：事件原样转发、message_start 低值 input_tokens 被兜底，
/// 流结束后用量被归因
#[tokio::test]
async fn test_sse_stream_patches_usage_and_attributes() {
    let sse_body = concat!(
        "event: message_start\n",
        "data: {\"type\":\"message_start\",\"message\":{\"model\":\"claude-sonnet-4\",\"usage\":{\"input_tokens\":0,\"output_tokens\":0}}}\n",
        "\n",
        "event: content_block_delta\n",
        "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"hello\"}}\n",
        "\n",
        "event: message_delta\n",
        "data: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":7}}\n",
        "\n",
    );

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_raw(sse_body.as_bytes().to_vec(), "text/event-stream"),
        )
        .mount(&server)
        .await;

    let h = harness(|_| {});
    add_channel(
        &h,
        ApiType::Messages,
        channel("claude", &[&server.uri()], &["sk-1"]),
    );

    let response = h
        .router
        .clone()
        .oneshot(post_json(
            "/v1/messages",
            json!({
                "model": "claude-sonnet-4",
                "stream": true,
                "messages": [{"role": "user", "content": "tell me something interesting about rust"}],
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body = body_text(response).await;

    // 事件顺序保持，文本增量原样到达
    assert!(body.contains("event: message_start"));
    assert!(body.contains("text_delta"));
    // 低值 input_tokens 被估算值替换
    assert!(!body.contains("\"input_tokens\":0"));
    assert!(body.contains("input_tokens"));

    // 流结束后归因完成（异步回调，稍等片刻）
    tokio::time::sleep(Duration::from_millis(200)).await;
    let snap = h
        .state
        .metrics
        .get_key_metrics(&server.uri(), "sk-1")
        .expect("metrics recorded");
    assert_eq!(snap.success_count, 1);
    let page = h.state.request_logs.query(ApiType::Messages, 50, 0);
    assert_eq!(page.total, 1);
    assert_eq!(page.logs[0].output_tokens, 7);
    assert!(page.logs[0].success);
}

/// 终止性 4xx 原样透传并留痕
#[tokio::test]
async fn test_terminal_4xx_passthrough() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(
            ResponseTemplate::new(400)
                .set_body_json(json!({"error": {"message": "invalid request"}})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let h = harness(|_| {});
    add_channel(
        &h,
        ApiType::Messages,
        channel("claude", &[&server.uri()], &["sk-1"]),
    );

    let response = h
        .router
        .clone()
        .oneshot(post_json(
            "/v1/messages",
            json!({"model": "claude-sonnet-4", "messages": []}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body = body_text(response).await;
    assert!(body.contains("invalid request"));

    // 一次失败指标 + 一条请求日志
    let snap = h
        .state
        .metrics
        .get_key_metrics(&server.uri(), "sk-1")
        .expect("metrics");
    assert_eq!(snap.failure_count, 1);
    let page = h.state.request_logs.query(ApiType::Messages, 50, 0);
    assert_eq!(page.total, 1);
    assert!(!page.logs[0].success);
}

/// Gemini 流式端点：路径模型 + 工具调用占位签名注入
#[tokio::test]
async fn test_gemini_stream_injects_thought_signature() {
    let sse_body = concat!(
        "data: {\"candidates\":[{\"content\":{\"parts\":[{\"functionCall\":{\"name\":\"f\",\"args\":{}}}]}}],\"usageMetadata\":{\"promptTokenCount\":3,\"candidatesTokenCount\":4}}\n",
        "\n",
    );

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1beta/models/gemini-2.5-pro:streamGenerateContent"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_raw(sse_body.as_bytes().to_vec(), "text/event-stream"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let h = harness(|_| {});
    add_channel(
        &h,
        ApiType::Gemini,
        channel("gemini", &[&server.uri()], &["gk-1"]),
    );

    let response = h
        .router
        .clone()
        .oneshot(post_json(
            "/v1beta/models/gemini-2.5-pro:streamGenerateContent",
            json!({"contents": [{"role": "user", "parts": [{"text": "hi"}]}]}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body = body_text(response).await;
    assert!(body.contains("skip_thought_signature_validator"));
    // 占位签名在 part 层级而不是 functionCall 内部
    let data_line = body.lines().find(|l| l.starts_with("data:")).unwrap();
    let parsed: serde_json::Value =
        serde_json::from_str(data_line.trim_start_matches("data:").trim()).unwrap();
    let part = &parsed["candidates"][0]["content"]["parts"][0];
    assert_eq!(part["thoughtSignature"], "skip_thought_signature_validator");
    assert!(part["functionCall"].get("thoughtSignature").is_none());
}
