//! # HTTP 服务
//!
//! 代理面（/v1、/v1beta）与管理面（/api）同端口提供，
//! 统一由 `x-api-key: <PROXY_ACCESS_KEY>` 鉴权；/health 免鉴权。

use crate::config::ApiType;
use crate::management;
use crate::proxy::handler::{proxy_get, proxy_request};
use crate::proxy::AppState;
use axum::body::Bytes;
use axum::extract::{Path, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

/// 构建完整路由
pub fn build_router(state: Arc<AppState>) -> Router {
    let authed = Router::new()
        // Anthropic messages
        .route("/v1/messages", post(handle_messages))
        .route("/v1/messages/count_tokens", post(handle_count_tokens))
        .route("/v1/models", get(handle_models_list))
        .route("/v1/models/{model}", get(handle_model_detail))
        // OpenAI responses
        .route("/v1/responses", post(handle_responses))
        .route("/v1/responses/compact", post(handle_responses_compact))
        // Gemini
        .route("/v1beta/models/{model_action}", post(handle_gemini))
        .merge(management::routes())
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth_middleware,
        ));

    Router::new()
        .merge(authed)
        .route("/health", get(handle_health))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// 鉴权中间件：PROXY_ACCESS_KEY 为空时放行（仅限内网部署）
async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let access_key = &state.env.proxy_access_key;
    if access_key.is_empty() {
        return next.run(request).await;
    }

    let provided = request
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| {
            request
                .headers()
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .map(str::to_string)
        });

    if provided.as_deref() == Some(access_key.as_str()) {
        next.run(request).await
    } else {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "无效的访问密钥" })),
        )
            .into_response()
    }
}

async fn handle_health() -> Response {
    Json(json!({ "status": "ok" })).into_response()
}

/// 读取请求体并执行大小限制（超限 413）
async fn read_body(
    request: Request,
    max_size: usize,
) -> Result<(HeaderMap, Bytes), Response> {
    let (parts, body) = request.into_parts();
    match axum::body::to_bytes(body, max_size + 1).await {
        Ok(bytes) if bytes.len() > max_size => Err((
            StatusCode::PAYLOAD_TOO_LARGE,
            Json(json!({
                "error": format!(
                    "Request body too large, maximum size is {} MB",
                    max_size / 1024 / 1024
                )
            })),
        )
            .into_response()),
        Ok(bytes) => Ok((parts.headers, bytes)),
        Err(_) => Err((
            StatusCode::PAYLOAD_TOO_LARGE,
            Json(json!({ "error": "Failed to read request body" })),
        )
            .into_response()),
    }
}

async fn handle_messages(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let (headers, body) = match read_body(request, state.env.max_request_body_size).await {
        Ok(pair) => pair,
        Err(resp) => return resp,
    };
    proxy_request(
        state,
        ApiType::Messages,
        "/messages".to_string(),
        headers,
        body,
        None,
        false,
    )
    .await
}

async fn handle_count_tokens(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let (headers, body) = match read_body(request, state.env.max_request_body_size).await {
        Ok(pair) => pair,
        Err(resp) => return resp,
    };
    proxy_request(
        state,
        ApiType::Messages,
        "/messages/count_tokens".to_string(),
        headers,
        body,
        None,
        false,
    )
    .await
}

async fn handle_models_list(State(state): State<Arc<AppState>>) -> Response {
    proxy_get(state, ApiType::Messages, "/models".to_string()).await
}

async fn handle_model_detail(
    State(state): State<Arc<AppState>>,
    Path(model): Path<String>,
) -> Response {
    proxy_get(state, ApiType::Messages, format!("/models/{model}")).await
}

async fn handle_responses(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let (headers, body) = match read_body(request, state.env.max_request_body_size).await {
        Ok(pair) => pair,
        Err(resp) => return resp,
    };
    proxy_request(
        state,
        ApiType::Responses,
        "/responses".to_string(),
        headers,
        body,
        None,
        false,
    )
    .await
}

async fn handle_responses_compact(
    State(state): State<Arc<AppState>>,
    request: Request,
) -> Response {
    let (headers, body) = match read_body(request, state.env.max_request_body_size).await {
        Ok(pair) => pair,
        Err(resp) => return resp,
    };
    proxy_request(
        state,
        ApiType::Responses,
        "/responses/compact".to_string(),
        headers,
        body,
        None,
        false,
    )
    .await
}

/// Gemini 路径形如 `/v1beta/models/{model}:{action}`
async fn handle_gemini(
    State(state): State<Arc<AppState>>,
    Path(model_action): Path<String>,
    request: Request,
) -> Response {
    let Some((model, action)) = model_action.split_once(':') else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "缺少模型操作后缀" })),
        )
            .into_response();
    };
    let force_stream = match action {
        "generateContent" => false,
        "streamGenerateContent" => true,
        _ => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": format!("不支持的操作: {action}") })),
            )
                .into_response();
        }
    };

    let (headers, body) = match read_body(request, state.env.max_request_body_size).await {
        Ok(pair) => pair,
        Err(resp) => return resp,
    };
    proxy_request(
        state,
        ApiType::Gemini,
        format!("/models/{{model}}:{action}"),
        headers,
        body,
        Some(model.to_string()),
        force_stream,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gemini_suffix_template() {
        // 模板里的 {model} 由编排器按重定向后的模型替换
        let suffix = format!("/models/{{model}}:{}", "streamGenerateContent");
        assert_eq!(suffix, "/models/{model}:streamGenerateContent");
    }
}
