//! # 请求编排器
//!
//! 每个 apiType 一个入口：读取并预处理请求体、循环向调度器要槽位、
//! 渠道内多 URL 故障转移、把响应交给流式拦截器、在流结束后完成
//! 指标/日志/熔断日志的归因写入。
//!
//! 客户端取消不是失败：不计数、不写请求日志（下游断开时响应任务
//! 直接结束，归因回调不会触发）。

use crate::config::redirect::redirect_model_with_global;
use crate::config::types::ServiceType;
use crate::config::{ApiType, ConfigStore, EnvConfig, UpstreamChannel};
use crate::error::{ProxyError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::metrics::{
    build_key_circuit_log_json, KeyCircuitLogStore, MetricsManager, RequestLogRecord,
    RequestLogStore, Usage,
};
use crate::pricing::PricingService;
use crate::proxy::balance::{
    is_insufficient_balance_body, looks_like_wrapped_upstream_error, parse_wrapped_upstream_error,
};
use crate::proxy::body::{
    apply_reasoning_redirect, estimate_input_tokens, extract_caller_id, extract_model,
    extract_stream_flag, normalize_reasoning_effort, remove_empty_signatures,
};
use crate::proxy::client::HttpClientManager;
use crate::proxy::stream::{intercept_sse, process_json_body, StreamOutcome, StreamScope};
use crate::sched::{Scheduler, SlotSelection, TraceAffinityManager, UrlManager};
use crate::utils::{hash_api_key, mask_api_key, mask_sensitive_headers, next_local_midnight};
use crate::{ldebug, linfo, lwarn};
use axum::body::Body;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use chrono::Utc;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

/// 请求日志里保存的上游请求体快照上限（128 KiB）
const LOG_BODY_SNAPSHOT_LIMIT: usize = 128 * 1024;

/// 应用共享状态
pub struct AppState {
    pub env: EnvConfig,
    pub config: Arc<ConfigStore>,
    pub metrics: Arc<MetricsManager>,
    pub request_logs: Arc<RequestLogStore>,
    pub circuit_logs: Arc<KeyCircuitLogStore>,
    pub scheduler: Arc<Scheduler>,
    pub pricing: Arc<PricingService>,
    pub clients: Arc<HttpClientManager>,
}

impl AppState {
    /// 组装全部共享组件
    pub fn new(env: EnvConfig) -> Result<Arc<Self>> {
        let config = Arc::new(ConfigStore::load(&env.config_path)?);
        let metrics = MetricsManager::new(env.metrics_window_size, env.metrics_failure_threshold);
        metrics.set_retention_days(env.metrics_retention_days);
        let affinity = TraceAffinityManager::new();
        let urls = UrlManager::new();
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&config),
            Arc::clone(&metrics),
            Arc::clone(&affinity),
            Arc::clone(&urls),
        ));
        Ok(Arc::new(Self {
            request_logs: Arc::new(RequestLogStore::new(env.request_logs_memory_max_size)),
            circuit_logs: Arc::new(KeyCircuitLogStore::new(chrono::Duration::days(7))),
            pricing: Arc::new(PricingService::default()),
            clients: Arc::new(HttpClientManager::new()),
            config,
            metrics,
            scheduler,
            env,
        }))
    }

    /// 结束全部后台任务
    pub fn shutdown(&self) {
        self.metrics.stop();
        self.scheduler.affinity().stop();
        self.scheduler.urls().stop();
    }
}

/// 单次请求的编排上下文
struct RequestScope {
    request_id: String,
    api_type: ApiType,
    caller_id: String,
    inbound_model: String,
    estimated_input_tokens: i64,
    is_stream: bool,
    started_at: Instant,
    /// 发往上游的路径（不含版本前缀），如 "/messages"
    upstream_suffix: String,
    request_headers_snapshot: Option<String>,
    request_body_snapshot: Option<String>,
    request_body_truncated: bool,
}

/// 按 apiType 转发一次聊天请求。
///
/// `upstream_suffix` 中的 `{model}` 占位符会在每次选路后用重定向后的
/// 模型名替换（gemini 的模型在路径里而不在 body 里）。
pub async fn proxy_request(
    state: Arc<AppState>,
    api_type: ApiType,
    upstream_suffix: String,
    headers: HeaderMap,
    raw_body: Bytes,
    model_override: Option<String>,
    force_stream: bool,
) -> Response {
    let request_id = uuid::Uuid::new_v4().to_string();
    let started_at = Instant::now();

    if raw_body.len() > state.env.max_request_body_size {
        return ProxyError::body_too_large(format!(
            "Request body too large, maximum size is {} MB",
            state.env.max_request_body_size / 1024 / 1024
        ))
        .into_response();
    }

    // 预处理：空 signature 剔除
    let (body, _scrubbed) = remove_empty_signatures(&raw_body, state.env.enable_request_logs);
    let caller_id = extract_caller_id(&headers, &body);
    let inbound_model = model_override.unwrap_or_else(|| extract_model(&body));
    let is_stream = force_stream || extract_stream_flag(&body);

    if state.env.enable_request_logs {
        linfo!(
            request_id,
            LogStage::RequestStart,
            LogComponent::Proxy,
            "request_received",
            &format!("收到 {api_type} 请求"),
            model = %inbound_model,
            stream = is_stream,
            body_size = body.len()
        );
    }

    let (headers_snapshot, body_snapshot, body_truncated) =
        build_log_snapshots(&state.env, &headers, &body);

    let scope = RequestScope {
        request_id,
        api_type,
        caller_id,
        inbound_model,
        estimated_input_tokens: estimate_input_tokens(&body),
        is_stream,
        started_at,
        upstream_suffix,
        request_headers_snapshot: headers_snapshot,
        request_body_snapshot: body_snapshot,
        request_body_truncated: body_truncated,
    };

    match run_failover_loop(&state, &scope, &body).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

fn build_log_snapshots(
    env: &EnvConfig,
    headers: &HeaderMap,
    body: &[u8],
) -> (Option<String>, Option<String>, bool) {
    if !env.development {
        return (None, None, false);
    }
    let mut header_map = HashMap::new();
    for (name, value) in headers {
        if let Ok(text) = value.to_str() {
            header_map.insert(name.as_str().to_string(), text.to_string());
        }
    }
    let masked = mask_sensitive_headers(&header_map);
    let headers_json = serde_json::to_string(&masked).ok();

    let truncated = body.len() > LOG_BODY_SNAPSHOT_LIMIT;
    let snapshot = if truncated {
        let mut end = LOG_BODY_SNAPSHOT_LIMIT;
        let text = String::from_utf8_lossy(body);
        while end > 0 && !text.is_char_boundary(end.min(text.len())) {
            end -= 1;
        }
        Some(text[..end.min(text.len())].to_string())
    } else {
        Some(String::from_utf8_lossy(body).to_string())
    };
    (headers_json, snapshot, truncated)
}

/// 调度 + 渠道内多 URL 故障转移的主循环
async fn run_failover_loop(
    state: &Arc<AppState>,
    scope: &RequestScope,
    body: &[u8],
) -> Result<Response> {
    let mut exclusions: HashSet<(usize, usize)> = HashSet::new();

    loop {
        let selection =
            state
                .scheduler
                .select_slot(&scope.caller_id, &exclusions, scope.api_type)?;

        ldebug!(
            scope.request_id,
            LogStage::Scheduling,
            LogComponent::Scheduler,
            "slot_selected",
            &format!(
                "选中渠道[{}] key[{}]（{}）",
                selection.channel_index, selection.key_index, selection.reason
            ),
            force_probe = selection.force_probe
        );

        let (out_body, final_model, reasoning_effort) =
            prepare_upstream_body(state, scope, body, &selection.channel);
        let suffix = scope.upstream_suffix.replace("{model}", &final_model);

        for base_url in &selection.base_urls {
            match send_attempt(
                state,
                scope,
                &selection,
                base_url,
                &suffix,
                &out_body,
                &final_model,
                reasoning_effort.clone(),
            )
            .await
            {
                AttemptOutcome::Success(response) => {
                    return Ok(response);
                }
                AttemptOutcome::RetryNextUrl => {
                    continue;
                }
                AttemptOutcome::RetryNextKey => {
                    break;
                }
                AttemptOutcome::Terminal(status, headers, bytes) => {
                    // 不可重试的 4xx：原样透传，但仍计一次失败并留痕
                    record_terminal_failure(
                        state, scope, &selection, base_url, status, &bytes, &final_model,
                        reasoning_effort.clone(),
                    );
                    return Ok(passthrough_response(status, headers, bytes));
                }
            }
        }

        exclusions.insert((selection.channel_index, selection.key_index));
    }
}

/// 单次上游尝试的结果
enum AttemptOutcome {
    Success(Response),
    /// URL 级失败（连接错误/429/5xx）：同渠道换下一个 URL
    RetryNextUrl,
    /// Key 级失败（包装错误/余额不足）：换下一个槽位
    RetryNextKey,
    /// 终止性 4xx：透传
    Terminal(StatusCode, HeaderMap, Bytes),
}

#[allow(clippy::too_many_arguments)]
async fn send_attempt(
    state: &Arc<AppState>,
    scope: &RequestScope,
    selection: &SlotSelection,
    base_url: &str,
    suffix: &str,
    out_body: &[u8],
    final_model: &str,
    reasoning_effort: Option<String>,
) -> AttemptOutcome {
    let url = build_upstream_url(base_url, scope.api_type, suffix);
    let client = if scope.is_stream {
        state
            .clients
            .stream_client(selection.channel.insecure_skip_verify)
    } else {
        state.clients.standard_client(
            std::time::Duration::from_millis(state.env.request_timeout_ms),
            selection.channel.insecure_skip_verify,
        )
    };

    if state.env.enable_request_logs {
        ldebug!(
            scope.request_id,
            LogStage::UpstreamRequest,
            LogComponent::Proxy,
            "upstream_request",
            &format!("实际请求URL: {url}"),
            key_mask = %mask_api_key(&selection.api_key)
        );
    }

    let request = apply_auth_headers(
        client.post(&url).header("Content-Type", "application/json"),
        selection.channel.service_type,
        &selection.api_key,
    );

    let response = match request.body(out_body.to_vec()).send().await {
        Ok(response) => response,
        Err(err) => {
            // 连接错误/超时：URL 级可重试失败
            state
                .metrics
                .record_failure_with_status(base_url, &selection.api_key, 0);
            state.scheduler.urls().record_failure(base_url);
            upsert_circuit_log(state, scope, base_url, &selection.api_key, 0, "", &err.to_string());
            lwarn!(
                scope.request_id,
                LogStage::ResponseFailure,
                LogComponent::Proxy,
                "upstream_connect_failed",
                &format!("上游请求失败: {err}"),
                base_url = %base_url
            );
            return AttemptOutcome::RetryNextUrl;
        }
    };

    let status = StatusCode::from_u16(response.status().as_u16())
        .unwrap_or(StatusCode::BAD_GATEWAY);

    if status.is_success() {
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();

        if content_type.contains("text/event-stream") {
            return AttemptOutcome::Success(stream_success_response(
                state,
                scope,
                selection,
                base_url,
                response,
                final_model,
                reasoning_effort,
            ));
        }

        // 非流式：读取全量 body，先识别"包装的 2xx 错误"
        let headers = response.headers().clone();
        let bytes = match response.bytes().await {
            Ok(bytes) => bytes,
            Err(_) => {
                state
                    .metrics
                    .record_failure_with_status(base_url, &selection.api_key, 0);
                state.scheduler.urls().record_failure(base_url);
                return AttemptOutcome::RetryNextUrl;
            }
        };

        let text = String::from_utf8_lossy(&bytes);
        if looks_like_wrapped_upstream_error(&text) {
            let (wrapped_status, summary) = parse_wrapped_upstream_error(&text);
            let effective = if wrapped_status == 0 { 502 } else { wrapped_status };
            handle_upstream_failure(
                state, scope, selection, base_url, effective, &bytes, &summary,
            );
            return AttemptOutcome::RetryNextKey;
        }

        return AttemptOutcome::Success(json_success_response(
            state,
            scope,
            selection,
            base_url,
            status,
            headers,
            bytes,
            final_model,
            reasoning_effort,
        ));
    }

    // 失败响应：读取 body 用于余额识别与熔断日志
    let resp_headers = response.headers().clone();
    let bytes = response.bytes().await.unwrap_or_default();
    let status_code = status.as_u16();

    if status_code == 429 || status.is_server_error() {
        handle_upstream_failure(
            state,
            scope,
            selection,
            base_url,
            status_code,
            &bytes,
            &format!("HTTP {status_code}"),
        );
        return AttemptOutcome::RetryNextUrl;
    }

    // 终止性 4xx（非 429）
    AttemptOutcome::Terminal(status, resp_headers, bytes)
}

/// 记录一次可重试的上游失败：指标、URL 健康、熔断日志与余额识别
fn handle_upstream_failure(
    state: &Arc<AppState>,
    scope: &RequestScope,
    selection: &SlotSelection,
    base_url: &str,
    status_code: u16,
    body: &[u8],
    summary: &str,
) {
    state
        .metrics
        .record_failure_with_status(base_url, &selection.api_key, status_code);
    if status_code >= 500 {
        state.scheduler.urls().record_failure(base_url);
    }

    if is_insufficient_balance_body(body) {
        let until = next_local_midnight(Utc::now());
        state.metrics.suspend_key_until(
            base_url,
            &selection.api_key,
            until,
            "insufficient_balance",
        );
        state.config.set_key_cooldown(&selection.api_key, until);
        lwarn!(
            scope.request_id,
            LogStage::ResponseFailure,
            LogComponent::Proxy,
            "insufficient_balance",
            &format!(
                "Key [{}] 余额不足，硬熔断至本地 0 点",
                mask_api_key(&selection.api_key)
            ),
            base_url = %base_url
        );
    }

    upsert_circuit_log(
        state,
        scope,
        base_url,
        &selection.api_key,
        status_code,
        &String::from_utf8_lossy(body),
        summary,
    );
}

fn upsert_circuit_log(
    state: &Arc<AppState>,
    scope: &RequestScope,
    base_url: &str,
    api_key: &str,
    status_code: u16,
    response_body: &str,
    error_message: &str,
) {
    let log = build_key_circuit_log_json(base_url, status_code, response_body, error_message);
    state
        .circuit_logs
        .upsert(scope.api_type, &hash_api_key(api_key), log);
}

/// 终止性 4xx 的留痕：一次失败指标 + 请求日志 + 熔断日志
#[allow(clippy::too_many_arguments)]
fn record_terminal_failure(
    state: &Arc<AppState>,
    scope: &RequestScope,
    selection: &SlotSelection,
    base_url: &str,
    status: StatusCode,
    body: &[u8],
    final_model: &str,
    reasoning_effort: Option<String>,
) {
    let status_code = status.as_u16();
    state
        .metrics
        .record_failure_with_status(base_url, &selection.api_key, status_code);
    let error_message = String::from_utf8_lossy(body).to_string();
    upsert_circuit_log(
        state,
        scope,
        base_url,
        &selection.api_key,
        status_code,
        &error_message,
        &format!("HTTP {status_code}"),
    );
    push_request_log(
        state,
        scope,
        selection,
        status_code,
        false,
        final_model.to_string(),
        reasoning_effort,
        &Usage::default(),
        0,
        Some(error_message),
    );
}

#[allow(clippy::too_many_arguments)]
fn push_request_log(
    state: &Arc<AppState>,
    scope: &RequestScope,
    selection: &SlotSelection,
    status_code: u16,
    success: bool,
    model: String,
    reasoning_effort: Option<String>,
    usage: &Usage,
    cost_cents: i64,
    error_message: Option<String>,
) {
    state.request_logs.add(RequestLogRecord {
        id: 0,
        request_id: scope.request_id.clone(),
        api_type: scope.api_type,
        channel_index: selection.channel_index,
        channel_name: selection.channel.name.clone(),
        key_mask: mask_api_key(&selection.api_key),
        key_id: hash_api_key(&selection.api_key),
        timestamp: Utc::now(),
        duration_ms: scope.started_at.elapsed().as_millis() as i64,
        status_code,
        success,
        model,
        reasoning_effort,
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
        cache_creation_tokens: usage.effective_cache_creation(),
        cache_read_tokens: usage.cache_read_input_tokens,
        cost_cents,
        error_message,
        request_headers: scope.request_headers_snapshot.clone(),
        request_body: scope.request_body_snapshot.clone(),
        request_body_truncated: scope.request_body_truncated,
    });
}

/// 流式成功响应：拦截器转发 + 流结束后归因
#[allow(clippy::too_many_arguments)]
fn stream_success_response(
    state: &Arc<AppState>,
    scope: &RequestScope,
    selection: &SlotSelection,
    base_url: &str,
    response: reqwest::Response,
    final_model: &str,
    reasoning_effort: Option<String>,
) -> Response {
    let stream_scope = StreamScope {
        service_type: selection.channel.service_type,
        estimated_input_tokens: scope.estimated_input_tokens,
        patch_input_tokens: scope.api_type == ApiType::Messages,
        inject_dummy_thought_signature: scope.api_type == ApiType::Gemini
            && !selection.channel.strip_thought_signature,
        strip_thought_signature: scope.api_type == ApiType::Gemini
            && selection.channel.strip_thought_signature,
    };

    let finalize = success_finalizer(
        state,
        scope,
        selection,
        base_url,
        final_model.to_string(),
        reasoning_effort,
    );
    let status = StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::OK);
    let headers = response.headers().clone();
    let body = intercept_sse(response, stream_scope, finalize);

    let mut builder = Response::builder().status(status);
    for (name, value) in &headers {
        if matches!(name.as_str(), "content-length" | "transfer-encoding") {
            continue;
        }
        builder = builder.header(name.clone(), value.clone());
    }
    builder.body(body).unwrap_or_else(|_| {
        ProxyError::internal("构建流式响应失败").into_response()
    })
}

/// 非流式 JSON 成功响应：改写 + 立即归因
#[allow(clippy::too_many_arguments)]
fn json_success_response(
    state: &Arc<AppState>,
    scope: &RequestScope,
    selection: &SlotSelection,
    base_url: &str,
    status: StatusCode,
    headers: HeaderMap,
    bytes: Bytes,
    final_model: &str,
    reasoning_effort: Option<String>,
) -> Response {
    let stream_scope = StreamScope {
        service_type: selection.channel.service_type,
        estimated_input_tokens: scope.estimated_input_tokens,
        patch_input_tokens: false,
        inject_dummy_thought_signature: scope.api_type == ApiType::Gemini
            && !selection.channel.strip_thought_signature,
        strip_thought_signature: scope.api_type == ApiType::Gemini
            && selection.channel.strip_thought_signature,
    };
    let (out, outcome) = process_json_body(&bytes, &stream_scope);
    success_finalizer(
        state,
        scope,
        selection,
        base_url,
        final_model.to_string(),
        reasoning_effort,
    )(outcome);

    let mut builder = Response::builder().status(status);
    for (name, value) in &headers {
        if matches!(name.as_str(), "content-length" | "transfer-encoding") {
            continue;
        }
        builder = builder.header(name.clone(), value.clone());
    }
    builder
        .body(Body::from(out))
        .unwrap_or_else(|_| ProxyError::internal("构建响应失败").into_response())
}

/// 成功归因回调：指标、费用、请求日志、URL 健康与亲和续期
fn success_finalizer(
    state: &Arc<AppState>,
    scope: &RequestScope,
    selection: &SlotSelection,
    base_url: &str,
    final_model: String,
    reasoning_effort: Option<String>,
) -> impl FnOnce(StreamOutcome) + Send + 'static {
    let state = Arc::clone(state);
    let base_url = base_url.to_string();
    let selection = selection.clone();
    let api_type = scope.api_type;
    let caller_id = scope.caller_id.clone();
    let request_id = scope.request_id.clone();
    let started_at = scope.started_at;
    let headers_snapshot = scope.request_headers_snapshot.clone();
    let body_snapshot = scope.request_body_snapshot.clone();
    let body_truncated = scope.request_body_truncated;

    move |outcome: StreamOutcome| {
        let model = if outcome.model.is_empty() {
            final_model
        } else {
            outcome.model.clone()
        };
        let cost_cents = state.pricing.cost_cents(&model, &outcome.usage);

        state.metrics.record_success_with_usage(
            &base_url,
            &selection.api_key,
            Some(&outcome.usage),
            &model,
            cost_cents,
        );
        state.scheduler.urls().record_success(&base_url);
        state
            .scheduler
            .affinity()
            .update_last_used(api_type, &caller_id);

        state.request_logs.add(RequestLogRecord {
            id: 0,
            request_id: request_id.clone(),
            api_type,
            channel_index: selection.channel_index,
            channel_name: selection.channel.name.clone(),
            key_mask: mask_api_key(&selection.api_key),
            key_id: hash_api_key(&selection.api_key),
            timestamp: Utc::now(),
            duration_ms: started_at.elapsed().as_millis() as i64,
            status_code: 200,
            success: true,
            model,
            reasoning_effort,
            input_tokens: outcome.usage.input_tokens,
            output_tokens: outcome.usage.output_tokens,
            cache_creation_tokens: outcome.usage.effective_cache_creation(),
            cache_read_tokens: outcome.usage.cache_read_input_tokens,
            cost_cents,
            error_message: None,
            request_headers: headers_snapshot,
            request_body: body_snapshot,
            request_body_truncated: body_truncated,
        });

        ldebug!(
            request_id,
            LogStage::Response,
            LogComponent::Proxy,
            "request_completed",
            "请求完成",
            duration_ms = started_at.elapsed().as_millis() as i64,
            cost_cents = cost_cents
        );
    }
}

fn passthrough_response(status: StatusCode, headers: HeaderMap, bytes: Bytes) -> Response {
    let mut builder = Response::builder().status(status);
    for (name, value) in &headers {
        if matches!(name.as_str(), "content-length" | "transfer-encoding") {
            continue;
        }
        builder = builder.header(name.clone(), value.clone());
    }
    builder
        .body(Body::from(bytes))
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
}

/// 按渠道准备上游请求体：模型重定向 + 思考强度规整与重定向。
/// 返回 (出站 body, 最终模型, 最终 reasoning effort)。
fn prepare_upstream_body(
    state: &Arc<AppState>,
    scope: &RequestScope,
    body: &[u8],
    channel: &UpstreamChannel,
) -> (Vec<u8>, String, Option<String>) {
    let snapshot = state.config.get_config();

    let Ok(mut data) = serde_json::from_slice::<Value>(body) else {
        return (body.to_vec(), scope.inbound_model.clone(), None);
    };

    let mut final_model = scope.inbound_model.clone();
    if !scope.inbound_model.is_empty() {
        final_model = redirect_model_with_global(
            &scope.inbound_model,
            &channel.model_mapping,
            &snapshot.global_model_mapping,
        );
        if let Some(map) = data.as_object_mut() {
            if map.contains_key("model") {
                map.insert("model".to_string(), Value::String(final_model.clone()));
            }
        }
    }

    normalize_reasoning_effort(&mut data);
    let reasoning_effort =
        apply_reasoning_redirect(&mut data, &snapshot.global_reasoning_mapping);

    match serde_json::to_vec(&data) {
        Ok(bytes) => (bytes, final_model, reasoning_effort),
        Err(_) => (body.to_vec(), final_model, reasoning_effort),
    }
}

/// 只读 GET 透传（模型发现等端点）：选一个槽位转发，不做用量归因
pub async fn proxy_get(state: Arc<AppState>, api_type: ApiType, suffix: String) -> Response {
    let mut exclusions: HashSet<(usize, usize)> = HashSet::new();

    loop {
        let selection = match state.scheduler.select_slot("", &exclusions, api_type) {
            Ok(selection) => selection,
            Err(err) => return err.into_response(),
        };

        for base_url in &selection.base_urls {
            let url = build_upstream_url(base_url, api_type, &suffix);
            let client = state.clients.standard_client(
                std::time::Duration::from_millis(state.env.request_timeout_ms),
                selection.channel.insecure_skip_verify,
            );
            let request = apply_auth_headers(
                client.get(&url),
                selection.channel.service_type,
                &selection.api_key,
            );
            match request.send().await {
                Ok(response) => {
                    let status = StatusCode::from_u16(response.status().as_u16())
                        .unwrap_or(StatusCode::BAD_GATEWAY);
                    let headers = response.headers().clone();
                    let bytes = response.bytes().await.unwrap_or_default();
                    return passthrough_response(status, headers, bytes);
                }
                Err(_) => continue,
            }
        }

        exclusions.insert((selection.channel_index, selection.key_index));
    }
}

/// 按服务协议加认证头
fn apply_auth_headers(
    request: reqwest::RequestBuilder,
    service_type: ServiceType,
    api_key: &str,
) -> reqwest::RequestBuilder {
    match service_type {
        ServiceType::Claude => request
            .header("x-api-key", api_key)
            .header("anthropic-version", "2023-06-01"),
        ServiceType::Openai | ServiceType::Responses => {
            request.header("Authorization", format!("Bearer {api_key}"))
        }
        ServiceType::Gemini => request.header("x-goog-api-key", api_key),
    }
}

/// 构建上游 URL。
///
/// BaseURL 以 `#` 结尾表示"不追加版本前缀"；已带 /v1、/v1beta 等
/// 版本后缀时也不重复追加。默认前缀：gemini 用 v1beta，其余 v1。
#[must_use]
pub fn build_upstream_url(base_url: &str, api_type: ApiType, suffix: &str) -> String {
    let mut base = base_url.trim();
    let skip_version_prefix = base.ends_with('#');
    if skip_version_prefix {
        base = base.trim_end_matches('#');
    }
    let base = base.trim_end_matches('/');

    if skip_version_prefix || has_version_suffix(base) {
        return format!("{base}{suffix}");
    }

    let prefix = match api_type {
        ApiType::Gemini => "/v1beta",
        ApiType::Messages | ApiType::Responses => "/v1",
    };
    format!("{base}{prefix}{suffix}")
}

fn has_version_suffix(base: &str) -> bool {
    let Some(last) = base.rsplit('/').next() else {
        return false;
    };
    let mut chars = last.chars();
    if chars.next() != Some('v') {
        return false;
    }
    let rest: String = chars.collect();
    if rest.is_empty() {
        return false;
    }
    // v1 / v2 / v1beta / v2alpha 形式
    let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
    !digits.is_empty()
}
