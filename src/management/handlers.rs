//! # 管理端处理器
//!
//! 错误统一返回 `{"error": "<reason>"}`；重置类接口返回
//! `{success, count?, message}`。

use crate::config::{ApiKeyMeta, ApiType, ChannelStatus, UpstreamChannel};
use crate::ldebug;
use crate::logging::{quiet_polling_logs, LogComponent, LogStage};
use crate::metrics::select_top_keys;
use crate::proxy::AppState;
use crate::utils::{hash_api_key, mask_api_key};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

pub(crate) fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

pub(crate) fn parse_api(api: &str) -> Result<ApiType, Response> {
    ApiType::parse(api)
        .ok_or_else(|| error_response(StatusCode::BAD_REQUEST, format!("未知的 API 类型: {api}")))
}

fn ok_reset(count: Option<usize>, message: impl Into<String>) -> Response {
    let mut body = json!({ "success": true, "message": message.into() });
    if let Some(count) = count {
        body["count"] = json!(count);
    }
    Json(body).into_response()
}

/// 解析 "15m" / "1h" / "24h" / "7d" 形式的时长；"today" 表示本地今天 0 点至今
fn parse_duration(text: &str) -> Option<Duration> {
    let text = text.trim();
    if text == "today" {
        let elapsed = crate::utils::today_elapsed(Utc::now());
        return if elapsed > Duration::zero() {
            Some(elapsed)
        } else {
            Some(Duration::seconds(1))
        };
    }
    if text.len() < 2 {
        return None;
    }
    let (value, unit) = text.split_at(text.len() - 1);
    let value: i64 = value.parse().ok()?;
    if value <= 0 {
        return None;
    }
    match unit {
        "s" => Some(Duration::seconds(value)),
        "m" => Some(Duration::minutes(value)),
        "h" => Some(Duration::hours(value)),
        "d" => Some(Duration::days(value)),
        _ => None,
    }
}

fn get_channel(
    state: &AppState,
    api_type: ApiType,
    index: usize,
) -> Result<UpstreamChannel, Response> {
    state
        .config
        .get_config()
        .service(api_type)
        .channels
        .get(index)
        .cloned()
        .ok_or_else(|| error_response(StatusCode::BAD_REQUEST, format!("渠道索引越界: {index}")))
}

// ============ 渠道视图 ============

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct KeyView {
    index: usize,
    key_mask: String,
    key_id: String,
    disabled: bool,
    description: String,
    request_count: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChannelView {
    index: usize,
    name: String,
    base_urls: Vec<String>,
    service_type: crate::config::types::ServiceType,
    status: ChannelStatus,
    priority: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    promotion_until: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cooldown_until: Option<DateTime<Utc>>,
    low_quality: bool,
    insecure_skip_verify: bool,
    model_mapping: HashMap<String, String>,
    keys: Vec<KeyView>,
}

fn channel_view(
    state: &AppState,
    api_type: ApiType,
    index: usize,
    channel: &UpstreamChannel,
) -> ChannelView {
    let keys = channel
        .api_keys
        .iter()
        .enumerate()
        .map(|(key_index, api_key)| {
            let meta = channel.api_key_meta.get(api_key).cloned().unwrap_or_default();
            let key_id = hash_api_key(api_key);
            KeyView {
                index: key_index,
                key_mask: mask_api_key(api_key),
                request_count: state
                    .request_logs
                    .get_key_request_count(api_type, index, &key_id),
                key_id,
                disabled: meta.disabled,
                description: meta.description,
            }
        })
        .collect();

    ChannelView {
        index,
        name: channel.name.clone(),
        base_urls: channel.base_urls.clone(),
        service_type: channel.service_type,
        status: channel.status,
        priority: channel.priority,
        promotion_until: channel.promotion_until,
        cooldown_until: channel.cooldown_until,
        low_quality: channel.low_quality,
        insecure_skip_verify: channel.insecure_skip_verify,
        model_mapping: channel.model_mapping.clone(),
        keys,
    }
}

// ============ 渠道 CRUD ============

pub async fn list_channels(
    State(state): State<Arc<AppState>>,
    Path(api): Path<String>,
) -> Response {
    let api_type = match parse_api(&api) {
        Ok(api_type) => api_type,
        Err(resp) => return resp,
    };
    let config = state.config.get_config();
    let views: Vec<ChannelView> = config
        .service(api_type)
        .channels
        .iter()
        .enumerate()
        .map(|(index, channel)| channel_view(&state, api_type, index, channel))
        .collect();
    Json(json!({
        "channels": views,
        "loadBalance": config.service(api_type).load_balance,
    }))
    .into_response()
}

pub async fn create_channel(
    State(state): State<Arc<AppState>>,
    Path(api): Path<String>,
    Json(channel): Json<UpstreamChannel>,
) -> Response {
    let api_type = match parse_api(&api) {
        Ok(api_type) => api_type,
        Err(resp) => return resp,
    };
    match state.config.add_channel(api_type, channel) {
        Ok(index) => Json(json!({ "success": true, "index": index })).into_response(),
        Err(err) => error_response(err.status_code(), err.to_string()),
    }
}

pub async fn update_channel(
    State(state): State<Arc<AppState>>,
    Path((api, index)): Path<(String, usize)>,
    Json(channel): Json<UpstreamChannel>,
) -> Response {
    let api_type = match parse_api(&api) {
        Ok(api_type) => api_type,
        Err(resp) => return resp,
    };
    match state.config.update_channel(api_type, index, channel) {
        Ok(()) => Json(json!({ "success": true })).into_response(),
        Err(err) => error_response(err.status_code(), err.to_string()),
    }
}

pub async fn delete_channel(
    State(state): State<Arc<AppState>>,
    Path((api, index)): Path<(String, usize)>,
) -> Response {
    let api_type = match parse_api(&api) {
        Ok(api_type) => api_type,
        Err(resp) => return resp,
    };
    match state.config.delete_channel(api_type, index) {
        Ok(()) => {
            // 渠道没了，它的亲和记录也该清掉
            state.scheduler.affinity().remove_by_channel(api_type, index);
            Json(json!({ "success": true })).into_response()
        }
        Err(err) => error_response(err.status_code(), err.to_string()),
    }
}

#[derive(Debug, Deserialize)]
pub struct ReorderPayload {
    pub order: Vec<usize>,
}

pub async fn reorder_channels(
    State(state): State<Arc<AppState>>,
    Path(api): Path<String>,
    Json(payload): Json<ReorderPayload>,
) -> Response {
    let api_type = match parse_api(&api) {
        Ok(api_type) => api_type,
        Err(resp) => return resp,
    };
    match state.config.reorder_channels(api_type, &payload.order) {
        Ok(()) => Json(json!({ "success": true })).into_response(),
        Err(err) => error_response(err.status_code(), err.to_string()),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusPayload {
    pub status: ChannelStatus,
    #[serde(default)]
    pub cooldown_until: Option<DateTime<Utc>>,
}

pub async fn set_channel_status(
    State(state): State<Arc<AppState>>,
    Path((api, index)): Path<(String, usize)>,
    Json(payload): Json<StatusPayload>,
) -> Response {
    let api_type = match parse_api(&api) {
        Ok(api_type) => api_type,
        Err(resp) => return resp,
    };
    match state
        .config
        .set_channel_status(api_type, index, payload.status, payload.cooldown_until)
    {
        Ok(()) => {
            if payload.status == ChannelStatus::Disabled {
                state.scheduler.affinity().remove_by_channel(api_type, index);
            }
            Json(json!({ "success": true })).into_response()
        }
        Err(err) => error_response(err.status_code(), err.to_string()),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromotionPayload {
    #[serde(default)]
    pub promotion_until: Option<DateTime<Utc>>,
}

pub async fn set_channel_promotion(
    State(state): State<Arc<AppState>>,
    Path((api, index)): Path<(String, usize)>,
    Json(payload): Json<PromotionPayload>,
) -> Response {
    let api_type = match parse_api(&api) {
        Ok(api_type) => api_type,
        Err(resp) => return resp,
    };
    match state
        .config
        .set_promotion_until(api_type, index, payload.promotion_until)
    {
        Ok(()) => Json(json!({ "success": true })).into_response(),
        Err(err) => error_response(err.status_code(), err.to_string()),
    }
}

// ============ Key 操作 ============

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddKeyPayload {
    pub api_key: String,
}

pub async fn add_api_key(
    State(state): State<Arc<AppState>>,
    Path((api, index)): Path<(String, usize)>,
    Json(payload): Json<AddKeyPayload>,
) -> Response {
    let api_type = match parse_api(&api) {
        Ok(api_type) => api_type,
        Err(resp) => return resp,
    };
    let api_key = payload.api_key.trim().to_string();
    if api_key.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "apiKey 不能为空");
    }
    match state.config.add_api_key(api_type, index, api_key) {
        Ok(()) => Json(json!({ "success": true })).into_response(),
        Err(err) => error_response(err.status_code(), err.to_string()),
    }
}

pub async fn delete_api_key(
    State(state): State<Arc<AppState>>,
    Path((api, index, key_index)): Path<(String, usize, usize)>,
) -> Response {
    let api_type = match parse_api(&api) {
        Ok(api_type) => api_type,
        Err(resp) => return resp,
    };
    match state.config.delete_api_key(api_type, index, key_index) {
        Ok(()) => Json(json!({ "success": true })).into_response(),
        Err(err) => error_response(err.status_code(), err.to_string()),
    }
}

pub async fn move_key_to_top(
    State(state): State<Arc<AppState>>,
    Path((api, index, key_index)): Path<(String, usize, usize)>,
) -> Response {
    let api_type = match parse_api(&api) {
        Ok(api_type) => api_type,
        Err(resp) => return resp,
    };
    match state.config.move_api_key_to_top(api_type, index, key_index) {
        Ok(()) => Json(json!({ "success": true })).into_response(),
        Err(err) => error_response(err.status_code(), err.to_string()),
    }
}

pub async fn move_key_to_bottom(
    State(state): State<Arc<AppState>>,
    Path((api, index, key_index)): Path<(String, usize, usize)>,
) -> Response {
    let api_type = match parse_api(&api) {
        Ok(api_type) => api_type,
        Err(resp) => return resp,
    };
    match state
        .config
        .move_api_key_to_bottom(api_type, index, key_index)
    {
        Ok(()) => Json(json!({ "success": true })).into_response(),
        Err(err) => error_response(err.status_code(), err.to_string()),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyMetaPayload {
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub description: String,
}

pub async fn set_key_meta(
    State(state): State<Arc<AppState>>,
    Path((api, index, key_index)): Path<(String, usize, usize)>,
    Json(payload): Json<KeyMetaPayload>,
) -> Response {
    let api_type = match parse_api(&api) {
        Ok(api_type) => api_type,
        Err(resp) => return resp,
    };
    let meta = ApiKeyMeta {
        disabled: payload.disabled,
        description: payload.description.trim().to_string(),
    };
    match state.config.set_api_key_meta(api_type, index, key_index, meta) {
        Ok(()) => Json(json!({ "success": true })).into_response(),
        Err(err) => error_response(err.status_code(), err.to_string()),
    }
}

// ============ Key 级熔断操作 ============

fn resolve_key(
    state: &AppState,
    api_type: ApiType,
    index: usize,
    key_index: usize,
) -> Result<(UpstreamChannel, String), Response> {
    let channel = get_channel(state, api_type, index)?;
    let api_key = channel.api_keys.get(key_index).cloned().ok_or_else(|| {
        error_response(StatusCode::BAD_REQUEST, format!("Key 索引越界: {key_index}"))
    })?;
    Ok((channel, api_key))
}

/// 完全重置 Key：指标、请求日志计数与冷却状态
pub async fn reset_key(
    State(state): State<Arc<AppState>>,
    Path((api, index, key_index)): Path<(String, usize, usize)>,
) -> Response {
    let api_type = match parse_api(&api) {
        Ok(api_type) => api_type,
        Err(resp) => return resp,
    };
    let (channel, api_key) = match resolve_key(&state, api_type, index, key_index) {
        Ok(pair) => pair,
        Err(resp) => return resp,
    };
    for base_url in &channel.base_urls {
        state.metrics.reset_key(base_url, &api_key);
    }
    state.config.clear_failed_key(&api_key);
    let count = state
        .request_logs
        .reset_key(api_type, index, &hash_api_key(&api_key));
    ok_reset(Some(count), "Key 指标与日志已重置")
}

/// 仅清除熔断状态，保留累计统计
pub async fn reset_key_state(
    State(state): State<Arc<AppState>>,
    Path((api, index, key_index)): Path<(String, usize, usize)>,
) -> Response {
    let api_type = match parse_api(&api) {
        Ok(api_type) => api_type,
        Err(resp) => return resp,
    };
    let (channel, api_key) = match resolve_key(&state, api_type, index, key_index) {
        Ok(pair) => pair,
        Err(resp) => return resp,
    };
    for base_url in &channel.base_urls {
        state.metrics.reset_key_state(base_url, &api_key);
    }
    state.config.clear_failed_key(&api_key);
    ok_reset(None, "Key 熔断状态已清除")
}

pub async fn get_key_circuit_log(
    State(state): State<Arc<AppState>>,
    Path((api, index, key_index)): Path<(String, usize, usize)>,
) -> Response {
    let api_type = match parse_api(&api) {
        Ok(api_type) => api_type,
        Err(resp) => return resp,
    };
    let (_, api_key) = match resolve_key(&state, api_type, index, key_index) {
        Ok(pair) => pair,
        Err(resp) => return resp,
    };
    let log = state.circuit_logs.get(api_type, &hash_api_key(&api_key));
    Json(json!({ "log": log })).into_response()
}

pub async fn reset_channel(
    State(state): State<Arc<AppState>>,
    Path((api, index)): Path<(String, usize)>,
) -> Response {
    let api_type = match parse_api(&api) {
        Ok(api_type) => api_type,
        Err(resp) => return resp,
    };
    let channel = match get_channel(&state, api_type, index) {
        Ok(channel) => channel,
        Err(resp) => return resp,
    };
    for base_url in &channel.base_urls {
        for api_key in &channel.api_keys {
            state.metrics.reset_key(base_url, api_key);
        }
    }
    let count = state.request_logs.reset_channel(api_type, index);
    ok_reset(Some(count), "渠道统计已重置")
}

// ============ 指标查询 ============

pub async fn channel_metrics(
    State(state): State<Arc<AppState>>,
    Path((api, index)): Path<(String, usize)>,
) -> Response {
    let api_type = match parse_api(&api) {
        Ok(api_type) => api_type,
        Err(resp) => return resp,
    };
    let channel = match get_channel(&state, api_type, index) {
        Ok(channel) => channel,
        Err(resp) => return resp,
    };
    let resp = state.metrics.to_response_multi_url(
        index,
        &channel.base_urls,
        &channel.active_keys(),
        0,
    );
    Json(resp).into_response()
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_duration")]
    pub duration: String,
    #[serde(default = "default_interval")]
    pub interval: String,
}

fn default_duration() -> String {
    "24h".to_string()
}

fn default_interval() -> String {
    "1h".to_string()
}

pub async fn channel_metrics_history(
    State(state): State<Arc<AppState>>,
    Path((api, index)): Path<(String, usize)>,
    Query(query): Query<HistoryQuery>,
) -> Response {
    let api_type = match parse_api(&api) {
        Ok(api_type) => api_type,
        Err(resp) => return resp,
    };
    let channel = match get_channel(&state, api_type, index) {
        Ok(channel) => channel,
        Err(resp) => return resp,
    };
    let (Some(duration), Some(interval)) = (
        parse_duration(&query.duration),
        parse_duration(&query.interval),
    ) else {
        return error_response(StatusCode::BAD_REQUEST, "非法的 duration/interval");
    };
    let (points, warning) = state.metrics.get_historical_stats_multi_url(
        &channel.base_urls,
        &channel.active_keys(),
        duration,
        interval,
    );
    let mut body = json!({ "dataPoints": points });
    if !warning.is_empty() {
        body["warning"] = json!(warning);
    }
    Json(body).into_response()
}

pub async fn key_metrics_history(
    State(state): State<Arc<AppState>>,
    Path((api, index, key_index)): Path<(String, usize, usize)>,
    Query(query): Query<HistoryQuery>,
) -> Response {
    let api_type = match parse_api(&api) {
        Ok(api_type) => api_type,
        Err(resp) => return resp,
    };
    let (channel, api_key) = match resolve_key(&state, api_type, index, key_index) {
        Ok(pair) => pair,
        Err(resp) => return resp,
    };
    let (Some(duration), Some(interval)) = (
        parse_duration(&query.duration),
        parse_duration(&query.interval),
    ) else {
        return error_response(StatusCode::BAD_REQUEST, "非法的 duration/interval");
    };
    let (points, warning) = state.metrics.get_key_historical_stats_multi_url(
        &channel.base_urls,
        &api_key,
        duration,
        interval,
    );
    let mut body = json!({
        "dataPoints": points,
        "timeWindows": state
            .metrics
            .get_all_time_window_stats_for_key(&channel.base_urls, &api_key),
    });
    if !warning.is_empty() {
        body["warning"] = json!(warning);
    }
    Json(body).into_response()
}

pub async fn channel_activity(
    State(state): State<Arc<AppState>>,
    Path((api, index)): Path<(String, usize)>,
) -> Response {
    let api_type = match parse_api(&api) {
        Ok(api_type) => api_type,
        Err(resp) => return resp,
    };
    let channel = match get_channel(&state, api_type, index) {
        Ok(channel) => channel,
        Err(resp) => return resp,
    };
    let activity = state.metrics.get_recent_activity_multi_url(
        index,
        &channel.base_urls,
        &channel.active_keys(),
    );
    Json(activity).into_response()
}

/// 仪表盘：全部渠道的聚合指标、活跃度与展示用 Key 列表
pub async fn dashboard(
    State(state): State<Arc<AppState>>,
    Path(api): Path<String>,
) -> Response {
    let api_type = match parse_api(&api) {
        Ok(api_type) => api_type,
        Err(resp) => return resp,
    };
    if !quiet_polling_logs() {
        ldebug!(
            "system",
            LogStage::Internal,
            LogComponent::Management,
            "dashboard_poll",
            &format!("仪表盘查询: {api_type}")
        );
    }
    let config = state.config.get_config();
    let channels: Vec<serde_json::Value> = config
        .service(api_type)
        .channels
        .iter()
        .enumerate()
        .map(|(index, channel)| {
            let active_keys = channel.active_keys();
            let metrics =
                state
                    .metrics
                    .to_response_multi_url(index, &channel.base_urls, &active_keys, 0);
            let activity = state.metrics.get_recent_activity_multi_url(
                index,
                &channel.base_urls,
                &active_keys,
            );
            let usage = select_top_keys(
                state
                    .metrics
                    .get_channel_key_usage_info_multi_url(&channel.base_urls, &channel.api_keys),
                10,
            );
            json!({
                "channel": channel_view(&state, api_type, index, channel),
                "metrics": metrics,
                "activity": activity,
                "topKeys": usage,
            })
        })
        .collect();

    Json(json!({
        "channels": channels,
        "totalRequests": state.request_logs.get_total_request_count(api_type),
    }))
    .into_response()
}

pub async fn global_stats(
    State(state): State<Arc<AppState>>,
    Path(api): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Response {
    if let Err(resp) = parse_api(&api) {
        return resp;
    }
    let (Some(duration), Some(interval)) = (
        parse_duration(&query.duration),
        parse_duration(&query.interval),
    ) else {
        return error_response(StatusCode::BAD_REQUEST, "非法的 duration/interval");
    };
    Json(
        state
            .metrics
            .get_global_historical_stats_with_tokens(duration, interval),
    )
    .into_response()
}

// ============ 请求日志 ============

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    #[serde(default)]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

pub async fn get_request_logs(
    State(state): State<Arc<AppState>>,
    Path(api): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Response {
    let api_type = match parse_api(&api) {
        Ok(api_type) => api_type,
        Err(resp) => return resp,
    };
    Json(state.request_logs.query(api_type, query.limit, query.offset)).into_response()
}

pub async fn get_request_log_detail(
    State(state): State<Arc<AppState>>,
    Path((api, id)): Path<(String, i64)>,
) -> Response {
    let api_type = match parse_api(&api) {
        Ok(api_type) => api_type,
        Err(resp) => return resp,
    };
    match state.request_logs.get_detail(api_type, id) {
        Some(record) => Json(record).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "日志不存在或已被重置"),
    }
}

// ============ 策略与全局映射 ============

#[derive(Debug, Deserialize)]
pub struct LoadBalancePayload {
    pub strategy: String,
}

pub async fn set_load_balance(
    State(state): State<Arc<AppState>>,
    Path(api): Path<String>,
    Json(payload): Json<LoadBalancePayload>,
) -> Response {
    let api_type = match parse_api(&api) {
        Ok(api_type) => api_type,
        Err(resp) => return resp,
    };
    match state.config.set_load_balance(api_type, &payload.strategy) {
        Ok(()) => Json(json!({ "success": true })).into_response(),
        Err(err) => error_response(err.status_code(), err.to_string()),
    }
}

pub async fn get_model_mapping(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({ "mapping": state.config.get_config().global_model_mapping })).into_response()
}

#[derive(Debug, Deserialize)]
pub struct MappingPayload {
    #[serde(default)]
    pub mapping: HashMap<String, String>,
}

pub async fn set_model_mapping(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<MappingPayload>,
) -> Response {
    match state.config.set_global_model_mapping(payload.mapping) {
        Ok(()) => Json(json!({ "success": true })).into_response(),
        Err(err) => error_response(err.status_code(), err.to_string()),
    }
}

pub async fn get_reasoning_mapping(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({ "mapping": state.config.get_config().global_reasoning_mapping })).into_response()
}

pub async fn set_reasoning_mapping(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<MappingPayload>,
) -> Response {
    match state.config.set_global_reasoning_mapping(payload.mapping) {
        Ok(()) => Json(json!({ "success": true })).into_response(),
        Err(err) => error_response(err.status_code(), err.to_string()),
    }
}
