//! # 管理端接口
//!
//! 渠道/Key 的 CRUD 与排序、指标与历史查询、请求日志、Key 级熔断
//! 操作与全局映射配置，路径统一挂在 `/api/{messages,responses,gemini}`。

pub mod handlers;
pub mod validate;

use crate::proxy::AppState;
use axum::routing::{get, post, put};
use axum::Router;
use std::sync::Arc;

/// 管理端路由
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        // 渠道
        .route(
            "/api/{api}/channels",
            get(handlers::list_channels).post(handlers::create_channel),
        )
        .route(
            "/api/{api}/channels/reorder",
            post(handlers::reorder_channels),
        )
        .route(
            "/api/{api}/channels/{index}",
            put(handlers::update_channel).delete(handlers::delete_channel),
        )
        .route(
            "/api/{api}/channels/{index}/status",
            put(handlers::set_channel_status),
        )
        .route(
            "/api/{api}/channels/{index}/promotion",
            put(handlers::set_channel_promotion),
        )
        .route(
            "/api/{api}/channels/{index}/reset",
            post(handlers::reset_channel),
        )
        // Key
        .route(
            "/api/{api}/channels/{index}/keys",
            post(handlers::add_api_key),
        )
        .route(
            "/api/{api}/channels/{index}/keys/{key_index}",
            axum::routing::delete(handlers::delete_api_key),
        )
        .route(
            "/api/{api}/channels/{index}/keys/{key_index}/move-to-top",
            post(handlers::move_key_to_top),
        )
        .route(
            "/api/{api}/channels/{index}/keys/{key_index}/move-to-bottom",
            post(handlers::move_key_to_bottom),
        )
        .route(
            "/api/{api}/channels/{index}/keys/{key_index}/meta",
            put(handlers::set_key_meta),
        )
        .route(
            "/api/{api}/channels/{index}/keys/{key_index}/reset",
            post(handlers::reset_key),
        )
        .route(
            "/api/{api}/channels/{index}/keys/{key_index}/reset-state",
            post(handlers::reset_key_state),
        )
        .route(
            "/api/{api}/channels/{index}/keys/{key_index}/circuit-log",
            get(handlers::get_key_circuit_log),
        )
        // 指标
        .route(
            "/api/{api}/channels/{index}/metrics",
            get(handlers::channel_metrics),
        )
        .route(
            "/api/{api}/channels/{index}/metrics/history",
            get(handlers::channel_metrics_history),
        )
        .route(
            "/api/{api}/channels/{index}/keys/{key_index}/metrics/history",
            get(handlers::key_metrics_history),
        )
        .route(
            "/api/{api}/channels/{index}/activity",
            get(handlers::channel_activity),
        )
        .route("/api/{api}/dashboard", get(handlers::dashboard))
        .route("/api/{api}/stats/global", get(handlers::global_stats))
        // 日志
        .route("/api/{api}/logs", get(handlers::get_request_logs))
        .route("/api/{api}/logs/{id}", get(handlers::get_request_log_detail))
        // 策略与全局映射
        .route("/api/{api}/load-balance", put(handlers::set_load_balance))
        .route(
            "/api/global/model-mapping",
            get(handlers::get_model_mapping).put(handlers::set_model_mapping),
        )
        .route(
            "/api/global/reasoning-mapping",
            get(handlers::get_reasoning_mapping).put(handlers::set_reasoning_mapping),
        )
        // Key 探活
        .route("/api/{api}/validate-key", post(validate::validate_key))
}
