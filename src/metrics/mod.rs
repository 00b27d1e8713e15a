//! # 指标模块
//!
//! 按 (BaseURL, APIKey) 组合维护请求指标：滑动窗口失败率（软熔断）、
//! 截止时间硬熔断、带时间戳的请求历史（分时段统计与活跃度图表）、
//! 请求日志环形缓冲与 Key 熔断日志存储。

pub mod circuit_log;
pub mod manager;
pub mod request_log;

pub use circuit_log::{build_key_circuit_log_json, KeyCircuitLogStore};
pub use manager::{
    select_top_keys, ActivitySegment, ChannelAggregatedMetrics, ChannelRecentActivity,
    GlobalStatsHistoryResponse, HistoryDataPoint, KeyHistoryDataPoint, KeyMetricsResponse,
    KeyMetricsSnapshot, KeyUsageInfo, MetricsManager, MetricsResponse, TimeWindowStats, Usage,
};
pub use request_log::{RequestLogRecord, RequestLogStore, RequestLogsPage};
