//! # Key 指标引擎
//!
//! 每个 (BaseURL, APIKey) 组合一条记录，键为 `hash16(baseURL|apiKey)`。
//! 软熔断基于最近 N 次请求的滑动窗口失败率；硬熔断是带截止时间的挂起
//! （如余额不足挂起到本地 0 点）。后台清扫任务负责熔断自动恢复与过期
//! 指标淘汰。

use crate::linfo;
use crate::logging::{LogComponent, LogStage};
use crate::utils::{mask_api_key, metrics_key};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// 上游返回的用量数据（各协议折算后的统一口径）
#[derive(Debug, Clone, Default)]
pub struct Usage {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_creation_input_tokens: i64,
    /// 5 分钟缓存创建细分（部分上游只返回细分字段）
    pub cache_creation_5m_input_tokens: i64,
    /// 1 小时缓存创建细分
    pub cache_creation_1h_input_tokens: i64,
    pub cache_read_input_tokens: i64,
}

impl Usage {
    /// cache_creation_input_tokens 有时不返回（只给 5m/1h 细分），做兜底汇总
    #[must_use]
    pub fn effective_cache_creation(&self) -> i64 {
        if self.cache_creation_input_tokens > 0 {
            self.cache_creation_input_tokens
        } else {
            self.cache_creation_5m_input_tokens + self.cache_creation_1h_input_tokens
        }
    }
}

/// 带时间戳的请求记录
#[derive(Debug, Clone)]
struct RequestRecord {
    timestamp: DateTime<Utc>,
    success: bool,
    input_tokens: i64,
    output_tokens: i64,
    cache_creation_input_tokens: i64,
    cache_read_input_tokens: i64,
    model: String,
    cost_cents: i64,
}

/// 单个 Key 的指标
#[derive(Debug)]
struct KeyMetrics {
    metrics_key: String,
    base_url: String,
    key_mask: String,
    request_count: i64,
    success_count: i64,
    failure_count: i64,
    consecutive_failures: i64,
    last_success_at: Option<DateTime<Utc>>,
    last_failure_at: Option<DateTime<Utc>>,
    /// 软熔断开始时间
    circuit_broken_at: Option<DateTime<Utc>>,
    /// 硬熔断截止时间
    suspend_until: Option<DateTime<Utc>>,
    suspend_reason: String,
    /// 滑动窗口：最近 N 次请求结果（true=成功）
    recent_results: Vec<bool>,
    /// 按 retention 保留的请求历史
    request_history: Vec<RequestRecord>,
}

impl KeyMetrics {
    fn new(metrics_key: String, base_url: String, key_mask: String) -> Self {
        Self {
            metrics_key,
            base_url,
            key_mask,
            request_count: 0,
            success_count: 0,
            failure_count: 0,
            consecutive_failures: 0,
            last_success_at: None,
            last_failure_at: None,
            circuit_broken_at: None,
            suspend_until: None,
            suspend_reason: String::new(),
            recent_results: Vec::new(),
            request_history: Vec::new(),
        }
    }
}

/// Key 指标的只读快照（深拷贝标量字段）
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyMetricsSnapshot {
    pub metrics_key: String,
    pub base_url: String,
    pub key_mask: String,
    pub request_count: i64,
    pub success_count: i64,
    pub failure_count: i64,
    pub consecutive_failures: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub circuit_broken_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suspend_until: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub suspend_reason: String,
}

/// 分时段统计
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeWindowStats {
    pub request_count: i64,
    pub success_count: i64,
    pub failure_count: i64,
    pub success_rate: f64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_creation_tokens: i64,
    pub cache_read_tokens: i64,
    /// 缓存命中率（Token 口径）：cacheRead / (cacheRead + input) * 100
    pub cache_hit_rate: f64,
}

/// 历史数据点（渠道级）
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryDataPoint {
    pub timestamp: DateTime<Utc>,
    pub request_count: i64,
    pub success_count: i64,
    pub failure_count: i64,
    pub success_rate: f64,
}

/// Key 级历史数据点（含 Token 和成本）
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyHistoryDataPoint {
    pub timestamp: Option<DateTime<Utc>>,
    pub request_count: i64,
    pub success_count: i64,
    pub failure_count: i64,
    pub success_rate: f64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    #[serde(rename = "cacheCreationTokens")]
    pub cache_creation_input_tokens: i64,
    #[serde(rename = "cacheReadTokens")]
    pub cache_read_input_tokens: i64,
    pub cost_cents: i64,
}

/// 全局历史数据点
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalHistoryDataPoint {
    pub timestamp: Option<DateTime<Utc>>,
    pub request_count: i64,
    pub success_count: i64,
    pub failure_count: i64,
    pub success_rate: f64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_creation_tokens: i64,
    pub cache_read_tokens: i64,
    pub cost_cents: i64,
}

/// 全局统计汇总
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalStatsSummary {
    pub total_requests: i64,
    pub total_success: i64,
    pub total_failure: i64,
    pub total_input_tokens: i64,
    pub total_output_tokens: i64,
    pub total_cache_creation_tokens: i64,
    pub total_cache_read_tokens: i64,
    pub total_cost_cents: i64,
    pub avg_success_rate: f64,
    pub duration: String,
}

/// 全局统计响应
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalStatsHistoryResponse {
    pub data_points: Vec<GlobalHistoryDataPoint>,
    pub summary: GlobalStatsSummary,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub warning: String,
}

/// 活跃度分段数据（每 6 秒一段）
#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivitySegment {
    pub request_count: i64,
    pub success_count: i64,
    pub failure_count: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
}

/// 渠道最近活跃度数据
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelRecentActivity {
    pub channel_index: usize,
    /// 150 段，每段 6 秒，从旧到新（共 15 分钟）
    pub segments: Vec<ActivitySegment>,
    /// 15 分钟平均 RPM
    pub rpm: f64,
    /// 15 分钟平均 TPM（仅输出 tokens）
    pub tpm: f64,
}

/// 渠道聚合指标（标量汇总）
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelAggregatedMetrics {
    pub channel_index: usize,
    pub request_count: i64,
    pub success_count: i64,
    pub failure_count: i64,
    pub consecutive_failures: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub circuit_broken_at: Option<DateTime<Utc>>,
}

/// 渠道聚合指标的 API 响应
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsResponse {
    pub channel_index: usize,
    pub request_count: i64,
    pub success_count: i64,
    pub failure_count: i64,
    pub success_rate: f64,
    pub error_rate: f64,
    pub consecutive_failures: i64,
    pub latency: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub circuit_broken_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub time_windows: HashMap<&'static str, TimeWindowStats>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub key_metrics: Vec<KeyMetricsResponse>,
}

/// 单个 Key 的 API 响应（同一 Key 在多个 URL 下的指标合并）
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyMetricsResponse {
    pub key_mask: String,
    pub request_count: i64,
    pub success_count: i64,
    pub failure_count: i64,
    pub success_rate: f64,
    pub consecutive_failures: i64,
    pub circuit_broken: bool,
}

/// Key 使用信息（用于管理端排序展示）
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyUsageInfo {
    #[serde(skip)]
    pub api_key: String,
    pub key_mask: String,
    pub request_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
}

const TIME_WINDOWS: [(&str, i64); 4] = [
    ("15m", 15 * 60),
    ("1h", 3600),
    ("6h", 6 * 3600),
    ("24h", 24 * 3600),
];

/// 指标管理器
pub struct MetricsManager {
    map: RwLock<HashMap<String, KeyMetrics>>,
    window_size: usize,
    failure_threshold: f64,
    circuit_recovery_time: Duration,
    retention: RwLock<Duration>,
    stop_tx: tokio::sync::watch::Sender<bool>,
}

impl MetricsManager {
    /// 创建指标管理器并启动后台清扫任务
    pub fn new(window_size: usize, failure_threshold: f64) -> Arc<Self> {
        let window_size = window_size.max(3);
        let failure_threshold = if failure_threshold <= 0.0 || failure_threshold > 1.0 {
            0.5
        } else {
            failure_threshold
        };
        let (stop_tx, _) = tokio::sync::watch::channel(false);
        let manager = Arc::new(Self {
            map: RwLock::new(HashMap::new()),
            window_size,
            failure_threshold,
            circuit_recovery_time: Duration::minutes(15),
            retention: RwLock::new(Duration::days(7)),
            stop_tx,
        });
        Self::spawn_sweepers(&manager);
        manager
    }

    /// 设置历史数据保留天数（仅内存），限制在 1-7 天
    pub fn set_retention_days(&self, days: u32) {
        if days == 0 {
            return;
        }
        let clamped = days.min(7);
        if let Ok(mut retention) = self.retention.write() {
            *retention = Duration::days(i64::from(clamped));
        }
    }

    fn retention(&self) -> Duration {
        self.retention
            .read()
            .map(|d| *d)
            .unwrap_or_else(|_| Duration::days(7))
    }

    /// 结束后台清扫任务
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    #[must_use]
    pub fn window_size(&self) -> usize {
        self.window_size
    }

    #[must_use]
    pub fn failure_threshold(&self) -> f64 {
        self.failure_threshold
    }

    /// 软熔断判定所需的最小样本数
    fn min_window_requests(&self) -> usize {
        std::cmp::max(3, self.window_size / 2)
    }

    fn failure_rate_of(results: &[bool]) -> f64 {
        if results.is_empty() {
            return 0.0;
        }
        let failures = results.iter().filter(|ok| !**ok).count();
        failures as f64 / results.len() as f64
    }

    // ============ 记录 ============

    /// 记录成功请求（带用量与成本）。
    ///
    /// 成功立即清除熔断状态并清空滑动窗口：刚恢复的 Key 不应被
    /// 窗口里的陈旧失败样本继续压在软熔断里。
    pub fn record_success_with_usage(
        &self,
        base_url: &str,
        api_key: &str,
        usage: Option<&Usage>,
        model: &str,
        cost_cents: i64,
    ) {
        // 锁次序固定为 retention -> map，避免与查询路径交叉
        let retention = self.retention();
        let Ok(mut map) = self.map.write() else {
            return;
        };
        let key = metrics_key(base_url, api_key);
        let entry = map
            .entry(key.clone())
            .or_insert_with(|| KeyMetrics::new(key, base_url.to_string(), mask_api_key(api_key)));

        let now = Utc::now();
        entry.request_count += 1;
        entry.success_count += 1;
        entry.consecutive_failures = 0;
        entry.last_success_at = Some(now);

        if entry.circuit_broken_at.is_some() {
            entry.circuit_broken_at = None;
            linfo!(
                "system",
                LogStage::BackgroundTask,
                LogComponent::Metrics,
                "circuit_closed",
                &format!(
                    "Key [{}] ({}) 因请求成功退出熔断状态",
                    entry.key_mask, entry.base_url
                )
            );
        }
        entry.suspend_until = None;
        entry.suspend_reason.clear();
        entry.recent_results.clear();

        let (input, output, cache_creation, cache_read) = match usage {
            Some(u) => (
                u.input_tokens,
                u.output_tokens,
                u.effective_cache_creation(),
                u.cache_read_input_tokens,
            ),
            None => (0, 0, 0, 0),
        };
        Self::append_history(
            entry,
            retention,
            RequestRecord {
                timestamp: now,
                success: true,
                input_tokens: input,
                output_tokens: output,
                cache_creation_input_tokens: cache_creation,
                cache_read_input_tokens: cache_read,
                model: model.to_string(),
                cost_cents,
            },
        );
    }

    /// 记录失败请求（无状态码，按普通失败计入窗口）
    pub fn record_failure(&self, base_url: &str, api_key: &str) {
        self.record_failure_with_status(base_url, api_key, 0);
    }

    /// 记录失败请求（带 HTTP 状态码）。
    ///
    /// 502 是上游网关故障而非 Key 本身的问题：计入失败计数与连续失败，
    /// 但不进入滑动窗口，避免把 Key 错误地推入软熔断。
    pub fn record_failure_with_status(&self, base_url: &str, api_key: &str, status: u16) {
        let retention = self.retention();
        let Ok(mut map) = self.map.write() else {
            return;
        };
        let key = metrics_key(base_url, api_key);
        let entry = map
            .entry(key.clone())
            .or_insert_with(|| KeyMetrics::new(key, base_url.to_string(), mask_api_key(api_key)));

        let now = Utc::now();
        entry.request_count += 1;
        entry.failure_count += 1;
        entry.consecutive_failures += 1;
        entry.last_failure_at = Some(now);

        if status != 502 {
            entry.recent_results.push(false);
            if entry.recent_results.len() > self.window_size {
                entry.recent_results.remove(0);
            }

            if entry.circuit_broken_at.is_none()
                && entry.recent_results.len() >= self.min_window_requests()
                && Self::failure_rate_of(&entry.recent_results) >= self.failure_threshold
            {
                entry.circuit_broken_at = Some(now);
                linfo!(
                    "system",
                    LogStage::BackgroundTask,
                    LogComponent::Metrics,
                    "circuit_opened",
                    &format!(
                        "Key [{}] ({}) 进入熔断状态（失败率: {:.1}%）",
                        entry.key_mask,
                        entry.base_url,
                        Self::failure_rate_of(&entry.recent_results) * 100.0
                    )
                );
            }
        }

        Self::append_history(
            entry,
            retention,
            RequestRecord {
                timestamp: now,
                success: false,
                input_tokens: 0,
                output_tokens: 0,
                cache_creation_input_tokens: 0,
                cache_read_input_tokens: 0,
                model: String::new(),
                cost_cents: 0,
            },
        );
    }

    fn append_history(entry: &mut KeyMetrics, retention: Duration, record: RequestRecord) {
        entry.request_history.push(record);
        let cutoff = Utc::now() - retention;
        if let Some(first_live) = entry
            .request_history
            .iter()
            .position(|r| r.timestamp > cutoff)
        {
            if first_live > 0 {
                entry.request_history.drain(..first_live);
            }
        } else {
            entry.request_history.clear();
        }
    }

    /// 硬熔断：挂起指定 Key 直到截止时间自动恢复。
    ///
    /// 场景：检测到"余额不足"等必然失败的上游错误，避免无意义重试
    /// 与误触发探测模式。
    pub fn suspend_key_until(
        &self,
        base_url: &str,
        api_key: &str,
        until: DateTime<Utc>,
        reason: &str,
    ) {
        let Ok(mut map) = self.map.write() else {
            return;
        };
        let key = metrics_key(base_url, api_key);
        let entry = map
            .entry(key.clone())
            .or_insert_with(|| KeyMetrics::new(key, base_url.to_string(), mask_api_key(api_key)));
        entry.suspend_until = Some(until);
        entry.suspend_reason = reason.to_string();
    }

    // ============ 查询 ============

    /// 是否应跳过该 Key（硬熔断优先于软熔断）
    #[must_use]
    pub fn should_suspend_key(&self, base_url: &str, api_key: &str) -> bool {
        if self.is_key_hard_suspended(base_url, api_key) {
            return true;
        }
        self.should_suspend_key_soft(base_url, api_key)
    }

    /// 仅判断软熔断（失败率熔断），不含硬熔断截止逻辑
    #[must_use]
    pub fn should_suspend_key_soft(&self, base_url: &str, api_key: &str) -> bool {
        let Ok(map) = self.map.read() else {
            return false;
        };
        let Some(entry) = map.get(&metrics_key(base_url, api_key)) else {
            return false;
        };
        if entry.recent_results.len() < self.min_window_requests() {
            return false;
        }
        Self::failure_rate_of(&entry.recent_results) >= self.failure_threshold
    }

    /// 是否处于硬熔断状态（未到期）
    #[must_use]
    pub fn is_key_hard_suspended(&self, base_url: &str, api_key: &str) -> bool {
        let Ok(map) = self.map.read() else {
            return false;
        };
        map.get(&metrics_key(base_url, api_key))
            .and_then(|entry| entry.suspend_until)
            .is_some_and(|until| Utc::now() < until)
    }

    /// 单个 Key 是否健康（无记录默认健康）
    #[must_use]
    pub fn is_key_healthy(&self, base_url: &str, api_key: &str) -> bool {
        let Ok(map) = self.map.read() else {
            return true;
        };
        match map.get(&metrics_key(base_url, api_key)) {
            Some(entry) if !entry.recent_results.is_empty() => {
                Self::failure_rate_of(&entry.recent_results) < self.failure_threshold
            }
            _ => true,
        }
    }

    /// 计算单个 Key 的滑动窗口失败率
    #[must_use]
    pub fn calculate_key_failure_rate(&self, base_url: &str, api_key: &str) -> f64 {
        let Ok(map) = self.map.read() else {
            return 0.0;
        };
        map.get(&metrics_key(base_url, api_key))
            .map(|entry| Self::failure_rate_of(&entry.recent_results))
            .unwrap_or(0.0)
    }

    /// 获取单个 Key 的指标快照（标量深拷贝）
    #[must_use]
    pub fn get_key_metrics(&self, base_url: &str, api_key: &str) -> Option<KeyMetricsSnapshot> {
        let map = self.map.read().ok()?;
        map.get(&metrics_key(base_url, api_key))
            .map(Self::snapshot_of)
    }

    fn snapshot_of(entry: &KeyMetrics) -> KeyMetricsSnapshot {
        KeyMetricsSnapshot {
            metrics_key: entry.metrics_key.clone(),
            base_url: entry.base_url.clone(),
            key_mask: entry.key_mask.clone(),
            request_count: entry.request_count,
            success_count: entry.success_count,
            failure_count: entry.failure_count,
            consecutive_failures: entry.consecutive_failures,
            last_success_at: entry.last_success_at,
            last_failure_at: entry.last_failure_at,
            circuit_broken_at: entry.circuit_broken_at,
            suspend_until: entry.suspend_until,
            suspend_reason: entry.suspend_reason.clone(),
        }
    }

    // ============ 重置 ============

    /// 完全重置单个 Key 的指标
    pub fn reset_key(&self, base_url: &str, api_key: &str) {
        if let Ok(mut map) = self.map.write() {
            if let Some(entry) = map.get_mut(&metrics_key(base_url, api_key)) {
                let key_mask = entry.key_mask.clone();
                let url = entry.base_url.clone();
                *entry = KeyMetrics::new(entry.metrics_key.clone(), url.clone(), key_mask.clone());
                linfo!(
                    "system",
                    LogStage::BackgroundTask,
                    LogComponent::Metrics,
                    "key_reset",
                    &format!("Key [{key_mask}] ({url}) 指标已完全重置")
                );
            }
        }
    }

    /// 仅清除熔断与连续失败状态，保留累计统计与历史
    pub fn reset_key_state(&self, base_url: &str, api_key: &str) {
        if let Ok(mut map) = self.map.write() {
            if let Some(entry) = map.get_mut(&metrics_key(base_url, api_key)) {
                entry.consecutive_failures = 0;
                entry.circuit_broken_at = None;
                entry.suspend_until = None;
                entry.suspend_reason.clear();
                entry.recent_results.clear();
            }
        }
    }

    /// 重置所有指标
    pub fn reset_all(&self) {
        if let Ok(mut map) = self.map.write() {
            map.clear();
        }
    }

    // ============ 后台清扫 ============

    fn spawn_sweepers(manager: &Arc<Self>) {
        // 每分钟：恢复到期的软/硬熔断
        {
            let mgr = Arc::clone(manager);
            let mut stop_rx = manager.stop_tx.subscribe();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60));
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => mgr.recover_expired_circuit_breakers(),
                        _ = stop_rx.changed() => return,
                    }
                }
            });
        }
        // 每小时：淘汰长期无活动的 Key 指标
        {
            let mgr = Arc::clone(manager);
            let mut stop_rx = manager.stop_tx.subscribe();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(std::time::Duration::from_secs(3600));
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => mgr.cleanup_stale_keys(),
                        _ = stop_rx.changed() => return,
                    }
                }
            });
        }
    }

    /// 恢复超时的熔断 Key（写锁只在实际变更时短暂持有）
    pub fn recover_expired_circuit_breakers(&self) {
        let Ok(mut map) = self.map.write() else {
            return;
        };
        let now = Utc::now();
        for entry in map.values_mut() {
            // 硬熔断到期自动恢复
            if entry.suspend_until.is_some_and(|until| now >= until) {
                entry.suspend_until = None;
                entry.suspend_reason.clear();
                entry.consecutive_failures = 0;
                entry.recent_results.clear();
                linfo!(
                    "system",
                    LogStage::BackgroundTask,
                    LogComponent::Metrics,
                    "hard_suspend_recovered",
                    &format!("Key [{}] ({}) 硬熔断自动恢复", entry.key_mask, entry.base_url)
                );
            }

            if entry
                .circuit_broken_at
                .is_some_and(|at| now - at > self.circuit_recovery_time)
            {
                entry.consecutive_failures = 0;
                entry.recent_results.clear();
                entry.circuit_broken_at = None;
                linfo!(
                    "system",
                    LogStage::BackgroundTask,
                    LogComponent::Metrics,
                    "circuit_recovered",
                    &format!(
                        "Key [{}] ({}) 熔断自动恢复（已超过 {} 分钟）",
                        entry.key_mask,
                        entry.base_url,
                        self.circuit_recovery_time.num_minutes()
                    )
                );
            }
        }
    }

    /// 淘汰超过 max(48h, retention) 无活动的 Key 指标。
    ///
    /// 保留窗口内的 Key 需要可查询（即使这段时间没有新请求），
    /// 避免误删导致图表断档。
    pub fn cleanup_stale_keys(&self) {
        let stale_threshold = std::cmp::max(Duration::hours(48), self.retention());
        let Ok(mut map) = self.map.write() else {
            return;
        };
        let now = Utc::now();
        let mut removed: Vec<String> = Vec::new();

        map.retain(|_, entry| {
            let last_activity = match (entry.last_success_at, entry.last_failure_at) {
                (Some(s), Some(f)) => Some(std::cmp::max(s, f)),
                (Some(s), None) => Some(s),
                (None, Some(f)) => Some(f),
                (None, None) => None,
            };
            match last_activity {
                Some(at) if now - at <= stale_threshold => true,
                _ => {
                    removed.push(entry.key_mask.clone());
                    false
                }
            }
        });

        if !removed.is_empty() {
            linfo!(
                "system",
                LogStage::BackgroundTask,
                LogComponent::Metrics,
                "stale_keys_removed",
                &format!("清理了 {} 个过期 Key 指标: {removed:?}", removed.len())
            );
        }
    }

    // ============ 分时段统计 ============

    /// 单个 Key 的全部时间窗口统计（多 URL 聚合）
    #[must_use]
    pub fn get_all_time_window_stats_for_key(
        &self,
        base_urls: &[String],
        api_key: &str,
    ) -> HashMap<&'static str, TimeWindowStats> {
        let Ok(map) = self.map.read() else {
            return HashMap::new();
        };
        let now = Utc::now();
        let mut result = HashMap::new();
        for (label, seconds) in TIME_WINDOWS {
            let cutoff = now - Duration::seconds(seconds);
            let mut stats = WindowAccumulator::default();
            for base_url in base_urls {
                if let Some(entry) = map.get(&metrics_key(base_url, api_key)) {
                    stats.scan(&entry.request_history, cutoff);
                }
            }
            result.insert(label, stats.finish());
        }
        result
    }

    fn aggregated_time_windows_locked(
        map: &HashMap<String, KeyMetrics>,
        base_urls: &[String],
        active_keys: &[String],
    ) -> HashMap<&'static str, TimeWindowStats> {
        let now = Utc::now();
        let mut result = HashMap::new();
        for (label, seconds) in TIME_WINDOWS {
            let cutoff = now - Duration::seconds(seconds);
            let mut stats = WindowAccumulator::default();
            for base_url in base_urls {
                for api_key in active_keys {
                    if let Some(entry) = map.get(&metrics_key(base_url, api_key)) {
                        stats.scan(&entry.request_history, cutoff);
                    }
                }
            }
            result.insert(label, stats.finish());
        }
        result
    }

    // ============ 历史分桶 ============

    fn truncate_to_interval(at: DateTime<Utc>, interval_secs: i64) -> DateTime<Utc> {
        let ts = at.timestamp();
        DateTime::from_timestamp(ts - ts.rem_euclid(interval_secs), 0).unwrap_or(at)
    }

    fn retention_warning(retention: Duration) -> String {
        let days = retention.num_days();
        if days <= 0 {
            return "已按内存保留窗口截断".to_string();
        }
        format!("已按内存保留窗口截断为最近 {days} 天数据")
    }

    /// 渠道级历史统计（多 URL 聚合），返回 (数据点, 截断警告)
    #[must_use]
    pub fn get_historical_stats_multi_url(
        &self,
        base_urls: &[String],
        active_keys: &[String],
        duration: Duration,
        interval: Duration,
    ) -> (Vec<HistoryDataPoint>, String) {
        if interval <= Duration::zero() || duration <= Duration::zero() || base_urls.is_empty() {
            return (Vec::new(), String::new());
        }

        let retention = self.retention();
        let (duration, warning) = if duration > retention {
            (retention, Self::retention_warning(retention))
        } else {
            (duration, String::new())
        };

        let Ok(map) = self.map.read() else {
            return (Vec::new(), warning);
        };

        let interval_secs = interval.num_seconds();
        let now = Utc::now();
        let start_time = Self::truncate_to_interval(now - duration, interval_secs);
        // endTime 延伸一个 interval，确保当前时间段的请求也被包含
        let end_time = Self::truncate_to_interval(now, interval_secs) + interval;
        let num_points = ((duration.num_seconds() / interval_secs).max(1) + 1) as usize;

        let mut buckets = vec![(0i64, 0i64, 0i64); num_points];
        for base_url in base_urls {
            for api_key in active_keys {
                if let Some(entry) = map.get(&metrics_key(base_url, api_key)) {
                    for record in &entry.request_history {
                        if record.timestamp >= start_time && record.timestamp < end_time {
                            let offset = ((record.timestamp - start_time).num_seconds()
                                / interval_secs) as usize;
                            if offset < num_points {
                                let bucket = &mut buckets[offset];
                                bucket.0 += 1;
                                if record.success {
                                    bucket.1 += 1;
                                } else {
                                    bucket.2 += 1;
                                }
                            }
                        }
                    }
                }
            }
        }

        let points = buckets
            .iter()
            .enumerate()
            .map(|(i, (requests, success, failure))| HistoryDataPoint {
                timestamp: start_time + interval * (i as i32),
                request_count: *requests,
                success_count: *success,
                failure_count: *failure,
                // 空桶成功率为 0，避免误导（100% 暗示完美成功）
                success_rate: if *requests > 0 {
                    *success as f64 / *requests as f64 * 100.0
                } else {
                    0.0
                },
            })
            .collect();

        (points, warning)
    }

    /// Key 级历史统计（多 URL 聚合，含 Token/Cache/成本），返回 (数据点, 截断警告)
    #[must_use]
    pub fn get_key_historical_stats_multi_url(
        &self,
        base_urls: &[String],
        api_key: &str,
        duration: Duration,
        interval: Duration,
    ) -> (Vec<KeyHistoryDataPoint>, String) {
        if interval <= Duration::zero() || duration <= Duration::zero() || base_urls.is_empty() {
            return (Vec::new(), String::new());
        }

        let retention = self.retention();
        let (duration, warning) = if duration > retention {
            (retention, Self::retention_warning(retention))
        } else {
            (duration, String::new())
        };

        let Ok(map) = self.map.read() else {
            return (Vec::new(), warning);
        };

        let interval_secs = interval.num_seconds();
        let now = Utc::now();
        let start_time = Self::truncate_to_interval(now - duration, interval_secs);
        let end_time = Self::truncate_to_interval(now, interval_secs) + interval;
        let num_points = ((duration.num_seconds() / interval_secs).max(1) + 1) as usize;

        let mut buckets: Vec<KeyHistoryDataPoint> = vec![KeyHistoryDataPoint::default(); num_points];
        for base_url in base_urls {
            if let Some(entry) = map.get(&metrics_key(base_url, api_key)) {
                for record in &entry.request_history {
                    if record.timestamp > start_time && record.timestamp < end_time {
                        let offset = ((record.timestamp - start_time).num_seconds()
                            / interval_secs) as usize;
                        if offset < num_points {
                            let bucket = &mut buckets[offset];
                            bucket.request_count += 1;
                            if record.success {
                                bucket.success_count += 1;
                            } else {
                                bucket.failure_count += 1;
                            }
                            bucket.input_tokens += record.input_tokens;
                            bucket.output_tokens += record.output_tokens;
                            bucket.cache_creation_input_tokens +=
                                record.cache_creation_input_tokens;
                            bucket.cache_read_input_tokens += record.cache_read_input_tokens;
                            bucket.cost_cents += record.cost_cents;
                        }
                    }
                }
            }
        }

        for (i, bucket) in buckets.iter_mut().enumerate() {
            bucket.timestamp = Some(start_time + interval * ((i + 1) as i32));
            bucket.success_rate = if bucket.request_count > 0 {
                bucket.success_count as f64 / bucket.request_count as f64 * 100.0
            } else {
                0.0
            };
        }

        (buckets, warning)
    }

    /// 全局历史统计（所有 Key 聚合，含 Token 与成本）
    #[must_use]
    pub fn get_global_historical_stats_with_tokens(
        &self,
        duration: Duration,
        interval: Duration,
    ) -> GlobalStatsHistoryResponse {
        if interval <= Duration::zero() || duration <= Duration::zero() {
            return GlobalStatsHistoryResponse {
                summary: GlobalStatsSummary {
                    duration: format_duration(duration),
                    ..Default::default()
                },
                ..Default::default()
            };
        }

        let retention = self.retention();
        let (duration, warning) = if duration > retention {
            (retention, Self::retention_warning(retention))
        } else {
            (duration, String::new())
        };

        let Ok(map) = self.map.read() else {
            return GlobalStatsHistoryResponse::default();
        };

        let interval_secs = interval.num_seconds();
        let now = Utc::now();
        let start_time = Self::truncate_to_interval(now - duration, interval_secs);
        let end_time = Self::truncate_to_interval(now, interval_secs) + interval;
        let num_points = ((duration.num_seconds() / interval_secs).max(1) + 1) as usize;

        let mut buckets: Vec<GlobalHistoryDataPoint> =
            vec![GlobalHistoryDataPoint::default(); num_points];
        let mut summary = GlobalStatsSummary {
            duration: format_duration(duration),
            ..Default::default()
        };

        for entry in map.values() {
            for record in &entry.request_history {
                if record.timestamp > start_time && record.timestamp < end_time {
                    let offset =
                        ((record.timestamp - start_time).num_seconds() / interval_secs) as usize;
                    if offset < num_points {
                        let bucket = &mut buckets[offset];
                        bucket.request_count += 1;
                        if record.success {
                            bucket.success_count += 1;
                        } else {
                            bucket.failure_count += 1;
                        }
                        bucket.input_tokens += record.input_tokens;
                        bucket.output_tokens += record.output_tokens;
                        bucket.cache_creation_tokens += record.cache_creation_input_tokens;
                        bucket.cache_read_tokens += record.cache_read_input_tokens;
                        bucket.cost_cents += record.cost_cents;

                        summary.total_requests += 1;
                        if record.success {
                            summary.total_success += 1;
                        } else {
                            summary.total_failure += 1;
                        }
                        summary.total_input_tokens += record.input_tokens;
                        summary.total_output_tokens += record.output_tokens;
                        summary.total_cache_creation_tokens += record.cache_creation_input_tokens;
                        summary.total_cache_read_tokens += record.cache_read_input_tokens;
                        summary.total_cost_cents += record.cost_cents;
                    }
                }
            }
        }

        for (i, bucket) in buckets.iter_mut().enumerate() {
            bucket.timestamp = Some(start_time + interval * ((i + 1) as i32));
            bucket.success_rate = if bucket.request_count > 0 {
                bucket.success_count as f64 / bucket.request_count as f64 * 100.0
            } else {
                0.0
            };
        }

        summary.avg_success_rate = if summary.total_requests > 0 {
            summary.total_success as f64 / summary.total_requests as f64 * 100.0
        } else {
            0.0
        };

        GlobalStatsHistoryResponse {
            data_points: buckets,
            summary,
            warning,
        }
    }

    // ============ 实时活跃度 ============

    /// 渠道最近活跃度：150 段 × 6 秒 = 15 分钟，段边界对齐到整 6 秒。
    ///
    /// 边界固定到墙钟的 6 秒倍数，相邻两次调用的分段不会因 now 的
    /// 微小变化而抖动。TPM 只计输出 tokens。
    #[must_use]
    pub fn get_recent_activity_multi_url(
        &self,
        channel_index: usize,
        base_urls: &[String],
        active_keys: &[String],
    ) -> ChannelRecentActivity {
        const NUM_SEGMENTS: usize = 150;
        const SEGMENT_SECONDS: i64 = 6;

        if base_urls.is_empty() || active_keys.is_empty() {
            return ChannelRecentActivity {
                channel_index,
                segments: vec![ActivitySegment::default(); NUM_SEGMENTS],
                rpm: 0.0,
                tpm: 0.0,
            };
        }

        let Ok(map) = self.map.read() else {
            return ChannelRecentActivity {
                channel_index,
                segments: vec![ActivitySegment::default(); NUM_SEGMENTS],
                rpm: 0.0,
                tpm: 0.0,
            };
        };

        let now_unix = Utc::now().timestamp();
        let aligned_end_unix = (now_unix / SEGMENT_SECONDS + 1) * SEGMENT_SECONDS;
        let end_time = DateTime::from_timestamp(aligned_end_unix, 0).unwrap_or_else(Utc::now);
        let start_time = end_time - Duration::seconds(NUM_SEGMENTS as i64 * SEGMENT_SECONDS);

        let mut segments = vec![ActivitySegment::default(); NUM_SEGMENTS];
        let mut total_requests = 0i64;
        let mut total_output_tokens = 0i64;

        for base_url in base_urls {
            for api_key in active_keys {
                let Some(entry) = map.get(&metrics_key(base_url, api_key)) else {
                    continue;
                };
                // 倒序遍历：历史按时间追加，遇到早于 startTime 的记录可提前结束
                for record in entry.request_history.iter().rev() {
                    if record.timestamp < start_time {
                        break;
                    }
                    if record.timestamp >= end_time {
                        continue;
                    }
                    let offset = ((record.timestamp - start_time).num_seconds()
                        / SEGMENT_SECONDS) as usize;
                    if offset >= NUM_SEGMENTS {
                        continue;
                    }
                    let seg = &mut segments[offset];
                    seg.request_count += 1;
                    if record.success {
                        seg.success_count += 1;
                    } else {
                        seg.failure_count += 1;
                    }
                    seg.input_tokens += record.input_tokens;
                    seg.output_tokens += record.output_tokens;

                    total_requests += 1;
                    total_output_tokens += record.output_tokens;
                }
            }
        }

        let window_minutes = (NUM_SEGMENTS as f64 * SEGMENT_SECONDS as f64) / 60.0;
        ChannelRecentActivity {
            channel_index,
            segments,
            rpm: total_requests as f64 / window_minutes,
            tpm: total_output_tokens as f64 / window_minutes,
        }
    }

    // ============ API 响应 ============

    /// 渠道聚合指标（多 BaseURL × 多 Key）。
    ///
    /// 每个配置的 Key 都产出一行响应，即使尚无任何指标记录（零值行），
    /// 保证前端能展示全部配置的 Key。circuitBroken 为软熔断或硬熔断之一。
    #[must_use]
    pub fn to_response_multi_url(
        &self,
        channel_index: usize,
        base_urls: &[String],
        active_keys: &[String],
        latency: i64,
    ) -> MetricsResponse {
        let mut resp = MetricsResponse {
            channel_index,
            latency,
            success_rate: 100.0,
            ..Default::default()
        };
        if base_urls.is_empty() || active_keys.is_empty() {
            return resp;
        }

        let Ok(map) = self.map.read() else {
            return resp;
        };

        struct KeyAggregation {
            key_mask: String,
            request_count: i64,
            success_count: i64,
            failure_count: i64,
            consecutive_failures: i64,
            circuit_broken: bool,
        }

        let now = Utc::now();
        let mut key_agg: HashMap<&String, KeyAggregation> = HashMap::new();
        let mut total_results: Vec<bool> = Vec::new();
        let mut max_consecutive = 0i64;

        for base_url in base_urls {
            for api_key in active_keys {
                let Some(entry) = map.get(&metrics_key(base_url, api_key)) else {
                    continue;
                };
                let hard_suspended = entry.suspend_until.is_some_and(|until| now < until);
                resp.request_count += entry.request_count;
                resp.success_count += entry.success_count;
                resp.failure_count += entry.failure_count;
                max_consecutive = max_consecutive.max(entry.consecutive_failures);
                total_results.extend_from_slice(&entry.recent_results);

                if entry.last_success_at > resp.last_success_at {
                    resp.last_success_at = entry.last_success_at;
                }
                if entry.last_failure_at > resp.last_failure_at {
                    resp.last_failure_at = entry.last_failure_at;
                }
                if entry.circuit_broken_at > resp.circuit_broken_at {
                    resp.circuit_broken_at = entry.circuit_broken_at;
                }

                let circuit_broken = entry.circuit_broken_at.is_some() || hard_suspended;
                key_agg
                    .entry(api_key)
                    .and_modify(|agg| {
                        agg.request_count += entry.request_count;
                        agg.success_count += entry.success_count;
                        agg.failure_count += entry.failure_count;
                        agg.consecutive_failures =
                            agg.consecutive_failures.max(entry.consecutive_failures);
                        agg.circuit_broken |= circuit_broken;
                    })
                    .or_insert_with(|| KeyAggregation {
                        key_mask: entry.key_mask.clone(),
                        request_count: entry.request_count,
                        success_count: entry.success_count,
                        failure_count: entry.failure_count,
                        consecutive_failures: entry.consecutive_failures,
                        circuit_broken,
                    });
            }
        }

        // 保持 activeKeys 顺序构建响应；无记录的 Key 给零值行
        resp.key_metrics = active_keys
            .iter()
            .map(|api_key| match key_agg.get(api_key) {
                Some(agg) => KeyMetricsResponse {
                    key_mask: agg.key_mask.clone(),
                    request_count: agg.request_count,
                    success_count: agg.success_count,
                    failure_count: agg.failure_count,
                    success_rate: if agg.request_count > 0 {
                        agg.success_count as f64 / agg.request_count as f64 * 100.0
                    } else {
                        100.0
                    },
                    consecutive_failures: agg.consecutive_failures,
                    circuit_broken: agg.circuit_broken,
                },
                None => KeyMetricsResponse {
                    key_mask: mask_api_key(api_key),
                    request_count: 0,
                    success_count: 0,
                    failure_count: 0,
                    success_rate: 100.0,
                    consecutive_failures: 0,
                    circuit_broken: false,
                },
            })
            .collect();

        resp.consecutive_failures = max_consecutive;
        if total_results.is_empty() {
            resp.success_rate = 100.0;
            resp.error_rate = 0.0;
        } else {
            let failure_rate = Self::failure_rate_of(&total_results);
            resp.success_rate = (1.0 - failure_rate) * 100.0;
            resp.error_rate = failure_rate * 100.0;
        }

        resp.time_windows = Self::aggregated_time_windows_locked(&map, base_urls, active_keys);
        resp
    }

    /// 渠道聚合指标（跨 BaseURL × Key 的标量汇总）。
    /// consecutiveFailures 取各 Key 的最大值，时间戳取最新值。
    #[must_use]
    pub fn get_channel_aggregated_metrics(
        &self,
        channel_index: usize,
        base_urls: &[String],
        active_keys: &[String],
    ) -> ChannelAggregatedMetrics {
        let mut aggregated = ChannelAggregatedMetrics {
            channel_index,
            ..Default::default()
        };
        let Ok(map) = self.map.read() else {
            return aggregated;
        };
        for base_url in base_urls {
            for api_key in active_keys {
                let Some(entry) = map.get(&metrics_key(base_url, api_key)) else {
                    continue;
                };
                aggregated.request_count += entry.request_count;
                aggregated.success_count += entry.success_count;
                aggregated.failure_count += entry.failure_count;
                aggregated.consecutive_failures = aggregated
                    .consecutive_failures
                    .max(entry.consecutive_failures);
                if entry.last_success_at > aggregated.last_success_at {
                    aggregated.last_success_at = entry.last_success_at;
                }
                if entry.last_failure_at > aggregated.last_failure_at {
                    aggregated.last_failure_at = entry.last_failure_at;
                }
                if entry.circuit_broken_at > aggregated.circuit_broken_at {
                    aggregated.circuit_broken_at = entry.circuit_broken_at;
                }
            }
        }
        aggregated
    }

    /// 渠道下所有 Key 的使用信息（按最近使用时间排序，多 URL 聚合）
    #[must_use]
    pub fn get_channel_key_usage_info_multi_url(
        &self,
        base_urls: &[String],
        api_keys: &[String],
    ) -> Vec<KeyUsageInfo> {
        if base_urls.is_empty() {
            return Vec::new();
        }
        let Ok(map) = self.map.read() else {
            return Vec::new();
        };

        let mut infos: Vec<KeyUsageInfo> = api_keys
            .iter()
            .map(|api_key| {
                let mut key_mask = String::new();
                let mut request_count = 0i64;
                let mut last_used_at: Option<DateTime<Utc>> = None;
                for base_url in base_urls {
                    if let Some(entry) = map.get(&metrics_key(base_url, api_key)) {
                        if key_mask.is_empty() {
                            key_mask = entry.key_mask.clone();
                        }
                        request_count += entry.request_count;
                        let used_at = entry.last_success_at.or(entry.last_failure_at);
                        if used_at > last_used_at {
                            last_used_at = used_at;
                        }
                    }
                }
                if key_mask.is_empty() {
                    key_mask = mask_api_key(api_key);
                }
                KeyUsageInfo {
                    api_key: api_key.clone(),
                    key_mask,
                    request_count,
                    last_used_at,
                }
            })
            .collect();

        // 最近使用的在前；都未使用时按访问量排序
        infos.sort_by(|a, b| match (a.last_used_at, b.last_used_at) {
            (None, None) => b.request_count.cmp(&a.request_count),
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (Some(_), None) => std::cmp::Ordering::Less,
            (Some(x), Some(y)) => y.cmp(&x),
        });
        infos
    }
}

/// 筛选展示的 Key：先取最近使用的 5 个，再按访问量补全到 max_display 个
#[must_use]
pub fn select_top_keys(infos: Vec<KeyUsageInfo>, max_display: usize) -> Vec<KeyUsageInfo> {
    if infos.len() <= max_display {
        return infos;
    }
    let mut iter = infos.into_iter();
    let mut result: Vec<KeyUsageInfo> = iter.by_ref().take(5).collect();
    let mut others: Vec<KeyUsageInfo> = iter.collect();
    others.sort_by(|a, b| b.request_count.cmp(&a.request_count));
    let need = max_display.saturating_sub(result.len());
    result.extend(others.into_iter().take(need));
    result
}

#[derive(Default)]
struct WindowAccumulator {
    request_count: i64,
    success_count: i64,
    failure_count: i64,
    input_tokens: i64,
    output_tokens: i64,
    cache_creation_tokens: i64,
    cache_read_tokens: i64,
}

impl WindowAccumulator {
    fn scan(&mut self, history: &[RequestRecord], cutoff: DateTime<Utc>) {
        for record in history {
            if record.timestamp > cutoff {
                self.request_count += 1;
                if record.success {
                    self.success_count += 1;
                } else {
                    self.failure_count += 1;
                }
                self.input_tokens += record.input_tokens;
                self.output_tokens += record.output_tokens;
                self.cache_creation_tokens += record.cache_creation_input_tokens;
                self.cache_read_tokens += record.cache_read_input_tokens;
            }
        }
    }

    fn finish(self) -> TimeWindowStats {
        let success_rate = if self.request_count > 0 {
            self.success_count as f64 / self.request_count as f64 * 100.0
        } else {
            100.0
        };
        let denom = self.cache_read_tokens + self.input_tokens;
        let cache_hit_rate = if denom > 0 {
            self.cache_read_tokens as f64 / denom as f64 * 100.0
        } else {
            0.0
        };
        TimeWindowStats {
            request_count: self.request_count,
            success_count: self.success_count,
            failure_count: self.failure_count,
            success_rate,
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            cache_creation_tokens: self.cache_creation_tokens,
            cache_read_tokens: self.cache_read_tokens,
            cache_hit_rate,
        }
    }
}

fn format_duration(duration: Duration) -> String {
    let secs = duration.num_seconds();
    if secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}
