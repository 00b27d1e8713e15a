//! # BaseURL 健康管理
//!
//! 按 BaseURL 维护健康标记，把渠道的 URL 列表重排成"健康优先"。
//! 连续失败达到阈值标记为不健康；成功立即恢复；后台任务定期解除
//! 超过恢复窗口的不健康标记，让流量重新验证该端点。

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// 连续失败达到该次数后标记为不健康
const UNHEALTHY_THRESHOLD: u32 = 2;
/// 不健康标记的自动解除窗口
const RECOVERY_WINDOW_MINUTES: i64 = 10;

#[derive(Debug, Clone)]
struct UrlHealth {
    consecutive_failures: u32,
    healthy: bool,
    changed_at: DateTime<Utc>,
}

impl Default for UrlHealth {
    fn default() -> Self {
        Self {
            consecutive_failures: 0,
            healthy: true,
            changed_at: Utc::now(),
        }
    }
}

/// BaseURL 管理器
pub struct UrlManager {
    map: RwLock<HashMap<String, UrlHealth>>,
    stop_tx: tokio::sync::watch::Sender<bool>,
}

impl UrlManager {
    pub fn new() -> Arc<Self> {
        let (stop_tx, _) = tokio::sync::watch::channel(false);
        let manager = Arc::new(Self {
            map: RwLock::new(HashMap::new()),
            stop_tx,
        });

        // 定期解除过期的不健康标记
        {
            let mgr = Arc::clone(&manager);
            let mut stop_rx = manager.stop_tx.subscribe();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60));
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => mgr.recover_expired(),
                        _ = stop_rx.changed() => return,
                    }
                }
            });
        }

        manager
    }

    /// 停止后台任务
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// 记录某 URL 的成功请求：立即恢复健康
    pub fn record_success(&self, base_url: &str) {
        if let Ok(mut map) = self.map.write() {
            let entry = map.entry(base_url.to_string()).or_default();
            entry.consecutive_failures = 0;
            if !entry.healthy {
                entry.healthy = true;
                entry.changed_at = Utc::now();
            }
        }
    }

    /// 记录某 URL 的失败请求
    pub fn record_failure(&self, base_url: &str) {
        if let Ok(mut map) = self.map.write() {
            let entry = map.entry(base_url.to_string()).or_default();
            entry.consecutive_failures += 1;
            if entry.healthy && entry.consecutive_failures >= UNHEALTHY_THRESHOLD {
                entry.healthy = false;
                entry.changed_at = Utc::now();
            }
        }
    }

    /// URL 是否健康（无记录默认健康）
    #[must_use]
    pub fn is_healthy(&self, base_url: &str) -> bool {
        self.map
            .read()
            .map(|map| map.get(base_url).map(|h| h.healthy).unwrap_or(true))
            .unwrap_or(true)
    }

    /// 重排渠道的 URL 列表：健康的在前，组内保持配置顺序。
    /// 全部不健康时返回配置顺序（调用方据此判断是否进入探测）。
    #[must_use]
    pub fn order_base_urls(&self, base_urls: &[String]) -> Vec<String> {
        let Ok(map) = self.map.read() else {
            return base_urls.to_vec();
        };
        let mut healthy: Vec<String> = Vec::new();
        let mut unhealthy: Vec<String> = Vec::new();
        for url in base_urls {
            if map.get(url).map(|h| h.healthy).unwrap_or(true) {
                healthy.push(url.clone());
            } else {
                unhealthy.push(url.clone());
            }
        }
        if healthy.is_empty() {
            return base_urls.to_vec();
        }
        healthy.extend(unhealthy);
        healthy
    }

    /// 渠道是否存在健康 URL
    #[must_use]
    pub fn has_healthy(&self, base_urls: &[String]) -> bool {
        base_urls.iter().any(|url| self.is_healthy(url))
    }

    /// 解除超过恢复窗口的不健康标记
    pub fn recover_expired(&self) {
        let cutoff = Utc::now() - Duration::minutes(RECOVERY_WINDOW_MINUTES);
        if let Ok(mut map) = self.map.write() {
            for entry in map.values_mut() {
                if !entry.healthy && entry.changed_at < cutoff {
                    entry.healthy = true;
                    entry.consecutive_failures = 0;
                    entry.changed_at = Utc::now();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn urls(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_failure_threshold_marks_unhealthy() {
        let mgr = UrlManager::new();
        assert!(mgr.is_healthy("https://a"));
        mgr.record_failure("https://a");
        assert!(mgr.is_healthy("https://a"));
        mgr.record_failure("https://a");
        assert!(!mgr.is_healthy("https://a"));
        mgr.stop();
    }

    #[tokio::test]
    async fn test_success_restores_health() {
        let mgr = UrlManager::new();
        mgr.record_failure("https://a");
        mgr.record_failure("https://a");
        assert!(!mgr.is_healthy("https://a"));
        mgr.record_success("https://a");
        assert!(mgr.is_healthy("https://a"));
        mgr.stop();
    }

    #[tokio::test]
    async fn test_order_prefers_healthy_keeps_config_order() {
        let mgr = UrlManager::new();
        mgr.record_failure("https://a");
        mgr.record_failure("https://a");
        let ordered = mgr.order_base_urls(&urls(&["https://a", "https://b", "https://c"]));
        assert_eq!(ordered, urls(&["https://b", "https://c", "https://a"]));
        mgr.stop();
    }

    #[tokio::test]
    async fn test_all_unhealthy_falls_back_to_config_order() {
        let mgr = UrlManager::new();
        for url in ["https://a", "https://b"] {
            mgr.record_failure(url);
            mgr.record_failure(url);
        }
        let ordered = mgr.order_base_urls(&urls(&["https://a", "https://b"]));
        assert_eq!(ordered, urls(&["https://a", "https://b"]));
        assert!(!mgr.has_healthy(&urls(&["https://a", "https://b"])));
        mgr.stop();
    }
}
