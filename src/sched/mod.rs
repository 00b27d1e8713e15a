//! # 渠道/Key 调度器
//!
//! 在故障转移策略下为每个请求挑选 (channel, key, baseURL) 三元组：
//! 促销渠道优先，其次按优先级与下标；亲和槽位可用时先用亲和；
//! 跳过被禁用、被排除、熔断中与冷却中的 Key。当某渠道全部 Key 都
//! 处于软熔断时进入探测模式，放行真实流量去验证是否恢复。

pub mod affinity;
pub mod url_manager;

pub use affinity::TraceAffinityManager;
pub use url_manager::UrlManager;

use crate::config::{ApiType, ConfigStore, UpstreamChannel};
use crate::error::{ProxyError, Result};
use crate::ldebug;
use crate::logging::{LogComponent, LogStage};
use crate::metrics::MetricsManager;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;

/// 一次调度的结果
#[derive(Debug, Clone)]
pub struct SlotSelection {
    pub channel_index: usize,
    pub key_index: usize,
    /// 健康优先排序后的 URL 列表（首个为本次请求的 BaseURL）
    pub base_urls: Vec<String>,
    pub api_key: String,
    pub channel: UpstreamChannel,
    /// 探测模式：渠道所有 Key 均软熔断，放行真实流量验证恢复
    pub force_probe: bool,
    pub reason: &'static str,
}

impl SlotSelection {
    /// 本次请求首选的 BaseURL
    #[must_use]
    pub fn base_url(&self) -> &str {
        self.base_urls.first().map(String::as_str).unwrap_or("")
    }
}

/// 调度器
pub struct Scheduler {
    config: Arc<ConfigStore>,
    metrics: Arc<MetricsManager>,
    affinity: Arc<TraceAffinityManager>,
    urls: Arc<UrlManager>,
}

impl Scheduler {
    pub fn new(
        config: Arc<ConfigStore>,
        metrics: Arc<MetricsManager>,
        affinity: Arc<TraceAffinityManager>,
        urls: Arc<UrlManager>,
    ) -> Self {
        Self {
            config,
            metrics,
            affinity,
            urls,
        }
    }

    #[must_use]
    pub fn affinity(&self) -> &Arc<TraceAffinityManager> {
        &self.affinity
    }

    #[must_use]
    pub fn urls(&self) -> &Arc<UrlManager> {
        &self.urls
    }

    /// 挑选一个可用槽位。
    ///
    /// `exclusions` 是本请求内已尝试过的 (channelIndex, keyIndex) 集合，
    /// 每次调用必须返回不同的槽位。
    pub fn select_slot(
        &self,
        caller_id: &str,
        exclusions: &HashSet<(usize, usize)>,
        api_type: ApiType,
    ) -> Result<SlotSelection> {
        let snapshot = self.config.get_config();
        let service = snapshot.service(api_type);
        let now = Utc::now();

        // 候选渠道：可调度且有 Key
        let mut candidates: Vec<(usize, &UpstreamChannel)> = service
            .channels
            .iter()
            .enumerate()
            .filter(|(_, ch)| ch.schedulable(now) && !ch.api_keys.is_empty())
            .collect();

        if candidates.is_empty() {
            return Err(ProxyError::no_upstream(
                api_type.empty_pool_code(),
                format!("{api_type} 渠道池为空或全部不可用"),
            ));
        }

        // 促销渠道优先，其次优先级升序，再按下标
        candidates.sort_by_key(|(index, ch)| {
            (
                !ch.in_promotion(now),
                ch.effective_priority(*index),
                *index,
            )
        });

        // 亲和槽位优先
        if let Some((ch_index, key_index)) = self.affinity.get_preferred_slot(api_type, caller_id)
        {
            if let Some((_, channel)) = candidates.iter().find(|(i, _)| *i == ch_index) {
                if let Some(key_index) = key_index {
                    if let Some(selection) =
                        self.try_slot(channel, ch_index, key_index, exclusions, now, "affinity")
                    {
                        self.affinity.set_preferred_slot(
                            api_type,
                            caller_id,
                            selection.channel_index,
                            selection.key_index,
                        );
                        return Ok(selection);
                    }
                }
            }
        }

        // 正常顺序遍历
        for (ch_index, channel) in &candidates {
            for key_index in 0..channel.api_keys.len() {
                if let Some(selection) =
                    self.try_slot(channel, *ch_index, key_index, exclusions, now, "priority")
                {
                    self.affinity.set_preferred_slot(
                        api_type,
                        caller_id,
                        selection.channel_index,
                        selection.key_index,
                    );
                    return Ok(selection);
                }
            }
        }

        // 探测模式：渠道的 Key 全被软熔断时放行一个（忽略软熔断，仍
        // 尊重硬熔断/禁用/冷却/排除）
        for (ch_index, channel) in &candidates {
            let base_urls = self.urls.order_base_urls(&channel.base_urls);
            let Some(base_url) = base_urls.first() else {
                continue;
            };
            if !self.all_keys_soft_suspended(channel, base_url) {
                continue;
            }
            for (key_index, api_key) in channel.api_keys.iter().enumerate() {
                if channel.is_api_key_disabled(api_key)
                    || exclusions.contains(&(*ch_index, key_index))
                    || self.metrics.is_key_hard_suspended(base_url, api_key)
                    || self.key_in_cooldown(api_key, now)
                {
                    continue;
                }
                ldebug!(
                    "system",
                    LogStage::Scheduling,
                    LogComponent::Scheduler,
                    "force_probe",
                    &format!("渠道[{ch_index}]所有 Key 均熔断，进入探测模式"),
                    key_index = key_index
                );
                let selection = SlotSelection {
                    channel_index: *ch_index,
                    key_index,
                    base_urls: base_urls.clone(),
                    api_key: api_key.clone(),
                    channel: (*channel).clone(),
                    force_probe: true,
                    reason: "probe",
                };
                self.affinity
                    .set_preferred_slot(api_type, caller_id, *ch_index, key_index);
                return Ok(selection);
            }
        }

        Err(ProxyError::no_upstream(
            "NO_API_KEYS",
            format!("{api_type} 所有渠道均无可用 Key"),
        ))
    }

    /// 尝试某个具体槽位；不可用返回 None
    fn try_slot(
        &self,
        channel: &UpstreamChannel,
        ch_index: usize,
        key_index: usize,
        exclusions: &HashSet<(usize, usize)>,
        now: chrono::DateTime<Utc>,
        reason: &'static str,
    ) -> Option<SlotSelection> {
        let api_key = channel.api_keys.get(key_index)?;
        if channel.is_api_key_disabled(api_key) {
            return None;
        }
        if exclusions.contains(&(ch_index, key_index)) {
            return None;
        }
        if self.key_in_cooldown(api_key, now) {
            return None;
        }
        let base_urls = self.urls.order_base_urls(&channel.base_urls);
        let base_url = base_urls.first()?;
        if self.metrics.should_suspend_key(base_url, api_key) {
            return None;
        }
        Some(SlotSelection {
            channel_index: ch_index,
            key_index,
            api_key: api_key.clone(),
            base_urls,
            channel: channel.clone(),
            force_probe: false,
            reason,
        })
    }

    fn key_in_cooldown(&self, api_key: &str, now: chrono::DateTime<Utc>) -> bool {
        self.config
            .get_key_cooldown_until(api_key)
            .is_some_and(|until| now < until)
    }

    fn all_keys_soft_suspended(&self, channel: &UpstreamChannel, base_url: &str) -> bool {
        let usable: Vec<&String> = channel
            .api_keys
            .iter()
            .filter(|key| !channel.is_api_key_disabled(key))
            .collect();
        if usable.is_empty() {
            return false;
        }
        usable
            .iter()
            .all(|key| self.metrics.should_suspend_key_soft(base_url, key))
    }
}
