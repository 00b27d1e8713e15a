//! # 会话亲和性管理
//!
//! TTL 索引的 `(apiType, callerId) -> (channelIndex, keyIndex)` 映射。
//! 亲和是提示不是锁：槽位在选择时不可用就回落到正常顺序。
//! 亲和变更日志由 AFFINITY_DEBUG 环境变量门控，避免 PII 泄露。

use crate::config::ApiType;
use crate::linfo;
use crate::logging::{LogComponent, LogStage};
use crate::utils::mask_user_id;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

fn affinity_debug() -> bool {
    static FLAG: OnceLock<bool> = OnceLock::new();
    *FLAG.get_or_init(|| {
        std::env::var("AFFINITY_DEBUG")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false)
    })
}

/// 亲和记录
#[derive(Debug, Clone)]
struct TraceAffinity {
    channel_index: usize,
    key_index: Option<usize>,
    last_used_at: DateTime<Utc>,
}

/// 亲和性管理器
pub struct TraceAffinityManager {
    map: RwLock<HashMap<(ApiType, String), TraceAffinity>>,
    ttl: Duration,
    stop_tx: tokio::sync::watch::Sender<bool>,
}

impl TraceAffinityManager {
    /// 创建管理器（默认 30 分钟无活动过期）并启动清理任务
    pub fn new() -> Arc<Self> {
        Self::with_ttl(Duration::minutes(30))
    }

    pub fn with_ttl(ttl: Duration) -> Arc<Self> {
        let ttl = if ttl <= Duration::zero() {
            Duration::minutes(30)
        } else {
            ttl
        };
        let (stop_tx, _) = tokio::sync::watch::channel(false);
        let manager = Arc::new(Self {
            map: RwLock::new(HashMap::new()),
            ttl,
            stop_tx,
        });

        // 每 5 分钟清理一次过期记录
        {
            let mgr = Arc::clone(&manager);
            let mut stop_rx = manager.stop_tx.subscribe();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(std::time::Duration::from_secs(300));
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => { mgr.cleanup(); },
                        _ = stop_rx.changed() => return,
                    }
                }
            });
        }

        manager
    }

    /// 停止清理任务
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// 获取 callerId 偏好的槽位；过期或不存在返回 None
    #[must_use]
    pub fn get_preferred_slot(
        &self,
        api_type: ApiType,
        caller_id: &str,
    ) -> Option<(usize, Option<usize>)> {
        if caller_id.is_empty() {
            return None;
        }
        let map = self.map.read().ok()?;
        let affinity = map.get(&(api_type, caller_id.to_string()))?;
        if Utc::now() - affinity.last_used_at > self.ttl {
            return None;
        }
        Some((affinity.channel_index, affinity.key_index))
    }

    /// 设置 callerId 偏好的槽位
    pub fn set_preferred_slot(
        &self,
        api_type: ApiType,
        caller_id: &str,
        channel_index: usize,
        key_index: usize,
    ) {
        if caller_id.is_empty() {
            return;
        }
        let mut changed_from: Option<(usize, Option<usize>)> = None;
        let mut created = false;
        if let Ok(mut map) = self.map.write() {
            let key = (api_type, caller_id.to_string());
            match map.get(&key) {
                None => created = true,
                Some(old)
                    if old.channel_index != channel_index
                        || old.key_index != Some(key_index) =>
                {
                    changed_from = Some((old.channel_index, old.key_index));
                }
                Some(_) => {}
            }
            map.insert(
                key,
                TraceAffinity {
                    channel_index,
                    key_index: Some(key_index),
                    last_used_at: Utc::now(),
                },
            );
        }

        if affinity_debug() {
            if let Some((old_ch, old_key)) = changed_from {
                linfo!(
                    "system",
                    LogStage::Scheduling,
                    LogComponent::Affinity,
                    "affinity_changed",
                    &format!(
                        "用户亲和变更: {} -> 渠道[{channel_index}] key[{key_index}] (原渠道[{old_ch}] key[{old_key:?}])",
                        mask_user_id(caller_id)
                    )
                );
            } else if created {
                linfo!(
                    "system",
                    LogStage::Scheduling,
                    LogComponent::Affinity,
                    "affinity_created",
                    &format!(
                        "新建用户亲和: {} -> 渠道[{channel_index}] key[{key_index}]",
                        mask_user_id(caller_id)
                    )
                );
            }
        }
    }

    /// 更新最后使用时间（续期）
    pub fn update_last_used(&self, api_type: ApiType, caller_id: &str) {
        if caller_id.is_empty() {
            return;
        }
        if let Ok(mut map) = self.map.write() {
            if let Some(affinity) = map.get_mut(&(api_type, caller_id.to_string())) {
                affinity.last_used_at = Utc::now();
            }
        }
    }

    /// 移除 callerId 的亲和记录
    pub fn remove(&self, api_type: ApiType, caller_id: &str) {
        if let Ok(mut map) = self.map.write() {
            map.remove(&(api_type, caller_id.to_string()));
        }
    }

    /// 移除指定渠道的所有亲和记录（渠道被禁用或删除时）
    pub fn remove_by_channel(&self, api_type: ApiType, channel_index: usize) {
        let mut removed = 0usize;
        if let Ok(mut map) = self.map.write() {
            map.retain(|(api, _), affinity| {
                let hit = *api == api_type && affinity.channel_index == channel_index;
                if hit {
                    removed += 1;
                }
                !hit
            });
        }
        if affinity_debug() && removed > 0 {
            linfo!(
                "system",
                LogStage::Scheduling,
                LogComponent::Affinity,
                "affinity_channel_removed",
                &format!("渠道[{channel_index}]被移除，清理了 {removed} 条亲和记录")
            );
        }
    }

    /// 清理过期记录，返回清理条数
    pub fn cleanup(&self) -> usize {
        let now = Utc::now();
        let mut cleaned = 0usize;
        if let Ok(mut map) = self.map.write() {
            map.retain(|_, affinity| {
                let expired = now - affinity.last_used_at > self.ttl;
                if expired {
                    cleaned += 1;
                }
                !expired
            });
        }
        cleaned
    }

    /// 当前记录数
    #[must_use]
    pub fn size(&self) -> usize {
        self.map.read().map(|m| m.len()).unwrap_or(0)
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}
