//! # 配置存储
//!
//! 当前配置以不可变快照（`Arc<ProxyConfig>`）发布；读取方拿到的引用在
//! 整个请求期间保持稳定。写入走 build-and-swap：克隆、修改、原子持久化
//! （写临时文件后 rename）、最后发布。持久化失败则放弃发布。

use crate::config::redirect::{normalize_mapping, normalize_reasoning_mapping};
use crate::config::types::{
    ApiKeyMeta, ApiType, ChannelStatus, ProxyConfig, UpstreamChannel,
};
use crate::error::{ProxyError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::linfo;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

/// 快照式配置存储
pub struct ConfigStore {
    path: PathBuf,
    current: RwLock<Arc<ProxyConfig>>,
    /// 跨渠道的 Key 冷却表（内存态，不持久化）
    cooldown: RwLock<HashMap<String, DateTime<Utc>>>,
}

impl ConfigStore {
    /// 从磁盘加载配置；文件不存在时使用默认空配置
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let config = if path.exists() {
            let raw = fs::read(&path)
                .map_err(|e| ProxyError::io(format!("读取配置文件失败: {}", path.display()), e))?;
            serde_json::from_slice(&raw)
                .map_err(|e| ProxyError::serialization("配置文件解析失败", e))?
        } else {
            ProxyConfig::default()
        };

        Ok(Self {
            path,
            current: RwLock::new(Arc::new(config)),
            cooldown: RwLock::new(HashMap::new()),
        })
    }

    /// 获取当前配置快照
    #[must_use]
    pub fn get_config(&self) -> Arc<ProxyConfig> {
        self.current
            .read()
            .map(|guard| Arc::clone(&guard))
            .unwrap_or_default()
    }

    /// build-and-swap 写入：先持久化，成功后才发布新快照
    fn update<F>(&self, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut ProxyConfig) -> Result<()>,
    {
        let mut guard = self
            .current
            .write()
            .map_err(|_| ProxyError::internal("配置锁中毒"))?;
        let mut next = (**guard).clone();
        mutate(&mut next)?;
        self.persist(&next)?;
        *guard = Arc::new(next);
        Ok(())
    }

    /// 原子持久化：写临时文件后 rename
    fn persist(&self, config: &ProxyConfig) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| {
                    ProxyError::io(format!("创建配置目录失败: {}", parent.display()), e)
                })?;
            }
        }
        let data = serde_json::to_vec_pretty(config)
            .map_err(|e| ProxyError::serialization("配置序列化失败", e))?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, &data)
            .map_err(|e| ProxyError::io(format!("写入临时配置失败: {}", tmp.display()), e))?;
        fs::rename(&tmp, &self.path)
            .map_err(|e| ProxyError::io(format!("替换配置文件失败: {}", self.path.display()), e))?;
        Ok(())
    }

    fn check_channel_index(config: &ProxyConfig, api_type: ApiType, index: usize) -> Result<()> {
        let len = config.service(api_type).channels.len();
        if index >= len {
            return Err(ProxyError::bad_request(format!(
                "渠道索引越界: {index}（共 {len} 个渠道）"
            )));
        }
        Ok(())
    }

    // ============ 渠道操作 ============

    pub fn add_channel(&self, api_type: ApiType, channel: UpstreamChannel) -> Result<usize> {
        let mut new_index = 0;
        self.update(|config| {
            let channels = &mut config.service_mut(api_type).channels;
            channels.push(channel);
            new_index = channels.len() - 1;
            Ok(())
        })?;
        linfo!(
            "system",
            LogStage::Configuration,
            LogComponent::Config,
            "channel_added",
            &format!("新增渠道 [{api_type}] index={new_index}")
        );
        Ok(new_index)
    }

    pub fn update_channel(
        &self,
        api_type: ApiType,
        index: usize,
        channel: UpstreamChannel,
    ) -> Result<()> {
        self.update(|config| {
            Self::check_channel_index(config, api_type, index)?;
            config.service_mut(api_type).channels[index] = channel;
            Ok(())
        })
    }

    pub fn delete_channel(&self, api_type: ApiType, index: usize) -> Result<()> {
        self.update(|config| {
            Self::check_channel_index(config, api_type, index)?;
            config.service_mut(api_type).channels.remove(index);
            Ok(())
        })
    }

    /// 按下标置换表重排渠道；`order` 必须是 0..len 的一个排列
    pub fn reorder_channels(&self, api_type: ApiType, order: &[usize]) -> Result<()> {
        self.update(|config| {
            let channels = &mut config.service_mut(api_type).channels;
            if order.len() != channels.len() {
                return Err(ProxyError::bad_request(format!(
                    "重排表长度不匹配: {} != {}",
                    order.len(),
                    channels.len()
                )));
            }
            let mut seen = vec![false; channels.len()];
            for &idx in order {
                if idx >= channels.len() || seen[idx] {
                    return Err(ProxyError::bad_request("重排表不是合法排列"));
                }
                seen[idx] = true;
            }
            let reordered: Vec<UpstreamChannel> =
                order.iter().map(|&idx| channels[idx].clone()).collect();
            *channels = reordered;
            Ok(())
        })
    }

    pub fn set_channel_status(
        &self,
        api_type: ApiType,
        index: usize,
        status: ChannelStatus,
        cooldown_until: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.update(|config| {
            Self::check_channel_index(config, api_type, index)?;
            let channel = &mut config.service_mut(api_type).channels[index];
            channel.status = status;
            channel.cooldown_until = match status {
                ChannelStatus::Cooldown => cooldown_until,
                _ => None,
            };
            Ok(())
        })
    }

    pub fn set_promotion_until(
        &self,
        api_type: ApiType,
        index: usize,
        until: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.update(|config| {
            Self::check_channel_index(config, api_type, index)?;
            config.service_mut(api_type).channels[index].promotion_until = until;
            Ok(())
        })
    }

    // ============ Key 操作 ============

    pub fn add_api_key(&self, api_type: ApiType, index: usize, api_key: String) -> Result<()> {
        self.update(|config| {
            Self::check_channel_index(config, api_type, index)?;
            let channel = &mut config.service_mut(api_type).channels[index];
            if !channel.api_keys.contains(&api_key) {
                channel.api_keys.push(api_key);
            }
            Ok(())
        })
    }

    pub fn delete_api_key(&self, api_type: ApiType, index: usize, key_index: usize) -> Result<()> {
        self.update(|config| {
            Self::check_channel_index(config, api_type, index)?;
            let channel = &mut config.service_mut(api_type).channels[index];
            if key_index >= channel.api_keys.len() {
                return Err(ProxyError::bad_request(format!(
                    "Key 索引越界: {key_index}"
                )));
            }
            let removed = channel.api_keys.remove(key_index);
            channel.api_key_meta.remove(&removed);
            Ok(())
        })
    }

    pub fn move_api_key_to_top(
        &self,
        api_type: ApiType,
        index: usize,
        key_index: usize,
    ) -> Result<()> {
        self.update(|config| {
            Self::check_channel_index(config, api_type, index)?;
            let channel = &mut config.service_mut(api_type).channels[index];
            if key_index >= channel.api_keys.len() {
                return Err(ProxyError::bad_request(format!(
                    "Key 索引越界: {key_index}"
                )));
            }
            let key = channel.api_keys.remove(key_index);
            channel.api_keys.insert(0, key);
            Ok(())
        })
    }

    pub fn move_api_key_to_bottom(
        &self,
        api_type: ApiType,
        index: usize,
        key_index: usize,
    ) -> Result<()> {
        self.update(|config| {
            Self::check_channel_index(config, api_type, index)?;
            let channel = &mut config.service_mut(api_type).channels[index];
            if key_index >= channel.api_keys.len() {
                return Err(ProxyError::bad_request(format!(
                    "Key 索引越界: {key_index}"
                )));
            }
            let key = channel.api_keys.remove(key_index);
            channel.api_keys.push(key);
            Ok(())
        })
    }

    pub fn set_api_key_disabled(
        &self,
        api_type: ApiType,
        index: usize,
        key_index: usize,
        disabled: bool,
    ) -> Result<()> {
        self.update(|config| {
            Self::check_channel_index(config, api_type, index)?;
            let channel = &mut config.service_mut(api_type).channels[index];
            let Some(api_key) = channel.api_keys.get(key_index).cloned() else {
                return Err(ProxyError::bad_request(format!(
                    "Key 索引越界: {key_index}"
                )));
            };
            channel.set_api_key_disabled(&api_key, disabled);
            Ok(())
        })
    }

    pub fn set_api_key_meta(
        &self,
        api_type: ApiType,
        index: usize,
        key_index: usize,
        meta: ApiKeyMeta,
    ) -> Result<()> {
        self.update(|config| {
            Self::check_channel_index(config, api_type, index)?;
            let channel = &mut config.service_mut(api_type).channels[index];
            let Some(api_key) = channel.api_keys.get(key_index).cloned() else {
                return Err(ProxyError::bad_request(format!(
                    "Key 索引越界: {key_index}"
                )));
            };
            channel.set_api_key_meta(&api_key, meta);
            Ok(())
        })
    }

    // ============ 策略与全局映射 ============

    /// 设置负载均衡策略。仅 failover 生效；round-robin/random 为兼容
    /// 旧配置静默接受并按 failover 处理。
    pub fn set_load_balance(&self, api_type: ApiType, strategy: &str) -> Result<()> {
        if !matches!(strategy, "failover" | "round-robin" | "random") {
            return Err(ProxyError::bad_request(format!(
                "无效的负载均衡策略: {strategy}"
            )));
        }
        self.update(|config| {
            config.service_mut(api_type).load_balance = strategy.to_string();
            Ok(())
        })
    }

    pub fn set_global_model_mapping(&self, mapping: HashMap<String, String>) -> Result<()> {
        let normalized = normalize_mapping(mapping);
        let count = normalized.len();
        self.update(move |config| {
            config.global_model_mapping = normalized;
            Ok(())
        })?;
        linfo!(
            "system",
            LogStage::Configuration,
            LogComponent::Config,
            "model_mapping_updated",
            &format!("已更新全局模型重定向规则，数量={count}")
        );
        Ok(())
    }

    pub fn set_global_reasoning_mapping(&self, mapping: HashMap<String, String>) -> Result<()> {
        let normalized = normalize_reasoning_mapping(mapping);
        let count = normalized.len();
        self.update(move |config| {
            config.global_reasoning_mapping = normalized;
            Ok(())
        })?;
        linfo!(
            "system",
            LogStage::Configuration,
            LogComponent::Config,
            "reasoning_mapping_updated",
            &format!("已更新全局思考重定向规则，数量={count}")
        );
        Ok(())
    }

    // ============ 跨渠道 Key 冷却 ============

    /// 查询 Key 的冷却截止时间；返回 None 表示无冷却
    #[must_use]
    pub fn get_key_cooldown_until(&self, api_key: &str) -> Option<DateTime<Utc>> {
        self.cooldown
            .read()
            .ok()
            .and_then(|guard| guard.get(api_key).copied())
    }

    /// 设置 Key 冷却截止时间
    pub fn set_key_cooldown(&self, api_key: &str, until: DateTime<Utc>) {
        if let Ok(mut guard) = self.cooldown.write() {
            guard.insert(api_key.to_string(), until);
        }
    }

    /// 清除 Key 的冷却状态
    pub fn clear_failed_key(&self, api_key: &str) {
        if let Ok(mut guard) = self.cooldown.write() {
            guard.remove(api_key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::tempdir;

    fn store() -> (tempfile::TempDir, ConfigStore) {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        let store = ConfigStore::load(&path).expect("load");
        (dir, store)
    }

    fn channel_with_keys(keys: &[&str]) -> UpstreamChannel {
        UpstreamChannel {
            name: "test".to_string(),
            base_urls: vec!["https://upstream.example.com".to_string()],
            api_keys: keys.iter().map(|k| k.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_add_channel_and_persist() {
        let (dir, store) = store();
        store
            .add_channel(ApiType::Messages, channel_with_keys(&["sk-1"]))
            .unwrap();
        assert_eq!(store.get_config().messages.channels.len(), 1);

        // 重新加载应读到持久化后的配置
        let reloaded = ConfigStore::load(dir.path().join("config.json")).unwrap();
        assert_eq!(reloaded.get_config().messages.channels.len(), 1);
    }

    #[test]
    fn test_index_out_of_range_errors() {
        let (_dir, store) = store();
        assert!(store.delete_channel(ApiType::Messages, 0).is_err());
        assert!(store
            .set_channel_status(ApiType::Gemini, 5, ChannelStatus::Disabled, None)
            .is_err());
    }

    #[test]
    fn test_reorder_requires_permutation() {
        let (_dir, store) = store();
        store
            .add_channel(ApiType::Responses, channel_with_keys(&["a"]))
            .unwrap();
        store
            .add_channel(ApiType::Responses, channel_with_keys(&["b"]))
            .unwrap();

        assert!(store.reorder_channels(ApiType::Responses, &[0, 0]).is_err());
        assert!(store.reorder_channels(ApiType::Responses, &[0]).is_err());
        store.reorder_channels(ApiType::Responses, &[1, 0]).unwrap();
        let config = store.get_config();
        assert_eq!(config.responses.channels[0].api_keys, vec!["b".to_string()]);
    }

    #[test]
    fn test_disabled_meta_removed_from_storage_when_default() {
        let (dir, store) = store();
        store
            .add_channel(ApiType::Messages, channel_with_keys(&["sk-1"]))
            .unwrap();
        store
            .set_api_key_disabled(ApiType::Messages, 0, 0, true)
            .unwrap();
        assert!(store.get_config().messages.channels[0].is_api_key_disabled("sk-1"));

        store
            .set_api_key_disabled(ApiType::Messages, 0, 0, false)
            .unwrap();
        // 存储中的元信息条目应被移除
        let raw = std::fs::read_to_string(dir.path().join("config.json")).unwrap();
        assert!(!raw.contains("apiKeyMeta"));
    }

    #[test]
    fn test_legacy_load_balance_accepted() {
        let (_dir, store) = store();
        store.set_load_balance(ApiType::Messages, "failover").unwrap();
        store
            .set_load_balance(ApiType::Messages, "round-robin")
            .unwrap();
        store.set_load_balance(ApiType::Messages, "random").unwrap();
        assert!(store.set_load_balance(ApiType::Messages, "sticky").is_err());
    }

    #[test]
    fn test_key_move_to_top_and_bottom() {
        let (_dir, store) = store();
        store
            .add_channel(ApiType::Gemini, channel_with_keys(&["a", "b", "c"]))
            .unwrap();
        store.move_api_key_to_top(ApiType::Gemini, 0, 2).unwrap();
        assert_eq!(
            store.get_config().gemini.channels[0].api_keys,
            vec!["c", "a", "b"]
        );
        store.move_api_key_to_bottom(ApiType::Gemini, 0, 0).unwrap();
        assert_eq!(
            store.get_config().gemini.channels[0].api_keys,
            vec!["a", "b", "c"]
        );
    }

    #[test]
    fn test_key_cooldown_round_trip() {
        let (_dir, store) = store();
        let until = Utc::now() + Duration::hours(1);
        assert!(store.get_key_cooldown_until("sk-x").is_none());
        store.set_key_cooldown("sk-x", until);
        assert_eq!(store.get_key_cooldown_until("sk-x"), Some(until));
        store.clear_failed_key("sk-x");
        assert!(store.get_key_cooldown_until("sk-x").is_none());
    }

    #[test]
    fn test_global_mapping_normalized() {
        let (_dir, store) = store();
        let mut mapping = HashMap::new();
        mapping.insert(" gpt-4 ".to_string(), " gpt-4o ".to_string());
        mapping.insert("".to_string(), "x".to_string());
        store.set_global_model_mapping(mapping).unwrap();
        let config = store.get_config();
        assert_eq!(config.global_model_mapping.len(), 1);
        assert_eq!(config.global_model_mapping["gpt-4"], "gpt-4o");

        let mut reasoning = HashMap::new();
        reasoning.insert("LOW".to_string(), "XHIGH".to_string());
        store.set_global_reasoning_mapping(reasoning).unwrap();
        assert_eq!(
            store.get_config().global_reasoning_mapping["low"],
            "xhigh"
        );
    }
}
