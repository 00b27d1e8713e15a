//! # 渠道配置模型
//!
//! 对应磁盘 JSON 配置文件的结构。三类服务（messages/responses/gemini）
//! 各持有一组渠道；渠道内部是有序的 BaseURL 列表（故障转移顺序）与
//! 有序的 API Key 列表（轮转顺序）。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// 入站 API 类型（决定走哪组渠道池）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiType {
    Messages,
    Responses,
    Gemini,
}

impl ApiType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Messages => "messages",
            Self::Responses => "responses",
            Self::Gemini => "gemini",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "messages" => Some(Self::Messages),
            "responses" => Some(Self::Responses),
            "gemini" => Some(Self::Gemini),
            _ => None,
        }
    }

    /// 调度器无可用上游时使用的稳定错误码
    #[must_use]
    pub const fn empty_pool_code(&self) -> &'static str {
        match self {
            Self::Messages => "NO_MESSAGES_UPSTREAM",
            Self::Responses => "NO_RESPONSES_UPSTREAM",
            Self::Gemini => "NO_GEMINI_UPSTREAM",
        }
    }
}

impl fmt::Display for ApiType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 渠道上游的服务协议
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    Claude,
    Openai,
    Gemini,
    Responses,
}

impl Default for ServiceType {
    fn default() -> Self {
        Self::Claude
    }
}

/// 渠道状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelStatus {
    Active,
    Disabled,
    Cooldown,
}

impl Default for ChannelStatus {
    fn default() -> Self {
        Self::Active
    }
}

/// 单个 API Key 的元信息
///
/// 与默认值相等的条目不持久化，避免配置文件被空元信息填满。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKeyMeta {
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub description: String,
}

impl ApiKeyMeta {
    /// 是否等于默认值（默认值条目会从存储中移除）
    #[must_use]
    pub fn is_default(&self) -> bool {
        !self.disabled && self.description.is_empty()
    }
}

/// 上游渠道
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamChannel {
    #[serde(default)]
    pub name: String,
    /// 故障转移顺序的 BaseURL 列表
    #[serde(default)]
    pub base_urls: Vec<String>,
    /// 轮转顺序的 API Key 列表
    #[serde(default)]
    pub api_keys: Vec<String>,
    #[serde(default)]
    pub service_type: ServiceType,
    #[serde(default)]
    pub status: ChannelStatus,
    /// 渠道优先级，数字越小越靠前；0 表示"使用数组下标"
    #[serde(default)]
    pub priority: i64,
    /// 促销截止时间：未到期的渠道排序优先于其他所有渠道
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub promotion_until: Option<DateTime<Utc>>,
    /// 冷却截止时间（status 为 cooldown 时生效，过期后可重新被调度）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub low_quality: bool,
    /// 按 API Key 存储的元信息（disabled/description）
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub api_key_meta: HashMap<String, ApiKeyMeta>,
    /// 渠道级模型重定向映射
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub model_mapping: HashMap<String, String>,
    /// 跳过上游 TLS 证书校验
    #[serde(default)]
    pub insecure_skip_verify: bool,
    /// 完全剥离 Gemini thoughtSignature（默认是注入占位签名）
    #[serde(default)]
    pub strip_thought_signature: bool,
}

impl Default for UpstreamChannel {
    fn default() -> Self {
        Self {
            name: String::new(),
            base_urls: Vec::new(),
            api_keys: Vec::new(),
            service_type: ServiceType::default(),
            status: ChannelStatus::default(),
            priority: 0,
            promotion_until: None,
            cooldown_until: None,
            low_quality: false,
            api_key_meta: HashMap::new(),
            model_mapping: HashMap::new(),
            insecure_skip_verify: false,
            strip_thought_signature: false,
        }
    }
}

impl UpstreamChannel {
    /// 有效优先级：priority 为 0 时回退到数组下标
    #[must_use]
    pub fn effective_priority(&self, index: usize) -> i64 {
        if self.priority == 0 {
            index as i64
        } else {
            self.priority
        }
    }

    /// 是否处于促销期
    #[must_use]
    pub fn in_promotion(&self, now: DateTime<Utc>) -> bool {
        self.promotion_until.is_some_and(|until| now < until)
    }

    /// 渠道当前是否可被调度（active，或 cooldown 已过期）
    #[must_use]
    pub fn schedulable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            ChannelStatus::Active => true,
            ChannelStatus::Disabled => false,
            ChannelStatus::Cooldown => self
                .cooldown_until
                .is_none_or(|until| now >= until),
        }
    }

    /// 指定 Key 是否被元信息禁用
    #[must_use]
    pub fn is_api_key_disabled(&self, api_key: &str) -> bool {
        self.api_key_meta
            .get(api_key)
            .is_some_and(|meta| meta.disabled)
    }

    /// 设置 Key 的禁用状态；回到默认值的条目从存储中移除
    pub fn set_api_key_disabled(&mut self, api_key: &str, disabled: bool) {
        let mut meta = self.api_key_meta.get(api_key).cloned().unwrap_or_default();
        meta.disabled = disabled;
        if meta.is_default() {
            self.api_key_meta.remove(api_key);
        } else {
            self.api_key_meta.insert(api_key.to_string(), meta);
        }
    }

    /// 更新 Key 元信息（disabled + description）
    pub fn set_api_key_meta(&mut self, api_key: &str, meta: ApiKeyMeta) {
        if meta.is_default() {
            self.api_key_meta.remove(api_key);
        } else {
            self.api_key_meta.insert(api_key.to_string(), meta);
        }
    }

    /// 未被元信息禁用的 Key 列表（保持配置顺序）
    #[must_use]
    pub fn active_keys(&self) -> Vec<String> {
        self.api_keys
            .iter()
            .filter(|key| !self.is_api_key_disabled(key))
            .cloned()
            .collect()
    }
}

/// 单个服务（apiType）的配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    #[serde(default)]
    pub channels: Vec<UpstreamChannel>,
    /// 负载均衡策略；仅 failover 生效，round-robin/random 为兼容旧配置保留
    #[serde(default = "default_load_balance")]
    pub load_balance: String,
}

fn default_load_balance() -> String {
    "failover".to_string()
}

/// 顶层配置（磁盘 JSON 的根结构）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    #[serde(default)]
    pub messages: ServiceConfig,
    #[serde(default)]
    pub responses: ServiceConfig,
    #[serde(default)]
    pub gemini: ServiceConfig,
    /// 全局模型重定向映射（渠道映射优先）
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub global_model_mapping: HashMap<String, String>,
    /// 全局思考强度重定向映射（键值均为小写）
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub global_reasoning_mapping: HashMap<String, String>,
}

impl ProxyConfig {
    #[must_use]
    pub fn service(&self, api_type: ApiType) -> &ServiceConfig {
        match api_type {
            ApiType::Messages => &self.messages,
            ApiType::Responses => &self.responses,
            ApiType::Gemini => &self.gemini,
        }
    }

    pub fn service_mut(&mut self, api_type: ApiType) -> &mut ServiceConfig {
        match api_type {
            ApiType::Messages => &mut self.messages,
            ApiType::Responses => &mut self.responses,
            ApiType::Gemini => &mut self.gemini,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_api_key_meta_round_trip() {
        let mut channel = UpstreamChannel {
            api_keys: vec!["sk-1".to_string()],
            ..Default::default()
        };

        channel.set_api_key_disabled("sk-1", true);
        assert!(channel.is_api_key_disabled("sk-1"));

        // 恢复启用且无描述 -> 元信息条目应被移除
        channel.set_api_key_disabled("sk-1", false);
        assert!(!channel.is_api_key_disabled("sk-1"));
        assert!(!channel.api_key_meta.contains_key("sk-1"));
    }

    #[test]
    fn test_meta_with_description_survives_enable() {
        let mut channel = UpstreamChannel::default();
        channel.set_api_key_meta(
            "sk-1",
            ApiKeyMeta {
                disabled: false,
                description: "备用".to_string(),
            },
        );
        assert!(channel.api_key_meta.contains_key("sk-1"));
        assert!(!channel.is_api_key_disabled("sk-1"));
    }

    #[test]
    fn test_effective_priority_zero_uses_index() {
        let channel = UpstreamChannel::default();
        assert_eq!(channel.effective_priority(3), 3);

        let prioritized = UpstreamChannel {
            priority: 2,
            ..Default::default()
        };
        assert_eq!(prioritized.effective_priority(3), 2);
    }

    #[test]
    fn test_cooldown_channel_schedulable_after_expiry() {
        let now = Utc::now();
        let mut channel = UpstreamChannel {
            status: ChannelStatus::Cooldown,
            cooldown_until: Some(now + Duration::minutes(5)),
            ..Default::default()
        };
        assert!(!channel.schedulable(now));
        channel.cooldown_until = Some(now - Duration::minutes(1));
        assert!(channel.schedulable(now));
    }

    #[test]
    fn test_active_keys_skip_disabled() {
        let mut channel = UpstreamChannel {
            api_keys: vec!["sk-1".to_string(), "sk-2".to_string()],
            ..Default::default()
        };
        channel.set_api_key_disabled("sk-1", true);
        assert_eq!(channel.active_keys(), vec!["sk-2".to_string()]);
    }
}
