//! # 请求日志环形缓冲
//!
//! 在内存中保存最近 N 条请求日志，供管理端查看。
//! 按 (apiType, channelIndex, keyId) 维护累计计数：计数只增不减，
//! 环形淘汰不影响计数；"重置"通过记录 baseline 与 resetAt 实现，
//! 早于 resetAt 的日志在查询时被隐藏。

use crate::config::ApiType;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::RwLock;

/// 单条请求日志
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestLogRecord {
    /// 插入时分配的严格递增 ID
    pub id: i64,
    pub request_id: String,
    pub api_type: ApiType,
    pub channel_index: usize,
    pub channel_name: String,
    pub key_mask: String,
    /// hash16(apiKey)；缺失时为 "unknown"
    pub key_id: String,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: i64,
    pub status_code: u16,
    pub success: bool,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_creation_tokens: i64,
    pub cache_read_tokens: i64,
    pub cost_cents: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_headers: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_body: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub request_body_truncated: bool,
}

/// 查询结果页
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestLogsPage {
    pub logs: Vec<RequestLogRecord>,
    pub total: i64,
    /// 本次进程内的累计请求数（受重置影响，不受环形容量影响）
    pub total_requests: i64,
    pub limit: usize,
    pub offset: usize,
}

#[derive(Debug, Default, Clone)]
struct KeyCounter {
    total: i64,
    baseline: i64,
    reset_at: Option<DateTime<Utc>>,
}

struct Inner {
    capacity: usize,
    buf: Vec<RequestLogRecord>,
    start: usize,
    size: usize,
    next_id: i64,
    counters: HashMap<(ApiType, usize, String), KeyCounter>,
    channel_resets: HashMap<(ApiType, usize), DateTime<Utc>>,
}

/// 请求日志存储（单写锁）
pub struct RequestLogStore {
    inner: RwLock<Inner>,
}

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 200;

impl RequestLogStore {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = if capacity == 0 { 500 } else { capacity };
        Self {
            inner: RwLock::new(Inner {
                capacity,
                buf: Vec::with_capacity(capacity),
                start: 0,
                size: 0,
                next_id: 0,
                counters: HashMap::new(),
                channel_resets: HashMap::new(),
            }),
        }
    }

    /// 插入一条日志，返回分配的 ID
    pub fn add(&self, mut record: RequestLogRecord) -> i64 {
        let Ok(mut inner) = self.inner.write() else {
            return 0;
        };
        inner.next_id += 1;
        record.id = inner.next_id;
        let id = record.id;

        let counter_key = (record.api_type, record.channel_index, record.key_id.clone());
        inner.counters.entry(counter_key).or_default().total += 1;

        if inner.size < inner.capacity {
            inner.buf.push(record);
            inner.size += 1;
        } else {
            let start = inner.start;
            inner.buf[start] = record;
            inner.start = (start + 1) % inner.capacity;
        }
        id
    }

    fn effective_reset_at(inner: &Inner, record: &RequestLogRecord) -> Option<DateTime<Utc>> {
        let key_reset = inner
            .counters
            .get(&(record.api_type, record.channel_index, record.key_id.clone()))
            .and_then(|c| c.reset_at);
        let channel_reset = inner
            .channel_resets
            .get(&(record.api_type, record.channel_index))
            .copied();
        std::cmp::max(key_reset, channel_reset)
    }

    fn visible(inner: &Inner, record: &RequestLogRecord) -> bool {
        match Self::effective_reset_at(inner, record) {
            Some(reset_at) => record.timestamp >= reset_at,
            None => true,
        }
    }

    /// 按 apiType 查询：时间倒序、重置过滤、分页
    #[must_use]
    pub fn query(&self, api_type: ApiType, limit: usize, offset: usize) -> RequestLogsPage {
        let limit = if limit == 0 {
            DEFAULT_LIMIT
        } else {
            limit.min(MAX_LIMIT)
        };

        let Ok(inner) = self.inner.read() else {
            return RequestLogsPage {
                logs: Vec::new(),
                total: 0,
                total_requests: 0,
                limit,
                offset,
            };
        };

        let mut filtered: Vec<RequestLogRecord> = (0..inner.size)
            .map(|i| &inner.buf[(inner.start + i) % inner.capacity])
            .filter(|rec| rec.api_type == api_type && Self::visible(&inner, rec))
            .cloned()
            .collect();
        filtered.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        let total = filtered.len() as i64;
        let logs = if offset >= filtered.len() {
            Vec::new()
        } else {
            filtered
                .into_iter()
                .skip(offset)
                .take(limit)
                .collect()
        };

        RequestLogsPage {
            logs,
            total,
            total_requests: Self::total_request_count_locked(&inner, api_type),
            limit,
            offset,
        }
    }

    /// 按 ID 查询详情；被重置隐藏或从未插入时返回 None
    #[must_use]
    pub fn get_detail(&self, api_type: ApiType, id: i64) -> Option<RequestLogRecord> {
        let inner = self.inner.read().ok()?;
        (0..inner.size)
            .map(|i| &inner.buf[(inner.start + i) % inner.capacity])
            .find(|rec| rec.api_type == api_type && rec.id == id)
            .filter(|rec| Self::visible(&inner, rec))
            .cloned()
    }

    fn total_request_count_locked(inner: &Inner, api_type: ApiType) -> i64 {
        inner
            .counters
            .iter()
            .filter(|((api, _, _), _)| *api == api_type)
            .map(|(_, counter)| (counter.total - counter.baseline).max(0))
            .sum()
    }

    /// 指定 apiType 的累计请求数（全渠道汇总，扣除重置基线）
    #[must_use]
    pub fn get_total_request_count(&self, api_type: ApiType) -> i64 {
        self.inner
            .read()
            .map(|inner| Self::total_request_count_locked(&inner, api_type))
            .unwrap_or(0)
    }

    /// 指定 Key 的累计请求数
    #[must_use]
    pub fn get_key_request_count(
        &self,
        api_type: ApiType,
        channel_index: usize,
        key_id: &str,
    ) -> i64 {
        self.inner
            .read()
            .ok()
            .and_then(|inner| {
                inner
                    .counters
                    .get(&(api_type, channel_index, key_id.to_string()))
                    .map(|c| (c.total - c.baseline).max(0))
            })
            .unwrap_or(0)
    }

    /// 重置单个 Key：基线对齐到当前累计值并记录 resetAt。
    /// 返回本次被隐藏的日志条数。
    pub fn reset_key(&self, api_type: ApiType, channel_index: usize, key_id: &str) -> usize {
        let Ok(mut inner) = self.inner.write() else {
            return 0;
        };
        let now = Utc::now();
        let counter = inner
            .counters
            .entry((api_type, channel_index, key_id.to_string()))
            .or_default();
        counter.baseline = counter.total;
        counter.reset_at = Some(now);

        (0..inner.size)
            .map(|i| &inner.buf[(inner.start + i) % inner.capacity])
            .filter(|rec| {
                rec.api_type == api_type
                    && rec.channel_index == channel_index
                    && rec.key_id == key_id
                    && rec.timestamp < now
            })
            .count()
    }

    /// 重置整个渠道：所有 Key 基线对齐，并记录渠道级 resetAt。
    /// 返回本次被隐藏的日志条数。
    pub fn reset_channel(&self, api_type: ApiType, channel_index: usize) -> usize {
        let Ok(mut inner) = self.inner.write() else {
            return 0;
        };
        let now = Utc::now();
        for ((api, ch, _), counter) in inner.counters.iter_mut() {
            if *api == api_type && *ch == channel_index {
                counter.baseline = counter.total;
                counter.reset_at = Some(now);
            }
        }
        inner.channel_resets.insert((api_type, channel_index), now);

        (0..inner.size)
            .map(|i| &inner.buf[(inner.start + i) % inner.capacity])
            .filter(|rec| {
                rec.api_type == api_type
                    && rec.channel_index == channel_index
                    && rec.timestamp < now
            })
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(api_type: ApiType, channel: usize, key_id: &str) -> RequestLogRecord {
        RequestLogRecord {
            id: 0,
            request_id: uuid::Uuid::new_v4().to_string(),
            api_type,
            channel_index: channel,
            channel_name: "ch".to_string(),
            key_mask: "sk-a...b".to_string(),
            key_id: key_id.to_string(),
            timestamp: Utc::now(),
            duration_ms: 10,
            status_code: 200,
            success: true,
            model: "m".to_string(),
            reasoning_effort: None,
            input_tokens: 1,
            output_tokens: 2,
            cache_creation_tokens: 0,
            cache_read_tokens: 0,
            cost_cents: 0,
            error_message: None,
            request_headers: None,
            request_body: None,
            request_body_truncated: false,
        }
    }

    #[test]
    fn test_ids_strictly_increasing() {
        let store = RequestLogStore::new(10);
        let a = store.add(record(ApiType::Messages, 0, "k1"));
        let b = store.add(record(ApiType::Messages, 0, "k1"));
        assert!(b > a);
    }

    #[test]
    fn test_capacity_bounded_but_counter_monotonic() {
        let store = RequestLogStore::new(3);
        for _ in 0..10 {
            store.add(record(ApiType::Responses, 0, "k1"));
        }
        let page = store.query(ApiType::Responses, 50, 0);
        // 环形缓冲只保留 3 条
        assert_eq!(page.total, 3);
        // 累计计数不受淘汰影响
        assert_eq!(store.get_total_request_count(ApiType::Responses), 10);
    }

    #[test]
    fn test_query_filters_by_api_type_and_sorts_desc() {
        let store = RequestLogStore::new(10);
        store.add(record(ApiType::Messages, 0, "k1"));
        store.add(record(ApiType::Gemini, 0, "k1"));
        store.add(record(ApiType::Messages, 1, "k2"));

        let page = store.query(ApiType::Messages, 50, 0);
        assert_eq!(page.total, 2);
        assert!(page.logs[0].timestamp >= page.logs[1].timestamp);
    }

    #[test]
    fn test_limit_default_and_cap() {
        let store = RequestLogStore::new(500);
        for _ in 0..300 {
            store.add(record(ApiType::Messages, 0, "k1"));
        }
        let page = store.query(ApiType::Messages, 0, 0);
        assert_eq!(page.limit, 50);
        assert_eq!(page.logs.len(), 50);

        let page = store.query(ApiType::Messages, 1000, 0);
        assert_eq!(page.limit, 200);
        assert_eq!(page.logs.len(), 200);
    }

    #[test]
    fn test_reset_key_hides_and_rebaselines() {
        let store = RequestLogStore::new(10);
        for _ in 0..4 {
            store.add(record(ApiType::Messages, 0, "k1"));
        }
        store.add(record(ApiType::Messages, 0, "k2"));
        assert_eq!(store.get_total_request_count(ApiType::Messages), 5);

        let hidden = store.reset_key(ApiType::Messages, 0, "k1");
        assert_eq!(hidden, 4);
        assert_eq!(store.get_key_request_count(ApiType::Messages, 0, "k1"), 0);
        // k2 不受影响
        assert_eq!(store.get_key_request_count(ApiType::Messages, 0, "k2"), 1);
        assert_eq!(store.get_total_request_count(ApiType::Messages), 1);

        // 重置后的查询不应返回 k1 的旧日志
        let page = store.query(ApiType::Messages, 50, 0);
        assert!(page.logs.iter().all(|rec| rec.key_id != "k1"));

        // 重置后的新日志正常可见并计数
        store.add(record(ApiType::Messages, 0, "k1"));
        assert_eq!(store.get_key_request_count(ApiType::Messages, 0, "k1"), 1);
    }

    #[test]
    fn test_reset_channel_hides_all_keys() {
        let store = RequestLogStore::new(10);
        store.add(record(ApiType::Gemini, 0, "k1"));
        store.add(record(ApiType::Gemini, 0, "k2"));
        store.add(record(ApiType::Gemini, 1, "k3"));

        let hidden = store.reset_channel(ApiType::Gemini, 0);
        assert_eq!(hidden, 2);
        assert_eq!(store.get_total_request_count(ApiType::Gemini), 1);
        let page = store.query(ApiType::Gemini, 50, 0);
        assert_eq!(page.total, 1);
        assert_eq!(page.logs[0].channel_index, 1);
    }

    #[test]
    fn test_detail_lookup_honors_reset() {
        let store = RequestLogStore::new(10);
        let id = store.add(record(ApiType::Messages, 0, "k1"));
        assert!(store.get_detail(ApiType::Messages, id).is_some());

        store.reset_key(ApiType::Messages, 0, "k1");
        assert!(store.get_detail(ApiType::Messages, id).is_none());
        // 从未插入的 ID
        assert!(store.get_detail(ApiType::Messages, 9999).is_none());
    }

    #[test]
    fn test_pagination_offset() {
        let store = RequestLogStore::new(100);
        for _ in 0..30 {
            store.add(record(ApiType::Responses, 0, "k1"));
        }
        let page = store.query(ApiType::Responses, 10, 25);
        assert_eq!(page.logs.len(), 5);
        let page = store.query(ApiType::Responses, 10, 100);
        assert!(page.logs.is_empty());
        assert_eq!(page.total, 30);
    }
}
