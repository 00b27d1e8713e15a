//! # 共享 HTTP 客户端管理
//!
//! 客户端按 (timeout, insecureSkipVerify) 复用，连接池按目标主机聚合。
//! 流式请求使用无整体超时的客户端，取消是唯一的停止机制。

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

/// HTTP 客户端管理器
pub struct HttpClientManager {
    standard: RwLock<HashMap<(u64, bool), reqwest::Client>>,
    stream: RwLock<HashMap<bool, reqwest::Client>>,
}

impl Default for HttpClientManager {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClientManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            standard: RwLock::new(HashMap::new()),
            stream: RwLock::new(HashMap::new()),
        }
    }

    /// 非流式客户端：整体超时
    pub fn standard_client(&self, timeout: Duration, insecure: bool) -> reqwest::Client {
        let key = (timeout.as_millis() as u64, insecure);
        if let Ok(map) = self.standard.read() {
            if let Some(client) = map.get(&key) {
                return client.clone();
            }
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(30))
            .danger_accept_invalid_certs(insecure)
            .build()
            .unwrap_or_default();
        if let Ok(mut map) = self.standard.write() {
            map.insert(key, client.clone());
        }
        client
    }

    /// 流式客户端：无整体超时，仅连接超时
    pub fn stream_client(&self, insecure: bool) -> reqwest::Client {
        if let Ok(map) = self.stream.read() {
            if let Some(client) = map.get(&insecure) {
                return client.clone();
            }
        }
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .danger_accept_invalid_certs(insecure)
            .build()
            .unwrap_or_default();
        if let Ok(mut map) = self.stream.write() {
            map.insert(insecure, client.clone());
        }
        client
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clients_are_reused() {
        let mgr = HttpClientManager::new();
        let a = mgr.standard_client(Duration::from_secs(10), false);
        let _b = mgr.standard_client(Duration::from_secs(10), false);
        let _c = mgr.stream_client(false);
        // 同参数应复用同一个连接池（Client 内部为 Arc，克隆廉价）
        drop(a);
        assert!(mgr.standard.read().unwrap().len() == 1);
        assert!(mgr.stream.read().unwrap().len() == 1);
    }
}
