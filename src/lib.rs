#![allow(missing_docs)]
//! # LLM 渠道代理网关核心库
//!
//! 多渠道 LLM API 反向代理：渠道/Key 调度、双层熔断、流式转发改写、
//! 用量与成本归因、内存态请求日志。

pub mod config;
pub mod error;
pub mod logging;
pub mod management;
pub mod metrics;
pub mod pricing;
pub mod proxy;
pub mod sched;
pub mod server;
pub mod utils;

// Re-export commonly used types
pub use config::{ApiType, EnvConfig};
pub use error::{ProxyError, Result};
pub use proxy::AppState;
