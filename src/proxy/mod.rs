//! # 转发模块
//!
//! 按 apiType 编排请求：读取与预处理请求体、循环调度槽位、转发上游、
//! 流式拦截改写、用量归因与失败记录。

pub mod balance;
pub mod body;
pub mod client;
pub mod handler;
pub mod stream;
pub mod synthesizer;

pub use client::HttpClientManager;
pub use handler::AppState;
