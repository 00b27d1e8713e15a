//! 通用工具模块：SSE 编解码、哈希、脱敏、时间计算

pub mod crypto;
pub mod mask;
pub mod sse;
pub mod time;

pub use crypto::{hash_api_key, metrics_key};
pub use mask::{mask_api_key, mask_sensitive_headers, mask_user_id};
pub use time::{next_local_midnight, today_elapsed};
