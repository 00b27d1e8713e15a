//! # 错误处理模块
//!
//! 统一的错误类型定义和处理

mod types;

pub use types::*;

/// 应用结果类型
pub type Result<T> = std::result::Result<T, ProxyError>;
