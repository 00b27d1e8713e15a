//! # 错误类型定义

use axum::http::StatusCode;
use axum::response::IntoResponse;
use thiserror::Error;

/// 应用主要错误类型
#[derive(Debug, Error)]
pub enum ProxyError {
    /// 配置相关错误
    #[error("配置错误: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// IO相关错误
    #[error("IO错误: {message}")]
    Io {
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// 序列化/反序列化错误
    #[error("序列化错误: {message}")]
    Serialization {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// 网络通信错误
    #[error("网络错误: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// 认证错误
    #[error("认证错误: {message}")]
    Authentication { message: String },

    /// 请求不合法（400）
    #[error("请求错误: {message}")]
    BadRequest { message: String },

    /// 请求体超限（413）
    #[error("请求体过大: {message}")]
    BodyTooLarge { message: String },

    /// 调度器无可用上游（503），`code` 标识哪个池为空
    #[error("无可用上游: {message}")]
    NoUpstreamAvailable { message: String, code: &'static str },

    /// 客户端取消请求：不计数、不记日志
    #[error("客户端已取消请求")]
    ClientCanceled,

    /// 上游不可用（可重试类失败耗尽后的最终错误）
    #[error("上游服务器不可用: {message}")]
    UpstreamNotAvailable {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// 系统内部错误
    #[error("内部错误: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },
}

impl ProxyError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    pub fn config_with_source(message: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn io(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            message: message.into(),
            source,
        }
    }

    pub fn serialization(message: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        Self::Serialization {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            source: None,
        }
    }

    pub fn network_with_source(message: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        Self::Network {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::Authentication {
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest {
            message: message.into(),
        }
    }

    pub fn body_too_large(message: impl Into<String>) -> Self {
        Self::BodyTooLarge {
            message: message.into(),
        }
    }

    pub fn no_upstream(code: &'static str, message: impl Into<String>) -> Self {
        Self::NoUpstreamAvailable {
            message: message.into(),
            code,
        }
    }

    pub fn upstream_not_available(message: impl Into<String>) -> Self {
        Self::UpstreamNotAvailable {
            message: message.into(),
            source: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            source: None,
        }
    }

    pub fn internal_with_source(
        message: impl Into<String>,
        source: impl Into<anyhow::Error>,
    ) -> Self {
        Self::Internal {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// 对应的 HTTP 状态码
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Authentication { .. } => StatusCode::UNAUTHORIZED,
            Self::BadRequest { .. } | Self::Serialization { .. } => StatusCode::BAD_REQUEST,
            Self::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::NoUpstreamAvailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::UpstreamNotAvailable { .. } | Self::Network { .. } => StatusCode::BAD_GATEWAY,
            // 取消的请求不应真正产生响应，这里仅为类型完备
            Self::ClientCanceled => StatusCode::BAD_REQUEST,
            Self::Config { .. } | Self::Io { .. } | Self::Internal { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// 稳定的错误码（用于响应体与日志检索）
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Config { .. } => "CONFIG_ERROR",
            Self::Io { .. } => "IO_ERROR",
            Self::Serialization { .. } => "SERIALIZATION_ERROR",
            Self::Network { .. } => "NETWORK_ERROR",
            Self::Authentication { .. } => "UNAUTHORIZED",
            Self::BadRequest { .. } => "BAD_REQUEST",
            Self::BodyTooLarge { .. } => "BODY_TOO_LARGE",
            Self::NoUpstreamAvailable { code, .. } => code,
            Self::ClientCanceled => "CLIENT_CANCELED",
            Self::UpstreamNotAvailable { .. } => "UPSTREAM_NOT_AVAILABLE",
            Self::Internal { .. } => "INTERNAL_ERROR",
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let body = serde_json::json!({ "error": self.to_string(), "code": self.error_code() });
        (status, axum::Json(body)).into_response()
    }
}
