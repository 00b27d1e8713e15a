//! # 环境变量配置
//!
//! 进程启动时读取一次，之后只读。

use std::env;

/// 运行时环境配置
#[derive(Debug, Clone)]
pub struct EnvConfig {
    /// 监听端口
    pub port: u16,
    /// 非流式请求的整体超时（毫秒）
    pub request_timeout_ms: u64,
    /// 入站请求体上限（字节）
    pub max_request_body_size: usize,
    /// 指标滑动窗口大小
    pub metrics_window_size: usize,
    /// 失败率阈值（0-1）
    pub metrics_failure_threshold: f64,
    /// 历史数据保留天数（1-7）
    pub metrics_retention_days: u32,
    /// 请求日志环形缓冲容量
    pub request_logs_memory_max_size: usize,
    /// 管理端访问密钥；为空表示不鉴权（仅限内网部署）
    pub proxy_access_key: String,
    /// 是否输出详细请求日志
    pub enable_request_logs: bool,
    /// 开发模式（ENV=development）
    pub development: bool,
    /// 配置文件路径
    pub config_path: String,
    /// 是否启用内嵌 Web UI（本核心仅接受该开关，UI 资源由外部提供）
    pub enable_web_ui: bool,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            request_timeout_ms: 120_000,
            max_request_body_size: 10 * 1024 * 1024,
            metrics_window_size: 50,
            metrics_failure_threshold: 0.5,
            metrics_retention_days: 7,
            request_logs_memory_max_size: 500,
            proxy_access_key: String::new(),
            enable_request_logs: false,
            development: false,
            config_path: ".config/config.json".to_string(),
            enable_web_ui: false,
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_bool(key: &str) -> bool {
    env::var(key)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false)
}

impl EnvConfig {
    /// 从环境变量加载配置（非法值回退到默认值）
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let development = env::var("ENV").map(|v| v == "development").unwrap_or(false);
        Self {
            port: parse_env("PORT", defaults.port),
            request_timeout_ms: parse_env("REQUEST_TIMEOUT", defaults.request_timeout_ms),
            max_request_body_size: parse_env(
                "MAX_REQUEST_BODY_SIZE",
                defaults.max_request_body_size,
            ),
            metrics_window_size: parse_env("METRICS_WINDOW_SIZE", defaults.metrics_window_size)
                .max(3),
            metrics_failure_threshold: {
                let threshold = parse_env(
                    "METRICS_FAILURE_THRESHOLD",
                    defaults.metrics_failure_threshold,
                );
                if threshold <= 0.0 || threshold > 1.0 {
                    defaults.metrics_failure_threshold
                } else {
                    threshold
                }
            },
            metrics_retention_days: parse_env(
                "METRICS_RETENTION_DAYS",
                defaults.metrics_retention_days,
            )
            .clamp(1, 7),
            request_logs_memory_max_size: parse_env(
                "REQUEST_LOGS_MEMORY_MAX_SIZE",
                defaults.request_logs_memory_max_size,
            ),
            proxy_access_key: env::var("PROXY_ACCESS_KEY").unwrap_or_default(),
            enable_request_logs: parse_bool("ENABLE_REQUEST_LOGS") || development,
            development,
            config_path: env::var("CONFIG_PATH")
                .unwrap_or_else(|_| defaults.config_path.clone()),
            enable_web_ui: parse_bool("ENABLE_WEB_UI"),
        }
    }
}
