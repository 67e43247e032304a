//! tiergate-errors - 统一错误处理
//!
//! 缓存层与上游调用共享的错误分类，基于 RFC 7807 Problem Details 规范输出

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 上游错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    Network,
    UpstreamApi,
    Validation,
    RateLimit,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Network => "network",
            Self::UpstreamApi => "upstream_api",
            Self::Validation => "validation",
            Self::RateLimit => "rate_limit",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 上游适配器返回的错误
///
/// `kind` 由适配器显式标注；缺省时由分类器根据状态码和消息推断
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct UpstreamError {
    pub kind: Option<ErrorKind>,
    pub message: String,
    pub status: Option<u16>,
}

impl UpstreamError {
    /// 未标注类别的错误
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            kind: None,
            message: message.into(),
            status: None,
        }
    }

    /// 带类别标注的错误
    pub fn tagged(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind: Some(kind),
            message: message.into(),
            status: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }
}

/// 应用错误类型
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Cache tier {tier} unavailable: {reason}")]
    CacheTierUnavailable { tier: String, reason: String },

    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("Upstream operation {operation} timed out: {detail}")]
    UpstreamTimeout { operation: String, detail: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Upstream API error: {0}")]
    UpstreamApi(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Upstream validation error: {0}")]
    UpstreamValidation(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Circuit breaker open for {operation}, retry after {retry_after_ms}ms")]
    CircuitOpen {
        operation: String,
        retry_after_ms: u64,
    },

    #[error("Operation {operation} failed after {attempts} attempts: {source}")]
    RetryExhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: Box<AppError>,
    },

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn tier_unavailable(tier: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CacheTierUnavailable {
            tier: tier.into(),
            reason: reason.into(),
        }
    }

    pub fn capacity_exceeded(msg: impl Into<String>) -> Self {
        Self::CapacityExceeded(msg.into())
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// 将已分类的上游错误转换为应用错误
    pub fn from_upstream(kind: ErrorKind, operation: &str, err: UpstreamError) -> Self {
        match kind {
            ErrorKind::Timeout => Self::UpstreamTimeout {
                operation: operation.to_string(),
                detail: err.message,
            },
            ErrorKind::Network => Self::Network(err.message),
            ErrorKind::UpstreamApi => Self::UpstreamApi(err.message),
            ErrorKind::Validation => Self::UpstreamValidation(err.message),
            ErrorKind::RateLimit => Self::RateLimited(err.message),
            ErrorKind::Unknown => Self::Upstream(err.message),
        }
    }

    /// 上游相关错误的类别（非上游错误返回 None）
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::UpstreamTimeout { .. } => Some(ErrorKind::Timeout),
            Self::Network(_) => Some(ErrorKind::Network),
            Self::UpstreamApi(_) => Some(ErrorKind::UpstreamApi),
            Self::UpstreamValidation(_) => Some(ErrorKind::Validation),
            Self::RateLimited(_) => Some(ErrorKind::RateLimit),
            Self::Upstream(_) => Some(ErrorKind::Unknown),
            Self::RetryExhausted { source, .. } => source.kind(),
            _ => None,
        }
    }

    /// 是否为熔断快速失败
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// 转换为 HTTP 状态码
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidArgument(_) => 400,
            Self::CacheTierUnavailable { .. } => 503,
            Self::CapacityExceeded(_) => 507,
            Self::UpstreamTimeout { .. } => 504,
            Self::Network(_) => 502,
            Self::UpstreamApi(_) => 502,
            Self::RateLimited(_) => 429,
            Self::UpstreamValidation(_) => 422,
            Self::Upstream(_) => 502,
            Self::CircuitOpen { .. } => 503,
            Self::RetryExhausted { source, .. } => source.status_code(),
            Self::Cancelled(_) => 499,
            Self::Serialization(_) => 500,
            Self::Database(_) => 500,
            Self::Internal(_) => 500,
        }
    }

    /// 转换为 Problem Details
    pub fn to_problem_details(&self) -> ProblemDetails {
        ProblemDetails {
            r#type: format!("https://tiergate.dev/problems/{}", self.problem_slug()),
            title: self.problem_title().to_string(),
            status: self.status_code(),
            detail: self.to_string(),
            instance: None,
        }
    }

    fn problem_slug(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "invalid-argument",
            Self::CacheTierUnavailable { .. } => "cache-tier-unavailable",
            Self::CapacityExceeded(_) => "capacity-exceeded",
            Self::UpstreamTimeout { .. } => "upstream-timeout",
            Self::Network(_) => "network",
            Self::UpstreamApi(_) => "upstream-api",
            Self::RateLimited(_) => "rate-limited",
            Self::UpstreamValidation(_) => "upstream-validation",
            Self::Upstream(_) => "upstream",
            Self::CircuitOpen { .. } => "circuit-open",
            Self::RetryExhausted { .. } => "retry-exhausted",
            Self::Cancelled(_) => "cancelled",
            Self::Serialization(_) => "serialization",
            Self::Database(_) => "database",
            Self::Internal(_) => "internal",
        }
    }

    fn problem_title(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "Invalid Argument",
            Self::CacheTierUnavailable { .. } => "Cache Tier Unavailable",
            Self::CapacityExceeded(_) => "Capacity Exceeded",
            Self::UpstreamTimeout { .. } => "Upstream Timeout",
            Self::Network(_) => "Network Error",
            Self::UpstreamApi(_) => "Upstream API Error",
            Self::RateLimited(_) => "Rate Limited",
            Self::UpstreamValidation(_) => "Upstream Validation Error",
            Self::Upstream(_) => "Upstream Error",
            Self::CircuitOpen { .. } => "Service Temporarily Degraded",
            Self::RetryExhausted { .. } => "Retries Exhausted",
            Self::Cancelled(_) => "Cancelled",
            Self::Serialization(_) => "Serialization Error",
            Self::Database(_) => "Database Error",
            Self::Internal(_) => "Internal Server Error",
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// RFC 7807 Problem Details
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProblemDetails {
    pub r#type: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
}

/// Result 类型别名
pub type AppResult<T> = Result<T, AppError>;
