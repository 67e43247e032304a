//! 上游错误分类
//!
//! 优先使用适配器标注的类别，其次是状态码，最后才按消息匹配

use errors::{ErrorKind, UpstreamError};

/// 限流相关的消息模式
const RATE_LIMIT_PATTERNS: &[&str] = &[
    "rate limit",
    "rate-limit",
    "too many requests",
    "quota exceeded",
    "throttl",
];

/// 超时相关的消息模式
const TIMEOUT_PATTERNS: &[&str] = &["timeout", "timed out", "etimedout", "deadline exceeded"];

/// 参数校验相关的消息模式
const VALIDATION_PATTERNS: &[&str] = &[
    "validation",
    "invalid request",
    "invalid argument",
    "bad request",
    "unprocessable",
];

/// 上游服务端错误的消息模式
const UPSTREAM_API_PATTERNS: &[&str] = &[
    "internal server error",
    "bad gateway",
    "service unavailable",
    "gateway timeout",
    "overloaded",
    "api error",
];

/// 对上游错误分类
pub fn classify(err: &UpstreamError) -> ErrorKind {
    if let Some(kind) = err.kind {
        return kind;
    }
    if let Some(kind) = err.status.and_then(classify_status) {
        return kind;
    }
    classify_message(&err.message)
}

/// 按 HTTP 状态码分类
pub fn classify_status(status: u16) -> Option<ErrorKind> {
    match status {
        408 | 504 => Some(ErrorKind::Timeout),
        429 => Some(ErrorKind::RateLimit),
        400 | 422 => Some(ErrorKind::Validation),
        500..=599 => Some(ErrorKind::UpstreamApi),
        _ => None,
    }
}

/// 按消息内容分类，顺序决定优先级
pub fn classify_message(message: &str) -> ErrorKind {
    let lower = message.to_lowercase();
    let matches = |patterns: &[&str]| patterns.iter().any(|p| lower.contains(p));

    if matches(RATE_LIMIT_PATTERNS) {
        ErrorKind::RateLimit
    } else if matches(TIMEOUT_PATTERNS) {
        ErrorKind::Timeout
    } else if matches(VALIDATION_PATTERNS) {
        ErrorKind::Validation
    } else if matches(UPSTREAM_API_PATTERNS) {
        ErrorKind::UpstreamApi
    } else if common::is_retryable_error(&lower) {
        ErrorKind::Network
    } else {
        ErrorKind::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_wins_over_everything() {
        let err = UpstreamError::tagged(ErrorKind::Validation, "connection reset").with_status(503);
        assert_eq!(classify(&err), ErrorKind::Validation);
    }

    #[test]
    fn test_status_wins_over_message() {
        let err = UpstreamError::new("connection reset").with_status(429);
        assert_eq!(classify(&err), ErrorKind::RateLimit);

        let err = UpstreamError::new("whatever").with_status(502);
        assert_eq!(classify(&err), ErrorKind::UpstreamApi);

        let err = UpstreamError::new("nope").with_status(422);
        assert_eq!(classify(&err), ErrorKind::Validation);
    }

    #[test]
    fn test_unknown_status_falls_back_to_message() {
        let err = UpstreamError::new("request timed out").with_status(418);
        assert_eq!(classify(&err), ErrorKind::Timeout);
    }

    #[test]
    fn test_message_patterns() {
        let cases = [
            ("Rate limit reached for model", ErrorKind::RateLimit),
            ("upstream timeout after 30s", ErrorKind::Timeout),
            ("Validation failed: prompt too long", ErrorKind::Validation),
            ("503 Service Unavailable", ErrorKind::UpstreamApi),
            ("ECONNRESET", ErrorKind::Network),
            ("broken pipe", ErrorKind::Network),
            ("something odd happened", ErrorKind::Unknown),
        ];
        for (message, expected) in cases {
            assert_eq!(classify(&UpstreamError::new(message)), expected, "{message}");
        }
    }
}
