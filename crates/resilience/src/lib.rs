//! tiergate-resilience - 上游调用保护
//!
//! - 错误分类：标注 > 状态码 > 消息匹配
//! - 断路器：按操作名隔离，HalfOpen 只放行一个试探调用
//! - 重试执行器：单次尝试超时、指数退避 + 抖动、取消

pub mod circuit_breaker;
pub mod classifier;
pub mod context;
pub mod executor;

pub use circuit_breaker::{
    BreakerConfig, BreakerSnapshot, CallPermit, CircuitBreaker, CircuitBreakerRegistry,
    CircuitState,
};
pub use classifier::classify;
pub use context::{AttemptOutcome, RetryAttempt, RetryContext, RetryContextStore};
pub use executor::{
    ExecuteOptions, ExecutorMetricsSnapshot, RetryExecutor, RetryPolicy, default_retryable_kinds,
};
