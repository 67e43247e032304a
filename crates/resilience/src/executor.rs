//! 重试执行器
//!
//! 每次执行先向断路器申请许可，然后在每次尝试上施加独立的超时。
//! 失败按类别决定是否重试，退避时间由 `RetryConfig` 计算。
//! 只有整次执行的最终结果才会记入断路器，被取消的执行不记录任何结果。

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use common::{RequestId, RetryConfig};
use errors::{AppError, AppResult, ErrorKind, UpstreamError};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::circuit_breaker::{CallPermit, CircuitBreakerRegistry};
use crate::classifier;
use crate::context::{AttemptOutcome, RetryAttempt, RetryContext, RetryContextStore};

/// 每隔多少次执行顺带清理一次过期的重试上下文
const CONTEXT_SWEEP_EVERY: u64 = 64;

/// 重试策略
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub backoff: RetryConfig,
    /// 允许重试的错误类别，Validation 即使出现在这里也不会重试
    pub retryable: HashSet<ErrorKind>,
    /// 单次尝试的默认超时
    pub attempt_timeout: Duration,
    /// 重试上下文保留时长
    pub context_retention: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: RetryConfig::default(),
            retryable: default_retryable_kinds(),
            attempt_timeout: Duration::from_secs(30),
            context_retention: Duration::from_secs(600),
        }
    }
}

pub fn default_retryable_kinds() -> HashSet<ErrorKind> {
    HashSet::from([
        ErrorKind::Timeout,
        ErrorKind::Network,
        ErrorKind::UpstreamApi,
        ErrorKind::RateLimit,
    ])
}

impl RetryPolicy {
    pub fn is_retryable(&self, kind: ErrorKind) -> bool {
        kind != ErrorKind::Validation && self.retryable.contains(&kind)
    }
}

/// 单次执行的选项
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    pub request_id: RequestId,
    pub operation_name: String,
    /// 单次尝试超时，None 时使用策略默认值
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
}

impl ExecuteOptions {
    pub fn new(operation_name: impl Into<String>) -> Self {
        Self {
            request_id: RequestId::new(),
            operation_name: operation_name.into(),
            timeout: None,
            cancel: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<RequestId>) -> Self {
        self.request_id = request_id.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

#[derive(Debug, Default)]
struct ExecutorMetrics {
    calls: AtomicU64,
    successful_calls: AtomicU64,
    failed_calls: AtomicU64,
    cancelled_calls: AtomicU64,
    attempts: AtomicU64,
    timed_out_attempts: AtomicU64,
    circuit_rejections: AtomicU64,
}

/// 执行器指标快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutorMetricsSnapshot {
    pub calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub cancelled_calls: u64,
    pub attempts: u64,
    pub timed_out_attempts: u64,
    pub circuit_rejections: u64,
    /// 失败调用 / 调用总数
    pub error_rate: f64,
    /// 超时尝试 / 尝试总数
    pub timeout_rate: f64,
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

enum AttemptResult<T> {
    Success(T),
    Failed(AppError, ErrorKind, AttemptOutcome),
    Cancelled,
}

/// 等待取消信号，没有令牌时永不完成
async fn cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

/// 带断路器的重试执行器
#[derive(Debug)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    breakers: Arc<CircuitBreakerRegistry>,
    contexts: RetryContextStore,
    metrics: ExecutorMetrics,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        Self {
            policy,
            breakers,
            contexts: RetryContextStore::new(),
            metrics: ExecutorMetrics::default(),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// 执行操作，按策略重试
    ///
    /// - 断路器拒绝时立即返回 `CircuitOpen`，不计为尝试
    /// - 不可重试的错误原样返回
    /// - 可重试错误用尽次数后返回 `RetryExhausted`
    /// - 取消时返回 `Cancelled`
    pub async fn execute_with_retry<F, Fut, T>(
        &self,
        mut operation: F,
        options: ExecuteOptions,
    ) -> AppResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, UpstreamError>>,
    {
        let calls = self.metrics.calls.fetch_add(1, Ordering::Relaxed) + 1;
        if calls % CONTEXT_SWEEP_EVERY == 0 {
            self.purge_contexts(self.policy.context_retention);
        }

        let operation_name = options.operation_name.as_str();
        let request_id = &options.request_id;
        let breaker = self.breakers.get_or_create(operation_name);
        let permit = match breaker.try_acquire() {
            Ok(permit) => permit,
            Err(e) => {
                self.metrics.circuit_rejections.fetch_add(1, Ordering::Relaxed);
                self.metrics.failed_calls.fetch_add(1, Ordering::Relaxed);
                warn!(
                    operation = operation_name,
                    request_id = %request_id,
                    error = %e,
                    "Call rejected by circuit breaker"
                );
                return Err(e);
            }
        };

        self.contexts.begin(request_id, operation_name);
        let timeout = options.timeout.unwrap_or(self.policy.attempt_timeout);
        let max_attempts = self.policy.backoff.max_attempts.max(1);
        let cancel = options.cancel.as_ref();

        for attempt in 1..=max_attempts {
            let started_at = Utc::now();
            let start = Instant::now();
            self.metrics.attempts.fetch_add(1, Ordering::Relaxed);

            let result = if cancel.is_some_and(CancellationToken::is_cancelled) {
                AttemptResult::Cancelled
            } else {
                tokio::select! {
                    biased;
                    _ = cancelled(cancel) => AttemptResult::Cancelled,
                    result = tokio::time::timeout(timeout, operation()) => match result {
                        Ok(Ok(value)) => AttemptResult::Success(value),
                        Ok(Err(err)) => {
                            let kind = classifier::classify(&err);
                            let outcome = if kind == ErrorKind::Timeout {
                                AttemptOutcome::Timeout
                            } else {
                                AttemptOutcome::Failure
                            };
                            AttemptResult::Failed(
                                AppError::from_upstream(kind, operation_name, err),
                                kind,
                                outcome,
                            )
                        }
                        Err(_) => AttemptResult::Failed(
                            AppError::UpstreamTimeout {
                                operation: operation_name.to_string(),
                                detail: format!("attempt exceeded {}ms", timeout.as_millis()),
                            },
                            ErrorKind::Timeout,
                            AttemptOutcome::Timeout,
                        ),
                    },
                }
            };

            let elapsed = start.elapsed();
            let record = |outcome: AttemptOutcome,
                          kind: Option<ErrorKind>,
                          error: Option<String>,
                          next_delay: Option<Duration>| {
                telemetry::recorder::record_upstream_attempt(
                    operation_name,
                    outcome.as_str(),
                    elapsed.as_secs_f64() * 1000.0,
                );
                self.contexts.record(
                    request_id,
                    RetryAttempt {
                        attempt_number: attempt,
                        started_at,
                        ended_at: Utc::now(),
                        duration_ms: elapsed.as_millis() as u64,
                        outcome,
                        error_kind: kind,
                        error,
                        next_delay_ms: next_delay.map(|d| d.as_millis() as u64),
                    },
                );
            };

            let (error, kind, outcome) = match result {
                AttemptResult::Success(value) => {
                    record(AttemptOutcome::Success, None, None, None);
                    permit.success();
                    self.metrics.successful_calls.fetch_add(1, Ordering::Relaxed);
                    if attempt > 1 {
                        info!(
                            operation = operation_name,
                            request_id = %request_id,
                            attempt,
                            "Operation succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                AttemptResult::Cancelled => {
                    record(AttemptOutcome::Cancelled, None, None, None);
                    return Err(self.cancelled_call(permit, operation_name, request_id));
                }
                AttemptResult::Failed(error, kind, outcome) => (error, kind, outcome),
            };

            if outcome == AttemptOutcome::Timeout {
                self.metrics.timed_out_attempts.fetch_add(1, Ordering::Relaxed);
            }

            if !self.policy.is_retryable(kind) {
                record(outcome, Some(kind), Some(error.to_string()), None);
                warn!(
                    operation = operation_name,
                    request_id = %request_id,
                    attempt,
                    kind = %kind,
                    error = %error,
                    "Operation failed with non-retryable error"
                );
                self.failed_call(permit);
                return Err(error);
            }

            if attempt >= max_attempts {
                record(outcome, Some(kind), Some(error.to_string()), None);
                warn!(
                    operation = operation_name,
                    request_id = %request_id,
                    attempt,
                    max_attempts,
                    kind = %kind,
                    error = %error,
                    "Operation failed, no more retries"
                );
                self.failed_call(permit);
                return Err(AppError::RetryExhausted {
                    operation: operation_name.to_string(),
                    attempts: attempt,
                    source: Box::new(error),
                });
            }

            let delay = self.policy.backoff.delay_for_attempt(attempt);
            record(outcome, Some(kind), Some(error.to_string()), Some(delay));
            warn!(
                operation = operation_name,
                request_id = %request_id,
                attempt,
                max_attempts,
                kind = %kind,
                error = %error,
                delay_ms = delay.as_millis() as u64,
                "Operation failed, retrying"
            );

            tokio::select! {
                biased;
                _ = cancelled(cancel) => {
                    return Err(self.cancelled_call(permit, operation_name, request_id));
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        // max_attempts >= 1，循环总会在内部返回
        Err(AppError::internal("retry loop exited without an outcome"))
    }

    fn failed_call(&self, permit: CallPermit) {
        permit.failure();
        self.metrics.failed_calls.fetch_add(1, Ordering::Relaxed);
    }

    /// 取消：丢弃许可，不向断路器记录结果
    fn cancelled_call(&self, permit: CallPermit, operation: &str, request_id: &RequestId) -> AppError {
        drop(permit);
        self.metrics.cancelled_calls.fetch_add(1, Ordering::Relaxed);
        debug!(operation, request_id = %request_id, "Operation cancelled");
        AppError::cancelled(format!("{operation} cancelled by caller"))
    }

    /// 请求的重试上下文
    pub fn context(&self, request_id: &RequestId) -> Option<RetryContext> {
        self.contexts.get(request_id)
    }

    /// 清理超过 `max_age` 的重试上下文
    pub fn purge_contexts(&self, max_age: Duration) -> usize {
        let removed = self.contexts.purge_older_than(max_age);
        if removed > 0 {
            debug!(removed, "Retry contexts purged");
        }
        removed
    }

    pub fn metrics(&self) -> ExecutorMetricsSnapshot {
        let m = &self.metrics;
        let calls = m.calls.load(Ordering::Relaxed);
        let failed_calls = m.failed_calls.load(Ordering::Relaxed);
        let attempts = m.attempts.load(Ordering::Relaxed);
        let timed_out_attempts = m.timed_out_attempts.load(Ordering::Relaxed);
        ExecutorMetricsSnapshot {
            calls,
            successful_calls: m.successful_calls.load(Ordering::Relaxed),
            failed_calls,
            cancelled_calls: m.cancelled_calls.load(Ordering::Relaxed),
            attempts,
            timed_out_attempts,
            circuit_rejections: m.circuit_rejections.load(Ordering::Relaxed),
            error_rate: ratio(failed_calls, calls),
            timeout_rate: ratio(timed_out_attempts, attempts),
        }
    }

    /// 释放所有上下文与断路器
    pub fn dispose(&self) {
        self.contexts.clear();
        self.breakers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::{BreakerConfig, CircuitState};
    use std::sync::atomic::AtomicU32;

    fn executor(max_attempts: u32, threshold: u32) -> RetryExecutor {
        let policy = RetryPolicy {
            backoff: RetryConfig::new(
                max_attempts,
                Duration::from_millis(100),
                Duration::from_secs(1),
            ),
            attempt_timeout: Duration::from_secs(5),
            ..Default::default()
        };
        let breakers = Arc::new(CircuitBreakerRegistry::new(BreakerConfig {
            failure_threshold: threshold,
            open_duration: Duration::from_secs(60),
        }));
        RetryExecutor::new(policy, breakers)
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_then_succeeds() {
        let executor = executor(3, 5);
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let result = executor
            .execute_with_retry(
                move || async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(UpstreamError::new("connection reset by peer"))
                    } else {
                        Ok("ok")
                    }
                },
                ExecuteOptions::new("generate").with_request_id("req-1"),
            )
            .await
            .unwrap();

        assert_eq!(result, "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let context = executor.context(&RequestId::from("req-1")).unwrap();
        let outcomes: Vec<_> = context.attempts.iter().map(|a| a.outcome).collect();
        assert_eq!(
            outcomes,
            vec![AttemptOutcome::Failure, AttemptOutcome::Failure, AttemptOutcome::Success]
        );
        assert_eq!(context.attempts[0].next_delay_ms, Some(100));
        assert_eq!(context.attempts[1].next_delay_ms, Some(200));
        assert_eq!(context.attempts[0].error_kind, Some(ErrorKind::Network));
    }

    #[tokio::test(start_paused = true)]
    async fn test_validation_error_is_attempted_once() {
        let executor = executor(5, 5);
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let err = executor
            .execute_with_retry(
                move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(UpstreamError::tagged(ErrorKind::Validation, "prompt too long"))
                },
                ExecuteOptions::new("generate"),
            )
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, AppError::UpstreamValidation(ref m) if m == "prompt too long"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_wraps_last_error() {
        let executor = executor(3, 5);
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let err = executor
            .execute_with_retry(
                move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(UpstreamError::new("bad gateway").with_status(502))
                },
                ExecuteOptions::new("generate"),
            )
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match err {
            AppError::RetryExhausted { attempts, source, .. } => {
                assert_eq!(attempts, 3);
                assert!(matches!(*source, AppError::UpstreamApi(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
        // 整次执行只记一次失败
        let breaker = executor.breakers().get("generate").unwrap();
        assert_eq!(breaker.snapshot().consecutive_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_attempt_times_out_and_is_retried() {
        let executor = executor(2, 5);
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let result = executor
            .execute_with_retry(
                move || async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        tokio::time::sleep(Duration::from_secs(10)).await;
                    }
                    Ok::<_, UpstreamError>("late")
                },
                ExecuteOptions::new("generate").with_timeout(Duration::from_secs(1)),
            )
            .await
            .unwrap();

        assert_eq!(result, "late");
        let metrics = executor.metrics();
        assert_eq!(metrics.attempts, 2);
        assert_eq!(metrics.timed_out_attempts, 1);
        assert!((metrics.timeout_rate - 0.5).abs() < 1e-9);
        assert_eq!(metrics.error_rate, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_fails_fast_without_calling() {
        let executor = executor(1, 2);
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let op = move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(UpstreamError::tagged(ErrorKind::UpstreamApi, "500"))
        };

        for _ in 0..2 {
            let _ = executor
                .execute_with_retry(op, ExecuteOptions::new("generate"))
                .await;
        }
        let err = executor
            .execute_with_retry(op, ExecuteOptions::new("generate"))
            .await
            .unwrap_err();

        assert!(err.is_circuit_open());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let metrics = executor.metrics();
        assert_eq!(metrics.circuit_rejections, 1);
        assert_eq!(metrics.attempts, 2);
        assert_eq!(metrics.failed_calls, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_records_no_breaker_outcome() {
        let executor = executor(3, 1);
        let token = CancellationToken::new();
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let child = token.clone();
        let cancel_later = async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            child.cancel();
        };
        let run = executor.execute_with_retry(
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(2)).await;
                Ok::<_, UpstreamError>(())
            },
            ExecuteOptions::new("generate")
                .with_request_id("req-cancel")
                .with_cancel(token),
        );
        let (result, _) = tokio::join!(run, cancel_later);

        assert!(matches!(result, Err(AppError::Cancelled(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let breaker = executor.breakers().get("generate").unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().consecutive_failures, 0);

        let context = executor.context(&RequestId::from("req-cancel")).unwrap();
        assert_eq!(context.last_attempt().unwrap().outcome, AttemptOutcome::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_during_backoff_stops_retrying() {
        let executor = executor(3, 5);
        let token = CancellationToken::new();
        let child = token.clone();

        let result = executor
            .execute_with_retry(
                move || {
                    let child = child.clone();
                    async move {
                        child.cancel();
                        Err::<(), _>(UpstreamError::tagged(ErrorKind::Network, "reset"))
                    }
                },
                ExecuteOptions::new("generate").with_cancel(token),
            )
            .await;

        assert!(matches!(result, Err(AppError::Cancelled(_))));
        assert_eq!(executor.metrics().attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_contexts() {
        let executor = executor(1, 5);
        executor
            .execute_with_retry(
                move || async move { Ok::<_, UpstreamError>(()) },
                ExecuteOptions::new("generate").with_request_id("req-old"),
            )
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(120)).await;
        assert_eq!(executor.purge_contexts(Duration::from_secs(60)), 1);
        assert!(executor.context(&RequestId::from("req-old")).is_none());
    }

    #[test]
    fn test_validation_never_retryable() {
        let mut policy = RetryPolicy::default();
        policy.retryable.insert(ErrorKind::Validation);
        assert!(!policy.is_retryable(ErrorKind::Validation));
        assert!(policy.is_retryable(ErrorKind::RateLimit));
        assert!(!policy.is_retryable(ErrorKind::Unknown));
    }
}
