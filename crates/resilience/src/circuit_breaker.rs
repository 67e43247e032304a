//! 断路器
//!
//! 每个操作名对应一个实例：Closed -> Open -> HalfOpen 状态转换。
//! 状态只在 `on_success` / `on_failure` 中改变，
//! `can_execute` 只做 Open -> HalfOpen 的时间转换。
//! HalfOpen 时只允许一个试探调用，结果出来之前其他调用一律拒绝。
//! 每次状态转换递增 generation，转换前放行的非试探调用的结果被忽略。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use errors::{AppError, AppResult};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// 断路器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    fn as_gauge(&self) -> u8 {
        match self {
            Self::Closed => 0,
            Self::Open => 1,
            Self::HalfOpen => 2,
        }
    }
}

/// 断路器配置
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerConfig {
    /// 连续失败多少次后打开
    pub failure_threshold: u32,
    /// 打开状态持续时间
    pub open_duration: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    reset_deadline: Option<Instant>,
    trial_in_flight: bool,
    generation: u64,
}

/// 断路器状态快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerSnapshot {
    pub operation: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub retry_after_ms: u64,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                reset_deadline: None,
                trial_in_flight: false,
                generation: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        let mut state = self.state.lock();
        self.refresh(&mut state, Instant::now());
        state.state
    }

    /// 当前是否允许调用
    pub fn can_execute(&self) -> bool {
        let mut state = self.state.lock();
        self.refresh(&mut state, Instant::now());
        match state.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => !state.trial_in_flight,
            CircuitState::Open => false,
        }
    }

    /// 申请一次调用许可
    ///
    /// HalfOpen 时许可即试探名额，许可被丢弃而未记录结果时名额释放
    pub fn try_acquire(self: &Arc<Self>) -> AppResult<CallPermit> {
        let now = Instant::now();
        let mut state = self.state.lock();
        self.refresh(&mut state, now);

        let trial = match state.state {
            CircuitState::Closed => false,
            CircuitState::HalfOpen if !state.trial_in_flight => {
                state.trial_in_flight = true;
                debug!(operation = %self.name, "Circuit breaker admitted trial call");
                true
            }
            _ => {
                telemetry::recorder::record_circuit_rejection(&self.name);
                return Err(AppError::CircuitOpen {
                    operation: self.name.clone(),
                    retry_after_ms: Self::retry_after(&state, now).as_millis() as u64,
                });
            }
        };

        Ok(CallPermit {
            breaker: Arc::clone(self),
            trial,
            generation: state.generation,
            settled: false,
        })
    }

    /// 记录成功
    pub fn on_success(&self) {
        let mut state = self.state.lock();
        self.record_success(&mut state);
    }

    /// 记录失败
    pub fn on_failure(&self) {
        let mut state = self.state.lock();
        self.record_failure(&mut state, Instant::now());
    }

    /// 按许可记录结果
    ///
    /// 非试探许可在状态转换后才返回时，其结果属于旧状态，直接忽略
    fn settle(&self, generation: u64, trial: bool, success: bool) {
        let mut state = self.state.lock();
        if !trial && state.generation != generation {
            debug!(
                operation = %self.name,
                state = ?state.state,
                success,
                "Circuit breaker ignored outcome of a call admitted before the last transition"
            );
            return;
        }
        if success {
            self.record_success(&mut state);
        } else {
            self.record_failure(&mut state, Instant::now());
        }
    }

    fn record_success(&self, state: &mut BreakerState) {
        match state.state {
            CircuitState::Closed => {
                state.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                state.consecutive_failures = 0;
                state.reset_deadline = None;
                state.trial_in_flight = false;
                self.transition(state, CircuitState::Closed);
            }
            // 打开前放行的调用迟到的结果，不改变状态
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self, state: &mut BreakerState, now: Instant) {
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        match state.state {
            CircuitState::Closed => {
                if state.consecutive_failures >= self.config.failure_threshold {
                    state.reset_deadline = Some(now + self.config.open_duration);
                    self.transition(state, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                state.reset_deadline = Some(now + self.config.open_duration);
                state.trial_in_flight = false;
                self.transition(state, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    /// 释放未记录结果的试探名额
    fn release_trial(&self) {
        let mut state = self.state.lock();
        if state.state == CircuitState::HalfOpen && state.trial_in_flight {
            state.trial_in_flight = false;
            debug!(operation = %self.name, "Circuit breaker trial released without outcome");
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let now = Instant::now();
        let mut state = self.state.lock();
        self.refresh(&mut state, now);
        BreakerSnapshot {
            operation: self.name.clone(),
            state: state.state,
            consecutive_failures: state.consecutive_failures,
            retry_after_ms: Self::retry_after(&state, now).as_millis() as u64,
        }
    }

    fn refresh(&self, state: &mut BreakerState, now: Instant) {
        if state.state != CircuitState::Open {
            return;
        }
        if state.reset_deadline.is_none_or(|deadline| now >= deadline) {
            state.trial_in_flight = false;
            self.transition(state, CircuitState::HalfOpen);
        }
    }

    fn retry_after(state: &BreakerState, now: Instant) -> Duration {
        match state.state {
            CircuitState::Open => state
                .reset_deadline
                .map_or(Duration::ZERO, |deadline| deadline.saturating_duration_since(now)),
            _ => Duration::ZERO,
        }
    }

    fn transition(&self, state: &mut BreakerState, to: CircuitState) {
        let from = state.state;
        if from == to {
            return;
        }
        state.state = to;
        state.generation = state.generation.wrapping_add(1);
        telemetry::recorder::record_circuit_state(&self.name, to.as_gauge());
        match to {
            CircuitState::Open => warn!(
                operation = %self.name,
                from = ?from,
                consecutive_failures = state.consecutive_failures,
                open_ms = self.config.open_duration.as_millis() as u64,
                "Circuit breaker transitioned to OPEN"
            ),
            _ => info!(operation = %self.name, from = ?from, to = ?to, "Circuit breaker state changed"),
        }
    }
}

/// 调用许可
///
/// 通过 `success` / `failure` 记录结果；直接丢弃则不计入任何结果
#[derive(Debug)]
pub struct CallPermit {
    breaker: Arc<CircuitBreaker>,
    trial: bool,
    generation: u64,
    settled: bool,
}

impl CallPermit {
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.settle(self.generation, self.trial, true);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.settle(self.generation, self.trial, false);
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.release_trial();
        }
    }
}

/// 按操作名管理断路器
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    config: BreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// 获取或创建操作对应的断路器
    pub fn get_or_create(&self, operation: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(operation) {
            return Arc::clone(breaker);
        }
        let mut breakers = self.breakers.write();
        Arc::clone(
            breakers
                .entry(operation.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(operation, self.config.clone()))),
        )
    }

    pub fn get(&self, operation: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().get(operation).cloned()
    }

    /// 所有断路器的快照，按操作名排序
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let mut snapshots: Vec<_> = self
            .breakers
            .read()
            .values()
            .map(|breaker| breaker.snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.operation.cmp(&b.operation));
        snapshots
    }

    pub fn clear(&self) {
        self.breakers.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32) -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(
            "generate",
            BreakerConfig {
                failure_threshold: threshold,
                open_duration: Duration::from_secs(60),
            },
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_consecutive_failures() {
        let cb = breaker(3);
        cb.on_failure();
        cb.on_failure();
        assert!(cb.can_execute());

        cb.on_failure();
        assert!(!cb.can_execute());
        assert_eq!(cb.state(), CircuitState::Open);

        let err = cb.try_acquire().unwrap_err();
        match err {
            AppError::CircuitOpen { retry_after_ms, .. } => assert_eq!(retry_after_ms, 60_000),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_count() {
        let cb = breaker(3);
        cb.on_failure();
        cb.on_failure();
        cb.on_success();
        cb.on_failure();
        cb.on_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_exactly_one_trial() {
        let cb = breaker(1);
        cb.on_failure();
        tokio::time::advance(Duration::from_secs(60)).await;

        assert!(cb.can_execute());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        let permit = cb.try_acquire().unwrap();
        assert!(permit.is_trial());
        assert!(!cb.can_execute());
        assert!(cb.try_acquire().unwrap_err().is_circuit_open());

        permit.success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.try_acquire().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_reopens_with_fresh_deadline() {
        let cb = breaker(1);
        cb.on_failure();
        tokio::time::advance(Duration::from_secs(60)).await;

        let permit = cb.try_acquire().unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;
        permit.failure();

        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.snapshot().retry_after_ms, 60_000);

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(!cb.can_execute());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(cb.can_execute());
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_success_cannot_close_during_trial() {
        let cb = breaker(1);
        let late = cb.try_acquire().unwrap();
        cb.try_acquire().unwrap().failure();
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(60)).await;
        let trial = cb.try_acquire().unwrap();
        assert!(trial.is_trial());

        late.success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(!cb.can_execute());
        assert!(cb.try_acquire().unwrap_err().is_circuit_open());

        trial.success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_failure_cannot_reopen_during_trial() {
        let cb = breaker(1);
        let late = cb.try_acquire().unwrap();
        cb.try_acquire().unwrap().failure();

        tokio::time::advance(Duration::from_secs(60)).await;
        let trial = cb.try_acquire().unwrap();

        late.failure();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.try_acquire().unwrap_err().is_circuit_open());

        trial.success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_outcome_counts_when_no_transition_happened() {
        let cb = breaker(2);
        let first = cb.try_acquire().unwrap();
        let second = cb.try_acquire().unwrap();
        first.failure();
        second.failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_trial_permit_releases_slot() {
        let cb = breaker(1);
        cb.on_failure();
        tokio::time::advance(Duration::from_secs(60)).await;

        let permit = cb.try_acquire().unwrap();
        drop(permit);

        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.can_execute());
        assert_eq!(cb.snapshot().consecutive_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_shares_instance_per_operation() {
        let registry = CircuitBreakerRegistry::new(BreakerConfig {
            failure_threshold: 1,
            open_duration: Duration::from_secs(10),
        });
        registry.get_or_create("generate").on_failure();

        assert!(!registry.get_or_create("generate").can_execute());
        assert!(registry.get_or_create("summarize").can_execute());

        let snapshots = registry.snapshots();
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].operation, "generate");
        assert_eq!(snapshots[0].state, CircuitState::Open);

        let json = serde_json::to_value(&snapshots[0]).unwrap();
        assert_eq!(json["state"], "OPEN");
        assert_eq!(json["consecutiveFailures"], 1);
        assert_eq!(json["retryAfterMs"], 10_000);
    }
}
