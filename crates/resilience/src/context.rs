//! 重试上下文
//!
//! 按请求 ID 记录每次尝试，只通过显式的按龄清理回收

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::RequestId;
use errors::ErrorKind;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

/// 单次尝试结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Failure,
    Timeout,
    Cancelled,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        }
    }
}

/// 单次尝试记录
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryAttempt {
    pub attempt_number: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub outcome: AttemptOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// 下一次尝试前的等待时间，没有下一次时为 None
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_delay_ms: Option<u64>,
}

/// 一次逻辑请求的全部尝试
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryContext {
    pub request_id: RequestId,
    pub operation: String,
    pub created_at: DateTime<Utc>,
    pub attempts: Vec<RetryAttempt>,
    #[serde(skip)]
    touched_at: Instant,
}

impl RetryContext {
    fn new(request_id: RequestId, operation: &str) -> Self {
        Self {
            request_id,
            operation: operation.to_string(),
            created_at: Utc::now(),
            attempts: Vec::new(),
            touched_at: Instant::now(),
        }
    }

    pub fn last_attempt(&self) -> Option<&RetryAttempt> {
        self.attempts.last()
    }
}

/// 重试上下文存储
#[derive(Debug, Default)]
pub struct RetryContextStore {
    contexts: Mutex<HashMap<RequestId, RetryContext>>,
}

impl RetryContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 开始一次新的执行，同一请求 ID 的旧记录被替换
    pub fn begin(&self, request_id: &RequestId, operation: &str) {
        self.contexts
            .lock()
            .insert(request_id.clone(), RetryContext::new(request_id.clone(), operation));
    }

    /// 追加一次尝试记录
    pub fn record(&self, request_id: &RequestId, attempt: RetryAttempt) {
        let mut contexts = self.contexts.lock();
        if let Some(context) = contexts.get_mut(request_id) {
            context.attempts.push(attempt);
            context.touched_at = Instant::now();
        }
    }

    pub fn get(&self, request_id: &RequestId) -> Option<RetryContext> {
        self.contexts.lock().get(request_id).cloned()
    }

    /// 移除超过 `max_age` 未更新的上下文，返回移除数量
    pub fn purge_older_than(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let mut contexts = self.contexts.lock();
        let before = contexts.len();
        contexts.retain(|_, context| now.saturating_duration_since(context.touched_at) < max_age);
        before - contexts.len()
    }

    pub fn len(&self) -> usize {
        self.contexts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.lock().is_empty()
    }

    pub fn clear(&self) {
        self.contexts.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attempt(n: u32, outcome: AttemptOutcome) -> RetryAttempt {
        let now = Utc::now();
        RetryAttempt {
            attempt_number: n,
            started_at: now,
            ended_at: now,
            duration_ms: 0,
            outcome,
            error_kind: None,
            error: None,
            next_delay_ms: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_are_ordered() {
        let store = RetryContextStore::new();
        let id = RequestId::from("req-1");
        store.begin(&id, "generate");
        store.record(&id, attempt(1, AttemptOutcome::Failure));
        store.record(&id, attempt(2, AttemptOutcome::Success));

        let context = store.get(&id).unwrap();
        let numbers: Vec<_> = context.attempts.iter().map(|a| a.attempt_number).collect();
        assert_eq!(numbers, vec![1, 2]);
        assert_eq!(context.last_attempt().unwrap().outcome, AttemptOutcome::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_without_begin_is_ignored() {
        let store = RetryContextStore::new();
        store.record(&RequestId::from("ghost"), attempt(1, AttemptOutcome::Failure));
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_by_age() {
        let store = RetryContextStore::new();
        let old = RequestId::from("old");
        let fresh = RequestId::from("fresh");
        store.begin(&old, "generate");
        tokio::time::advance(Duration::from_secs(30)).await;
        store.begin(&fresh, "generate");
        tokio::time::advance(Duration::from_secs(31)).await;

        assert_eq!(store.purge_older_than(Duration::from_secs(60)), 1);
        assert!(store.get(&old).is_none());
        assert!(store.get(&fresh).is_some());
    }
}
