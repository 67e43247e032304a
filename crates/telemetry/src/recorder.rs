//! Metrics 记录器
//!
//! 未安装 recorder 时这些调用都是空操作

use metrics::{counter, gauge, histogram};

/// 记录一次缓存层查询
pub fn record_cache_lookup(tier: &'static str, hit: bool) {
    counter!("tiergate_cache_lookups_total", "tier" => tier, "hit" => hit.to_string()).increment(1);
}

/// 记录一次缓存层写入
pub fn record_cache_write(tier: &'static str, success: bool) {
    counter!(
        "tiergate_cache_writes_total",
        "tier" => tier,
        "success" => success.to_string()
    )
    .increment(1);
}

/// 记录缓存请求耗时
pub fn record_cache_latency(operation: &'static str, duration_ms: f64) {
    histogram!("tiergate_cache_duration_ms", "operation" => operation).record(duration_ms);
}

/// 记录 L1 淘汰
pub fn record_eviction(policy: String) {
    counter!("tiergate_cache_evictions_total", "policy" => policy).increment(1);
}

/// 记录一次上游调用尝试
pub fn record_upstream_attempt(operation: &str, outcome: &'static str, duration_ms: f64) {
    let labels = [
        ("operation", operation.to_string()),
        ("outcome", outcome.to_string()),
    ];

    counter!("tiergate_upstream_attempts_total", &labels).increment(1);
    histogram!("tiergate_upstream_attempt_duration_ms", &labels).record(duration_ms);
}

/// 记录熔断拒绝
pub fn record_circuit_rejection(operation: &str) {
    counter!("tiergate_circuit_rejections_total", "operation" => operation.to_string())
        .increment(1);
}

/// 记录熔断器状态（0 = closed, 1 = open, 2 = half_open）
pub fn record_circuit_state(operation: &str, state: u8) {
    gauge!("tiergate_circuit_state", "operation" => operation.to_string()).set(f64::from(state));
}
