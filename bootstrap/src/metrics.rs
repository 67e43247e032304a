//! Metrics 模块
//!
//! Prometheus 导出，以及可靠性层的汇总 gauge

use errors::{AppError, AppResult};
use metrics::gauge;
use metrics_exporter_prometheus::PrometheusHandle;

use crate::layer::ReliabilityLayer;

/// Metrics 记录器
pub struct MetricsRecorder {
    handle: PrometheusHandle,
}

impl MetricsRecorder {
    /// 安装全局 Prometheus recorder，每个进程只能安装一次
    pub fn install() -> AppResult<Self> {
        let handle = telemetry::init_metrics()
            .map_err(|e| AppError::internal(format!("Failed to install Prometheus recorder: {}", e)))?;
        Ok(Self { handle })
    }

    /// 获取 Prometheus 格式的 metrics
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

/// 记录可靠性层汇总指标
pub fn record_layer_gauges(layer: &ReliabilityLayer) {
    let stats = layer.stats();
    gauge!("tiergate_cache_hit_rate").set(stats.hit_rate);
    gauge!("tiergate_cache_size").set(stats.cache_size as f64);
    gauge!("tiergate_cache_memory_bytes").set(stats.memory_usage_bytes as f64);
    gauge!("tiergate_cache_evictions").set(stats.evictions as f64);

    let performance = layer.performance_metrics();
    gauge!("tiergate_upstream_error_rate").set(performance.error_rate);
    gauge!("tiergate_upstream_timeout_rate").set(performance.timeout_rate);
    gauge!("tiergate_healthy").set(if layer.is_healthy() { 1.0 } else { 0.0 });

    for tier in layer.tier_status() {
        let labels = [("tier", tier.tier.as_str().to_string())];
        gauge!("tiergate_tier_available", &labels).set(if tier.available { 1.0 } else { 0.0 });
    }
}
