//! 可靠性层
//!
//! 显式构造的服务集合，不使用全局单例。
//! 每个实例拥有自己的 L1、统计、断路器和重试上下文，`dispose` 后释放。

use std::sync::Arc;

use cache::{
    CacheKeyManager, CacheStatsSnapshot, MemoryTier, StatsConfig, StatsManager, TierConfig,
    TierStatus, TieredCache,
};
use common::RetryConfig;
use config::AppConfig;
use ports::CacheTierPort;
use resilience::{
    BreakerConfig, BreakerSnapshot, CircuitBreakerRegistry, ExecutorMetricsSnapshot,
    RetryExecutor, RetryPolicy,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::infrastructure::Infrastructure;

/// 面向看板的性能指标（字段名稳定）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceMetrics {
    pub cache_hit_rate: f64,
    pub error_rate: f64,
    pub timeout_rate: f64,
}

/// 完整状态报告
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerReport {
    pub healthy: bool,
    pub stats: CacheStatsSnapshot,
    pub performance: PerformanceMetrics,
    pub executor: ExecutorMetricsSnapshot,
    pub tiers: Vec<TierStatus>,
    pub breakers: Vec<BreakerSnapshot>,
}

pub struct ReliabilityLayer {
    keys: CacheKeyManager,
    cache: Arc<TieredCache>,
    executor: Arc<RetryExecutor>,
}

impl ReliabilityLayer {
    /// 按配置连接外部缓存层并组装
    pub async fn build(config: &AppConfig) -> Self {
        let infra = Infrastructure::from_config(config).await;
        Self::with_tiers(config, infra.l2(), infra.l3())
    }

    /// 使用给定的 L2 / L3 组装
    pub fn with_tiers(
        config: &AppConfig,
        l2: Option<Arc<dyn CacheTierPort>>,
        l3: Option<Arc<dyn CacheTierPort>>,
    ) -> Self {
        let cache_config = &config.cache;
        let tier1 = TierConfig::new(cache_config.tier1.capacity, cache_config.tier1.ttl())
            .with_capacity_unit(cache_config.tier1.capacity_unit)
            .with_eviction_policy(cache_config.tier1.eviction_policy);
        let l1 = Arc::new(MemoryTier::new(tier1));

        let stats = Arc::new(StatsManager::new(
            StatsConfig {
                cleanup_every: cache_config.cleanup_every,
                memory_ceiling_bytes: cache_config.memory_ceiling_bytes,
                min_requests_for_hit_rate: cache_config.min_requests_for_hit_rate,
                min_hit_rate: cache_config.min_hit_rate,
            },
            l1.clone(),
        ));

        let mut cache = TieredCache::new(l1, stats);
        if let Some(l2) = l2 {
            cache = cache.with_l2(l2, cache_config.tier2_ttl());
        }
        if let Some(l3) = l3 {
            cache = cache.with_l3(l3, cache_config.tier3_ttl());
        }

        let retry = &config.retry;
        let policy = RetryPolicy {
            backoff: RetryConfig::new(retry.max_attempts, retry.base_delay(), retry.max_delay())
                .with_backoff_factor(retry.backoff_factor)
                .with_jitter(retry.jitter_fraction),
            retryable: retry.retryable_error_kinds.iter().copied().collect(),
            attempt_timeout: retry.attempt_timeout(),
            context_retention: retry.context_retention(),
        };
        let breakers = Arc::new(CircuitBreakerRegistry::new(BreakerConfig {
            failure_threshold: config.breaker.failure_threshold,
            open_duration: config.breaker.open_duration(),
        }));

        let layer = Self {
            keys: CacheKeyManager::new(cache_config.namespace.clone(), cache_config.schema_version),
            cache: Arc::new(cache),
            executor: Arc::new(RetryExecutor::new(policy, breakers)),
        };
        let tiers: Vec<&str> = layer.tier_status().iter().map(|t| t.tier.as_str()).collect();
        info!(tiers = ?tiers, "Reliability layer assembled");
        layer
    }

    pub fn keys(&self) -> &CacheKeyManager {
        &self.keys
    }

    pub fn cache(&self) -> &Arc<TieredCache> {
        &self.cache
    }

    pub fn executor(&self) -> &Arc<RetryExecutor> {
        &self.executor
    }

    /// 缓存统计
    pub fn stats(&self) -> CacheStatsSnapshot {
        self.cache.stats().snapshot()
    }

    /// 性能指标
    pub fn performance_metrics(&self) -> PerformanceMetrics {
        let executor = self.executor.metrics();
        PerformanceMetrics {
            cache_hit_rate: self.cache.stats().hit_rate(),
            error_rate: executor.error_rate,
            timeout_rate: executor.timeout_rate,
        }
    }

    pub fn tier_status(&self) -> Vec<TierStatus> {
        self.cache.tier_status()
    }

    pub fn breaker_snapshots(&self) -> Vec<BreakerSnapshot> {
        self.executor.breakers().snapshots()
    }

    /// 健康状态（仅供参考）
    pub fn is_healthy(&self) -> bool {
        self.cache.stats().is_healthy()
    }

    pub fn report(&self) -> LayerReport {
        LayerReport {
            healthy: self.is_healthy(),
            stats: self.stats(),
            performance: self.performance_metrics(),
            executor: self.executor.metrics(),
            tiers: self.tier_status(),
            breakers: self.breaker_snapshots(),
        }
    }

    /// 释放进程内状态，共享的 L2 / L3 数据保持不变
    pub fn dispose(&self) {
        self.cache.memory().clear();
        self.cache.stats().reset();
        self.executor.dispose();
        info!("Reliability layer disposed");
    }
}
