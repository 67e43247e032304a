//! 缓存统计
//!
//! 命中率按增量方式更新，不保存历史数组：
//! `hit_rate_n = hit_rate_{n-1} * (n-1)/n + indicator/n`
//!
//! 过期条目清理在每 N 次访问时顺带执行，不持有任何定时器

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::memory::MemoryTier;
use crate::tiered::CacheTier;

/// 统计配置
#[derive(Debug, Clone, PartialEq)]
pub struct StatsConfig {
    /// 每隔多少次访问执行一次过期清理，0 表示不自动清理
    pub cleanup_every: u64,
    /// 内存占用上限（字节），超过即视为不健康
    pub memory_ceiling_bytes: usize,
    /// 判断命中率前所需的最少请求数
    pub min_requests_for_hit_rate: u64,
    /// 命中率不高于该值视为不健康
    pub min_hit_rate: f64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            cleanup_every: 100,
            memory_ceiling_bytes: 64 * 1024 * 1024,
            min_requests_for_hit_rate: 10,
            min_hit_rate: 0.30,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: u64,
    misses: u64,
    total_requests: u64,
    tier_hits: [u64; 3],
    hit_rate: f64,
    avg_lookup_ms: f64,
    writes: u64,
    deletes: u64,
    accesses_since_cleanup: u64,
}

/// 统计快照（字段名对外稳定）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatsSnapshot {
    pub hit_rate: f64,
    pub miss_rate: f64,
    pub total_requests: u64,
    pub cache_size: usize,
    pub evictions: u64,
    pub memory_usage_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub l1_hits: u64,
    pub l2_hits: u64,
    pub l3_hits: u64,
    pub writes: u64,
    pub deletes: u64,
    pub avg_lookup_ms: f64,
}

/// 统计管理器
#[derive(Debug)]
pub struct StatsManager {
    config: StatsConfig,
    l1: Arc<MemoryTier>,
    counters: Mutex<Counters>,
}

impl StatsManager {
    pub fn new(config: StatsConfig, l1: Arc<MemoryTier>) -> Self {
        Self {
            config,
            l1,
            counters: Mutex::new(Counters::default()),
        }
    }

    /// 记录命中
    pub fn record_hit(&self, tier: CacheTier, latency: Duration) {
        self.record_lookup(Some(tier), latency);
    }

    /// 记录未命中
    pub fn record_miss(&self, latency: Duration) {
        self.record_lookup(None, latency);
    }

    fn record_lookup(&self, tier: Option<CacheTier>, latency: Duration) {
        let cleanup_due = {
            let mut c = self.counters.lock();
            c.total_requests += 1;
            let n = c.total_requests as f64;
            let indicator = if tier.is_some() { 1.0 } else { 0.0 };
            c.hit_rate = c.hit_rate * (n - 1.0) / n + indicator / n;

            let latency_ms = latency.as_secs_f64() * 1000.0;
            c.avg_lookup_ms = c.avg_lookup_ms * (n - 1.0) / n + latency_ms / n;

            match tier {
                Some(tier) => {
                    c.hits += 1;
                    c.tier_hits[tier.index()] += 1;
                }
                None => c.misses += 1,
            }
            Self::tick_cleanup(&mut c, self.config.cleanup_every)
        };
        telemetry::recorder::record_cache_latency("get", latency.as_secs_f64() * 1000.0);
        if cleanup_due {
            self.perform_cleanup();
        }
    }

    /// 记录写入
    pub fn record_write(&self, latency: Duration) {
        let cleanup_due = {
            let mut c = self.counters.lock();
            c.writes += 1;
            Self::tick_cleanup(&mut c, self.config.cleanup_every)
        };
        telemetry::recorder::record_cache_latency("set", latency.as_secs_f64() * 1000.0);
        if cleanup_due {
            self.perform_cleanup();
        }
    }

    /// 记录删除
    pub fn record_delete(&self, latency: Duration) {
        let cleanup_due = {
            let mut c = self.counters.lock();
            c.deletes += 1;
            Self::tick_cleanup(&mut c, self.config.cleanup_every)
        };
        telemetry::recorder::record_cache_latency("delete", latency.as_secs_f64() * 1000.0);
        if cleanup_due {
            self.perform_cleanup();
        }
    }

    fn tick_cleanup(c: &mut Counters, every: u64) -> bool {
        if every == 0 {
            return false;
        }
        c.accesses_since_cleanup += 1;
        if c.accesses_since_cleanup >= every {
            c.accesses_since_cleanup = 0;
            true
        } else {
            false
        }
    }

    /// 清理 L1 中的过期条目
    pub fn perform_cleanup(&self) -> usize {
        let removed = self.l1.purge_expired();
        if removed > 0 {
            debug!(removed, "Expired L1 entries cleaned up");
        }
        removed
    }

    pub fn hit_rate(&self) -> f64 {
        self.counters.lock().hit_rate
    }

    pub fn total_requests(&self) -> u64 {
        self.counters.lock().total_requests
    }

    /// 健康状态（仅供参考）
    ///
    /// 内存超过上限，或请求数达到阈值后命中率不高于下限时为 false
    pub fn is_healthy(&self) -> bool {
        if self.l1.memory_usage_bytes() > self.config.memory_ceiling_bytes {
            return false;
        }
        let c = self.counters.lock();
        !(c.total_requests >= self.config.min_requests_for_hit_rate
            && c.hit_rate <= self.config.min_hit_rate)
    }

    /// 获取统计快照
    pub fn snapshot(&self) -> CacheStatsSnapshot {
        let c = self.counters.lock();
        let miss_rate = if c.total_requests == 0 {
            0.0
        } else {
            1.0 - c.hit_rate
        };
        CacheStatsSnapshot {
            hit_rate: c.hit_rate,
            miss_rate,
            total_requests: c.total_requests,
            cache_size: self.l1.len(),
            evictions: self.l1.evictions(),
            memory_usage_bytes: self.l1.memory_usage_bytes(),
            hits: c.hits,
            misses: c.misses,
            l1_hits: c.tier_hits[0],
            l2_hits: c.tier_hits[1],
            l3_hits: c.tier_hits[2],
            writes: c.writes,
            deletes: c.deletes,
            avg_lookup_ms: c.avg_lookup_ms,
        }
    }

    /// 重置所有计数（包括 L1 淘汰计数）
    pub fn reset(&self) {
        *self.counters.lock() = Counters::default();
        self.l1.reset_evictions();
    }
}
