//! L1 进程内缓存
//!
//! 有界的内存键值存储：
//! - TTL 在访问时惰性检查，没有后台定时器
//! - 容量满时按淘汰策略移除条目并计数
//! - 容量可以按条目数或字节数计量

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use common::{CapacityUnit, EvictionPolicy};
use errors::{AppError, AppResult};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::eviction::{AccessStats, EvictionIndex, Rank};

/// 超长 TTL 的上限，避免 Instant 溢出
const MAX_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

/// 缓存条目，只会被整体替换，不会原地修改
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<V> {
    pub key: String,
    pub value: V,
    pub created_at: Instant,
    pub expires_at: Instant,
}

impl<V> CacheEntry<V> {
    pub fn new(key: impl Into<String>, value: V, ttl: Duration) -> Self {
        let created_at = Instant::now();
        Self {
            key: key.into(),
            value,
            created_at,
            expires_at: created_at
                .checked_add(ttl)
                .unwrap_or_else(|| created_at + MAX_TTL),
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    pub fn remaining_ttl(&self, now: Instant) -> Duration {
        self.expires_at.saturating_duration_since(now)
    }
}

/// 单层缓存配置
#[derive(Debug, Clone, PartialEq)]
pub struct TierConfig {
    /// 容量（条目数或字节数，取决于 `capacity_unit`）
    pub capacity: usize,
    pub capacity_unit: CapacityUnit,
    /// 本层最长存活时间
    pub ttl: Duration,
    pub eviction_policy: EvictionPolicy,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            capacity_unit: CapacityUnit::Entries,
            ttl: Duration::from_secs(300),
            eviction_policy: EvictionPolicy::Lru,
        }
    }
}

impl TierConfig {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity,
            ttl,
            ..Default::default()
        }
    }

    pub fn with_eviction_policy(mut self, policy: EvictionPolicy) -> Self {
        self.eviction_policy = policy;
        self
    }

    pub fn with_capacity_unit(mut self, unit: CapacityUnit) -> Self {
        self.capacity_unit = unit;
        self
    }
}

#[derive(Debug)]
struct Slot {
    entry: CacheEntry<String>,
    stats: AccessStats,
    size: usize,
}

#[derive(Debug)]
struct Inner {
    slots: HashMap<String, Slot>,
    index: EvictionIndex,
    used_bytes: usize,
    tick: u64,
}

impl Inner {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn remove(&mut self, key: &str) -> Option<Slot> {
        let slot = self.slots.remove(key)?;
        let rank = self.index.rank(&slot.stats);
        self.index.remove(&rank);
        self.used_bytes -= slot.size;
        Some(slot)
    }
}

/// L1 内存缓存
#[derive(Debug)]
pub struct MemoryTier {
    config: TierConfig,
    inner: Mutex<Inner>,
    evictions: AtomicU64,
}

impl MemoryTier {
    pub fn new(mut config: TierConfig) -> Self {
        config.capacity = config.capacity.max(1);
        let index = EvictionIndex::new(config.eviction_policy);
        Self {
            config,
            inner: Mutex::new(Inner {
                slots: HashMap::new(),
                index,
                used_bytes: 0,
                tick: 0,
            }),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &TierConfig {
        &self.config
    }

    pub fn ttl(&self) -> Duration {
        self.config.ttl
    }

    /// 获取缓存值，过期条目在此时被移除
    pub fn get(&self, key: &str) -> Option<String> {
        self.get_entry(key).map(|entry| entry.value)
    }

    /// 获取完整条目
    pub fn get_entry(&self, key: &str) -> Option<CacheEntry<String>> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let expired = inner.slots.get(key)?.entry.is_expired(now);
        if expired {
            inner.remove(key);
            debug!(key = %key, "L1 entry expired");
            return None;
        }

        let tick = inner.next_tick();
        let Inner { slots, index, .. } = &mut *inner;
        let slot = slots.get_mut(key)?;
        let old: Rank = index.rank(&slot.stats);
        slot.stats.last_access_tick = tick;
        slot.stats.hits += 1;
        let new = index.rank(&slot.stats);
        index.reposition(old, new);
        Some(slot.entry.clone())
    }

    /// 写入或覆盖条目，容量不足时按策略淘汰
    pub fn set(&self, key: &str, value: impl Into<String>, ttl: Duration) -> AppResult<()> {
        if ttl.is_zero() {
            return Err(AppError::invalid_argument("ttl must be greater than zero"));
        }
        let value = value.into();
        let size = key.len() + value.len();
        if self.config.capacity_unit == CapacityUnit::Bytes && size > self.config.capacity {
            return Err(AppError::capacity_exceeded(format!(
                "entry of {size} bytes exceeds L1 capacity of {} bytes",
                self.config.capacity
            )));
        }

        let mut evicted = 0u64;
        {
            let mut inner = self.inner.lock();
            inner.remove(key);

            while self.over_capacity(&inner, size) {
                let Some(victim) = inner.index.pop_victim() else {
                    break;
                };
                if let Some(slot) = inner.slots.remove(&victim) {
                    inner.used_bytes -= slot.size;
                }
                evicted += 1;
                debug!(key = %victim, policy = %self.config.eviction_policy, "L1 entry evicted");
            }

            let tick = inner.next_tick();
            let stats = AccessStats::new(tick);
            let rank = inner.index.rank(&stats);
            inner.index.insert(rank, key.to_string());
            inner.used_bytes += size;
            inner.slots.insert(
                key.to_string(),
                Slot {
                    entry: CacheEntry::new(key, value, ttl),
                    stats,
                    size,
                },
            );
        }

        if evicted > 0 {
            self.evictions.fetch_add(evicted, Ordering::Relaxed);
            for _ in 0..evicted {
                telemetry::recorder::record_eviction(self.config.eviction_policy.to_string());
            }
        }
        Ok(())
    }

    fn over_capacity(&self, inner: &Inner, incoming: usize) -> bool {
        match self.config.capacity_unit {
            CapacityUnit::Entries => inner.slots.len() >= self.config.capacity,
            CapacityUnit::Bytes => inner.used_bytes + incoming > self.config.capacity,
        }
    }

    /// 删除条目，返回是否存在
    pub fn delete(&self, key: &str) -> bool {
        self.inner.lock().remove(key).is_some()
    }

    /// 清空所有条目
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.slots.clear();
        inner.index.clear();
        inner.used_bytes = 0;
    }

    /// 移除所有已过期条目，返回移除数量
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let expired: Vec<String> = inner
            .slots
            .iter()
            .filter(|(_, slot)| slot.entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            inner.remove(key);
        }
        expired.len()
    }

    /// 当前条目数（可能包含尚未清理的过期条目）
    pub fn len(&self) -> usize {
        self.inner.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 估算的内存占用（key + value 字节数）
    pub fn memory_usage_bytes(&self) -> usize {
        self.inner.lock().used_bytes
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn reset_evictions(&self) {
        self.evictions.store(0, Ordering::Relaxed);
    }
}
