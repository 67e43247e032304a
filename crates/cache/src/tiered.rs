//! 多层缓存编排
//!
//! 读取：L1 → L2 → L3 逐层探测，命中后回填上层。
//! 写入：同时写入所有已配置的层，L1 失败则整个写入失败，L2/L3 尽力而为。
//! 删除 / 清空：扇出到每一层，防止下层的旧值被重新提升。
//!
//! 任何 L2/L3 的存储错误都只记录日志并降级为该层未命中，不会传给调用方。

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use errors::{AppError, AppResult};
use ports::{CacheTierPort, TierHit};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::memory::MemoryTier;
use crate::stats::StatsManager;

/// 缓存层
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheTier {
    L1,
    L2,
    L3,
}

impl CacheTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::L1 => "l1",
            Self::L2 => "l2",
            Self::L3 => "l3",
        }
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            Self::L1 => 0,
            Self::L2 => 1,
            Self::L3 => 2,
        }
    }
}

impl fmt::Display for CacheTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 层状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TierStatus {
    pub tier: CacheTier,
    pub backend: String,
    pub available: bool,
    pub ttl_ms: u64,
}

/// 进程外缓存层及其 TTL 上限
struct RemoteTier {
    tier: CacheTier,
    port: Arc<dyn CacheTierPort>,
    ttl: Duration,
}

impl RemoteTier {
    async fn probe(&self, key: &str) -> Option<TierHit> {
        if !self.port.is_available() {
            debug!(key = %key, tier = %self.tier, "Cache tier unavailable, skipping probe");
            return None;
        }
        match self.port.get(key).await {
            Ok(hit) => {
                telemetry::recorder::record_cache_lookup(self.tier.as_str(), hit.is_some());
                hit
            }
            Err(e) => {
                warn!(key = %key, tier = %self.tier, error = %e, "Cache tier get error, treating as miss");
                None
            }
        }
    }

    async fn write(&self, key: &str, value: &str, ttl: Duration) -> bool {
        if !self.port.is_available() {
            debug!(key = %key, tier = %self.tier, "Cache tier unavailable, skipping write");
            return false;
        }
        let ttl = ttl.min(self.ttl);
        let result = self.port.set(key, value, ttl).await;
        telemetry::recorder::record_cache_write(self.tier.as_str(), result.is_ok());
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(key = %key, tier = %self.tier, error = %e, "Cache tier set error");
                false
            }
        }
    }

    /// 删除不检查可用性，尽量避免旧值残留
    async fn delete(&self, key: &str) {
        if let Err(e) = self.port.delete(key).await {
            warn!(key = %key, tier = %self.tier, error = %e, "Cache tier delete error, stale entry may remain");
        }
    }

    async fn clear(&self) {
        if let Err(e) = self.port.clear().await {
            warn!(tier = %self.tier, error = %e, "Cache tier clear error");
        }
    }

    fn status(&self) -> TierStatus {
        TierStatus {
            tier: self.tier,
            backend: self.port.name().to_string(),
            available: self.port.is_available(),
            ttl_ms: self.ttl.as_millis() as u64,
        }
    }
}

async fn write_optional(tier: Option<&RemoteTier>, key: &str, value: &str, ttl: Duration) -> bool {
    match tier {
        Some(tier) => tier.write(key, value, ttl).await,
        None => false,
    }
}

async fn delete_optional(tier: Option<&RemoteTier>, key: &str) {
    if let Some(tier) = tier {
        tier.delete(key).await;
    }
}

async fn clear_optional(tier: Option<&RemoteTier>) {
    if let Some(tier) = tier {
        tier.clear().await;
    }
}

/// 回填 TTL：不超过下层剩余存活时间，也不超过本层上限
fn backfill_ttl(hit: &TierHit, tier_ttl: Duration) -> Duration {
    hit.remaining_ttl.map_or(tier_ttl, |remaining| remaining.min(tier_ttl))
}

/// 三级缓存编排器
///
/// 自身不持有数据，全部委托给各层
pub struct TieredCache {
    l1: Arc<MemoryTier>,
    l2: Option<RemoteTier>,
    l3: Option<RemoteTier>,
    stats: Arc<StatsManager>,
}

impl TieredCache {
    pub fn new(l1: Arc<MemoryTier>, stats: Arc<StatsManager>) -> Self {
        Self {
            l1,
            l2: None,
            l3: None,
            stats,
        }
    }

    /// 配置 L2 共享快速存储
    pub fn with_l2(mut self, port: Arc<dyn CacheTierPort>, ttl: Duration) -> Self {
        self.l2 = Some(RemoteTier {
            tier: CacheTier::L2,
            port,
            ttl,
        });
        self
    }

    /// 配置 L3 持久存储
    pub fn with_l3(mut self, port: Arc<dyn CacheTierPort>, ttl: Duration) -> Self {
        self.l3 = Some(RemoteTier {
            tier: CacheTier::L3,
            port,
            ttl,
        });
        self
    }

    pub fn memory(&self) -> &Arc<MemoryTier> {
        &self.l1
    }

    pub fn stats(&self) -> &Arc<StatsManager> {
        &self.stats
    }

    /// 获取缓存值，最多探测三层
    pub async fn get(&self, key: &str) -> Option<String> {
        let start = Instant::now();

        if let Some(value) = self.l1.get(key) {
            debug!(key = %key, "Cache hit in L1");
            telemetry::recorder::record_cache_lookup(CacheTier::L1.as_str(), true);
            self.stats.record_hit(CacheTier::L1, start.elapsed());
            return Some(value);
        }
        telemetry::recorder::record_cache_lookup(CacheTier::L1.as_str(), false);

        if let Some(l2) = &self.l2 {
            if let Some(hit) = l2.probe(key).await {
                debug!(key = %key, "Cache hit in L2");
                self.backfill_l1(key, &hit);
                self.stats.record_hit(CacheTier::L2, start.elapsed());
                return Some(hit.value);
            }
        }

        if let Some(l3) = &self.l3 {
            if let Some(hit) = l3.probe(key).await {
                debug!(key = %key, "Cache hit in L3");
                self.backfill_l1(key, &hit);
                if let Some(l2) = &self.l2 {
                    let ttl = backfill_ttl(&hit, l2.ttl);
                    if !ttl.is_zero() {
                        l2.write(key, &hit.value, ttl).await;
                    }
                }
                self.stats.record_hit(CacheTier::L3, start.elapsed());
                return Some(hit.value);
            }
        }

        debug!(key = %key, "Cache miss");
        self.stats.record_miss(start.elapsed());
        None
    }

    fn backfill_l1(&self, key: &str, hit: &TierHit) {
        let ttl = backfill_ttl(hit, self.l1.ttl());
        if ttl.is_zero() {
            return;
        }
        if let Err(e) = self.l1.set(key, hit.value.as_str(), ttl) {
            warn!(key = %key, error = %e, "L1 backfill failed");
        }
    }

    /// 获取并反序列化，无法解析的值按未命中处理
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.get(key).await?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key = %key, error = %e, "Cached value could not be decoded, treating as miss");
                None
            }
        }
    }

    /// 写入所有已配置的层
    ///
    /// `ttl` 为 None 时各层使用自身配置的 TTL，否则取 `min(ttl, 层 TTL)`
    pub async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> AppResult<()> {
        if ttl.is_some_and(|ttl| ttl.is_zero()) {
            return Err(AppError::invalid_argument("ttl must be greater than zero"));
        }
        let start = Instant::now();
        let requested = ttl.unwrap_or(Duration::MAX);

        let l1_write = async {
            let result = self.l1.set(key, value, requested.min(self.l1.ttl()));
            telemetry::recorder::record_cache_write(CacheTier::L1.as_str(), result.is_ok());
            result
        };
        let (l1_result, l2_written, l3_written) = tokio::join!(
            l1_write,
            write_optional(self.l2.as_ref(), key, value, requested),
            write_optional(self.l3.as_ref(), key, value, requested),
        );

        self.stats.record_write(start.elapsed());
        debug!(key = %key, l2_written, l3_written, "Cache set");
        l1_result
    }

    /// 序列化后写入
    pub async fn set_json<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> AppResult<()> {
        let raw = serde_json::to_string(value)?;
        self.set(key, &raw, ttl).await
    }

    /// 从所有层删除
    pub async fn delete(&self, key: &str) -> AppResult<()> {
        let start = Instant::now();
        self.l1.delete(key);
        tokio::join!(
            delete_optional(self.l2.as_ref(), key),
            delete_optional(self.l3.as_ref(), key),
        );
        self.stats.record_delete(start.elapsed());
        Ok(())
    }

    /// 清空所有层
    pub async fn clear(&self) -> AppResult<()> {
        self.l1.clear();
        tokio::join!(
            clear_optional(self.l2.as_ref()),
            clear_optional(self.l3.as_ref()),
        );
        debug!("All cache tiers cleared");
        Ok(())
    }

    /// 各层状态
    pub fn tier_status(&self) -> Vec<TierStatus> {
        let mut status = vec![TierStatus {
            tier: CacheTier::L1,
            backend: "memory".to_string(),
            available: true,
            ttl_ms: self.l1.ttl().as_millis() as u64,
        }];
        status.extend(self.l2.iter().chain(self.l3.iter()).map(RemoteTier::status));
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::TierConfig;
    use crate::stats::StatsConfig;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// 内存版的进程外存储，记录调用次数
    #[derive(Default)]
    struct MockTier {
        data: Mutex<HashMap<String, (String, Duration)>>,
        gets: AtomicUsize,
        should_fail: AtomicBool,
        unavailable: AtomicBool,
    }

    impl MockTier {
        fn failing() -> Self {
            let tier = Self::default();
            tier.should_fail.store(true, Ordering::SeqCst);
            tier
        }

        fn stored_ttl(&self, key: &str) -> Option<Duration> {
            self.data.lock().get(key).map(|(_, ttl)| *ttl)
        }

        fn insert(&self, key: &str, value: &str, ttl: Duration) {
            self.data
                .lock()
                .insert(key.to_string(), (value.to_string(), ttl));
        }
    }

    #[async_trait]
    impl CacheTierPort for MockTier {
        fn name(&self) -> &'static str {
            "mock"
        }

        fn is_available(&self) -> bool {
            !self.unavailable.load(Ordering::SeqCst)
        }

        async fn get(&self, key: &str) -> AppResult<Option<TierHit>> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            if self.should_fail.load(Ordering::SeqCst) {
                return Err(AppError::internal("mock tier error"));
            }
            Ok(self
                .data
                .lock()
                .get(key)
                .map(|(value, ttl)| TierHit::new(value.clone(), Some(*ttl))))
        }

        async fn set(&self, key: &str, value: &str, ttl: Duration) -> AppResult<()> {
            if self.should_fail.load(Ordering::SeqCst) {
                return Err(AppError::internal("mock tier error"));
            }
            self.insert(key, value, ttl);
            Ok(())
        }

        async fn delete(&self, key: &str) -> AppResult<()> {
            self.data.lock().remove(key);
            Ok(())
        }

        async fn clear(&self) -> AppResult<()> {
            self.data.lock().clear();
            Ok(())
        }
    }

    fn cache_with(
        l2: Option<Arc<MockTier>>,
        l3: Option<Arc<MockTier>>,
    ) -> TieredCache {
        let l1 = Arc::new(MemoryTier::new(TierConfig::new(100, Duration::from_secs(60))));
        let stats = Arc::new(StatsManager::new(StatsConfig::default(), l1.clone()));
        let mut cache = TieredCache::new(l1, stats);
        if let Some(l2) = l2 {
            cache = cache.with_l2(l2, Duration::from_secs(600));
        }
        if let Some(l3) = l3 {
            cache = cache.with_l3(l3, Duration::from_secs(3600));
        }
        cache
    }

    #[tokio::test(start_paused = true)]
    async fn test_l3_hit_is_promoted_to_l1_and_l2() {
        let l2 = Arc::new(MockTier::default());
        let l3 = Arc::new(MockTier::default());
        l3.insert("key", "durable", Duration::from_secs(30));
        let cache = cache_with(Some(l2.clone()), Some(l3.clone()));

        assert_eq!(cache.get("key").await, Some("durable".to_string()));
        assert_eq!(cache.memory().get("key"), Some("durable".to_string()));
        // 回填不超过下层剩余 TTL
        assert_eq!(l2.stored_ttl("key"), Some(Duration::from_secs(30)));

        // 第二次读取直接命中 L1
        assert_eq!(cache.get("key").await, Some("durable".to_string()));
        assert_eq!(l2.gets.load(Ordering::SeqCst), 1);
        assert_eq!(l3.gets.load(Ordering::SeqCst), 1);

        let snapshot = cache.stats().snapshot();
        assert_eq!((snapshot.l1_hits, snapshot.l3_hits), (1, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_l2_hit_backfills_l1_only() {
        let l2 = Arc::new(MockTier::default());
        let l3 = Arc::new(MockTier::default());
        l2.insert("key", "shared", Duration::from_secs(120));
        let cache = cache_with(Some(l2), Some(l3.clone()));

        assert_eq!(cache.get("key").await, Some("shared".to_string()));
        assert_eq!(l3.gets.load(Ordering::SeqCst), 0);
        let entry = cache.memory().get_entry("key").unwrap();
        assert_eq!(entry.expires_at - entry.created_at, Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_tier_degrades_to_miss() {
        let l2 = Arc::new(MockTier::failing());
        let l3 = Arc::new(MockTier::default());
        l3.insert("key", "durable", Duration::from_secs(30));
        let cache = cache_with(Some(l2.clone()), Some(l3));

        assert_eq!(cache.get("key").await, Some("durable".to_string()));
        assert_eq!(cache.get("other").await, None);
        assert_eq!(l2.gets.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_tier_is_skipped() {
        let l2 = Arc::new(MockTier::default());
        l2.insert("key", "shared", Duration::from_secs(30));
        l2.unavailable.store(true, Ordering::SeqCst);
        let cache = cache_with(Some(l2.clone()), None);

        assert_eq!(cache.get("key").await, None);
        assert_eq!(l2.gets.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_fans_out_with_effective_ttl() {
        let l2 = Arc::new(MockTier::default());
        let l3 = Arc::new(MockTier::default());
        let cache = cache_with(Some(l2.clone()), Some(l3.clone()));

        cache.set("key", "value", None).await.unwrap();
        assert_eq!(l2.stored_ttl("key"), Some(Duration::from_secs(600)));
        assert_eq!(l3.stored_ttl("key"), Some(Duration::from_secs(3600)));

        cache
            .set("short", "value", Some(Duration::from_secs(90)))
            .await
            .unwrap();
        assert_eq!(l2.stored_ttl("short"), Some(Duration::from_secs(90)));
        let entry = cache.memory().get_entry("short").unwrap();
        assert_eq!(entry.expires_at - entry.created_at, Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lower_tier_write_failure_does_not_fail_set() {
        let l2 = Arc::new(MockTier::failing());
        let cache = cache_with(Some(l2), None);

        cache.set("key", "value", None).await.unwrap();
        assert_eq!(cache.get("key").await, Some("value".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_ttl_is_rejected() {
        let cache = cache_with(None, None);
        let result = cache.set("key", "value", Some(Duration::ZERO)).await;
        assert!(matches!(result, Err(AppError::InvalidArgument(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_removes_from_every_tier() {
        let l2 = Arc::new(MockTier::default());
        let l3 = Arc::new(MockTier::default());
        let cache = cache_with(Some(l2.clone()), Some(l3.clone()));

        cache.set("key", "value", None).await.unwrap();
        cache.delete("key").await.unwrap();

        assert_eq!(cache.get("key").await, None);
        assert!(l2.stored_ttl("key").is_none());
        assert!(l3.stored_ttl("key").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_empties_every_tier() {
        let l2 = Arc::new(MockTier::default());
        let l3 = Arc::new(MockTier::default());
        let cache = cache_with(Some(l2.clone()), Some(l3.clone()));

        cache.set("a", "1", None).await.unwrap();
        cache.set("b", "2", None).await.unwrap();
        cache.clear().await.unwrap();

        assert!(cache.memory().is_empty());
        assert_eq!(cache.get("a").await, None);
        assert_eq!(cache.get("b").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_boundary_without_timers() {
        let cache = cache_with(None, None);
        cache
            .set("key", "value", Some(Duration::from_secs(10)))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_millis(9_999)).await;
        assert_eq!(cache.get("key").await, Some("value".to_string()));

        tokio::time::advance(Duration::from_millis(2)).await;
        assert_eq!(cache.get("key").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_json_helpers() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Recommendation {
            title: String,
            score: u32,
        }

        let cache = cache_with(None, None);
        let rec = Recommendation {
            title: "Learn tokio".to_string(),
            score: 9,
        };
        cache.set_json("rec", &rec, None).await.unwrap();
        assert_eq!(cache.get_json::<Recommendation>("rec").await, Some(rec));

        cache.set("broken", "not json", None).await.unwrap();
        assert_eq!(cache.get_json::<Recommendation>("broken").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tier_status() {
        let l2 = Arc::new(MockTier::default());
        l2.unavailable.store(true, Ordering::SeqCst);
        let cache = cache_with(Some(l2), None);

        let status = cache.tier_status();
        assert_eq!(status.len(), 2);
        assert_eq!(status[0].tier, CacheTier::L1);
        assert_eq!(status[1].backend, "mock");
        assert!(!status[1].available);
    }
}
