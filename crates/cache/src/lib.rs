//! tiergate-cache - 三级缓存
//!
//! - L1: 进程内内存缓存（必需，带 TTL 与淘汰策略）
//! - L2: 共享快速存储（可选，例如 Redis）
//! - L3: 持久存储（可选，例如 PostgreSQL）
//!
//! 读取时逐层探测并回填上层，写入和删除同时扇出到所有已配置的层

mod eviction;
pub mod key;
pub mod memory;
pub mod stats;
pub mod tiered;

pub use key::{CacheKeyManager, CacheKeyParams};
pub use memory::{CacheEntry, MemoryTier, TierConfig};
pub use stats::{CacheStatsSnapshot, StatsConfig, StatsManager};
pub use tiered::{CacheTier, TierStatus, TieredCache};
