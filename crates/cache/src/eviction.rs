//! 淘汰顺序索引
//!
//! 每个条目按策略映射为唯一的排序键，最小者为淘汰对象

use std::collections::BTreeMap;

use common::EvictionPolicy;

/// 排序键，第二分量用于打破平局
pub(crate) type Rank = (u64, u64);

/// 条目的访问统计
#[derive(Debug, Clone, Copy)]
pub(crate) struct AccessStats {
    pub inserted_tick: u64,
    pub last_access_tick: u64,
    pub hits: u64,
}

impl AccessStats {
    pub fn new(tick: u64) -> Self {
        Self {
            inserted_tick: tick,
            last_access_tick: tick,
            hits: 0,
        }
    }
}

#[derive(Debug)]
pub(crate) struct EvictionIndex {
    policy: EvictionPolicy,
    order: BTreeMap<Rank, String>,
}

impl EvictionIndex {
    pub fn new(policy: EvictionPolicy) -> Self {
        Self {
            policy,
            order: BTreeMap::new(),
        }
    }

    /// tick 单调递增，因此排序键在各策略下都唯一
    pub fn rank(&self, stats: &AccessStats) -> Rank {
        match self.policy {
            EvictionPolicy::Lru => (stats.last_access_tick, 0),
            EvictionPolicy::Lfu => (stats.hits, stats.last_access_tick),
            EvictionPolicy::Fifo => (stats.inserted_tick, 0),
        }
    }

    pub fn insert(&mut self, rank: Rank, key: String) {
        self.order.insert(rank, key);
    }

    pub fn remove(&mut self, rank: &Rank) {
        self.order.remove(rank);
    }

    /// 条目被访问后更新位置
    pub fn reposition(&mut self, old: Rank, new: Rank) {
        if old == new {
            return;
        }
        if let Some(key) = self.order.remove(&old) {
            self.order.insert(new, key);
        }
    }

    /// 取出下一个淘汰对象
    pub fn pop_victim(&mut self) -> Option<String> {
        self.order.pop_first().map(|(_, key)| key)
    }

    pub fn clear(&mut self) {
        self.order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touched(mut stats: AccessStats, tick: u64) -> AccessStats {
        stats.last_access_tick = tick;
        stats.hits += 1;
        stats
    }

    #[test]
    fn test_lru_evicts_least_recently_accessed() {
        let mut index = EvictionIndex::new(EvictionPolicy::Lru);
        let a = AccessStats::new(1);
        let b = AccessStats::new(2);
        index.insert(index.rank(&a), "a".into());
        index.insert(index.rank(&b), "b".into());

        let a2 = touched(a, 3);
        index.reposition(index.rank(&a), index.rank(&a2));

        assert_eq!(index.pop_victim().as_deref(), Some("b"));
        assert_eq!(index.pop_victim().as_deref(), Some("a"));
        assert_eq!(index.pop_victim(), None);
    }

    #[test]
    fn test_lfu_breaks_ties_by_recency() {
        let mut index = EvictionIndex::new(EvictionPolicy::Lfu);
        let a = AccessStats::new(1);
        let b = AccessStats::new(2);
        let c = AccessStats::new(3);
        for (stats, key) in [(a, "a"), (b, "b"), (c, "c")] {
            index.insert(index.rank(&stats), key.into());
        }

        let a2 = touched(a, 4);
        index.reposition(index.rank(&a), index.rank(&a2));

        // b 与 c 都没有命中，b 更早
        assert_eq!(index.pop_victim().as_deref(), Some("b"));
        assert_eq!(index.pop_victim().as_deref(), Some("c"));
        assert_eq!(index.pop_victim().as_deref(), Some("a"));
    }

    #[test]
    fn test_fifo_ignores_access() {
        let mut index = EvictionIndex::new(EvictionPolicy::Fifo);
        let a = AccessStats::new(1);
        let b = AccessStats::new(2);
        index.insert(index.rank(&a), "a".into());
        index.insert(index.rank(&b), "b".into());

        let a2 = touched(a, 3);
        index.reposition(index.rank(&a), index.rank(&a2));

        assert_eq!(index.pop_victim().as_deref(), Some("a"));
    }
}
