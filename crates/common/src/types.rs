//! 通用类型定义

use derive_more::{Display, From};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 请求 ID（用于关联重试上下文与日志）
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From)]
#[display("{_0}")]
pub struct RequestId(pub String);

impl RequestId {
    /// 生成新的请求 ID（UUID v7，时间有序）
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// 缓存淘汰策略
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    /// 淘汰最久未访问的条目
    #[default]
    #[display("lru")]
    Lru,
    /// 淘汰访问次数最少的条目（次数相同时按 LRU）
    #[display("lfu")]
    Lfu,
    /// 淘汰最早写入的条目
    #[display("fifo")]
    Fifo,
}

/// 容量计量单位
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapacityUnit {
    /// 按条目数
    #[default]
    Entries,
    /// 按字节数（key + value）
    Bytes,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_is_unique() {
        assert_ne!(RequestId::new(), RequestId::new());
        assert_eq!(RequestId::from("req-1").to_string(), "req-1");
    }

    #[test]
    fn test_eviction_policy_serde() {
        let policy: EvictionPolicy = serde_json::from_str("\"lfu\"").unwrap();
        assert_eq!(policy, EvictionPolicy::Lfu);
        assert_eq!(EvictionPolicy::default(), EvictionPolicy::Lru);
        assert_eq!(EvictionPolicy::Fifo.to_string(), "fifo");
    }
}
