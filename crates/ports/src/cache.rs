//! Cache tier trait 定义

use std::time::Duration;

use async_trait::async_trait;
use errors::AppResult;
use parking_lot::Mutex;
use tokio::time::Instant;

/// 缓存层命中结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierHit {
    pub value: String,
    /// 剩余存活时间（存储不支持时为 None）
    pub remaining_ttl: Option<Duration>,
}

impl TierHit {
    pub fn new(value: impl Into<String>, remaining_ttl: Option<Duration>) -> Self {
        Self {
            value: value.into(),
            remaining_ttl,
        }
    }
}

/// 进程外缓存层（L2 共享快速存储 / L3 持久存储）
///
/// 实现需要自行捕获存储错误并返回 `AppError`，由编排层降级为未命中
#[async_trait]
pub trait CacheTierPort: Send + Sync {
    /// 层名称（用于日志和指标）
    fn name(&self) -> &'static str;

    /// 当前是否可用，编排层在访问前检查
    fn is_available(&self) -> bool;

    /// 获取缓存值
    async fn get(&self, key: &str) -> AppResult<Option<TierHit>>;

    /// 设置缓存值
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> AppResult<()>;

    /// 删除缓存
    async fn delete(&self, key: &str) -> AppResult<()>;

    /// 清空本层所有缓存
    async fn clear(&self) -> AppResult<()>;
}

/// 存储可用性跟踪
///
/// 出错后在冷却期内标记为不可用，冷却期结束自动恢复，不依赖后台定时器
#[derive(Debug)]
pub struct TierAvailability {
    cooldown: Duration,
    unavailable_until: Mutex<Option<Instant>>,
}

impl TierAvailability {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            unavailable_until: Mutex::new(None),
        }
    }

    pub fn is_available(&self) -> bool {
        let mut until = self.unavailable_until.lock();
        match *until {
            Some(deadline) if Instant::now() < deadline => false,
            Some(_) => {
                *until = None;
                true
            }
            None => true,
        }
    }

    /// 记录一次失败，进入冷却期
    pub fn mark_failure(&self) {
        if self.cooldown.is_zero() {
            return;
        }
        *self.unavailable_until.lock() = Some(Instant::now() + self.cooldown);
    }

    pub fn mark_success(&self) {
        *self.unavailable_until.lock() = None;
    }
}

impl Default for TierAvailability {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}
