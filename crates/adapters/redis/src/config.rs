//! Redis 缓存层配置

use std::time::Duration;

use errors::{AppError, AppResult};

/// Redis 缓存层配置
#[derive(Debug, Clone, PartialEq)]
pub struct RedisTierConfig {
    /// Redis URL
    pub url: String,
    /// 键前缀，清空时只删除带此前缀的键
    pub key_prefix: String,
    /// 建立连接超时
    pub connect_timeout: Duration,
    /// 出错后的不可用冷却期
    pub unavailable_cooldown: Duration,
    /// 清空时每批 SCAN / DEL 的键数量
    pub scan_batch: usize,
}

impl Default for RedisTierConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "tiergate:l2:".to_string(),
            connect_timeout: Duration::from_secs(5),
            unavailable_cooldown: Duration::from_secs(5),
            scan_batch: 500,
        }
    }
}

impl RedisTierConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// 设置键前缀
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// 设置连接超时
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// 设置不可用冷却期
    pub fn with_unavailable_cooldown(mut self, cooldown: Duration) -> Self {
        self.unavailable_cooldown = cooldown;
        self
    }

    /// 校验配置
    ///
    /// 前缀为空时清空操作会匹配整个数据库，必须拒绝
    pub fn validate(&self) -> AppResult<()> {
        if self.key_prefix.trim().is_empty() {
            return Err(AppError::invalid_argument("redis key prefix must not be empty"));
        }
        Ok(())
    }
}
