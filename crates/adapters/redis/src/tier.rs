//! Redis 缓存层实现

use std::time::Duration;

use async_trait::async_trait;
use errors::{AppError, AppResult};
use futures::StreamExt;
use ports::{CacheTierPort, TierAvailability, TierHit};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tracing::{debug, warn};

use crate::config::RedisTierConfig;
use crate::connection::{check_connection, create_connection_manager};

/// Redis 缓存层
///
/// 值以字符串存储，TTL 使用毫秒精度（PSETEX / PTTL）
pub struct RedisTier {
    conn: ConnectionManager,
    key_prefix: String,
    scan_batch: usize,
    availability: TierAvailability,
}

impl RedisTier {
    pub fn new(conn: ConnectionManager, config: &RedisTierConfig) -> AppResult<Self> {
        config.validate()?;
        Ok(Self {
            conn,
            key_prefix: config.key_prefix.clone(),
            scan_batch: config.scan_batch.max(1),
            availability: TierAvailability::new(config.unavailable_cooldown),
        })
    }

    /// 建立连接并验证可用
    pub async fn connect(config: &RedisTierConfig) -> AppResult<Self> {
        config.validate()?;
        let mut conn = create_connection_manager(&config.url, config.connect_timeout).await?;
        check_connection(&mut conn).await?;
        debug!(prefix = %config.key_prefix, "Redis cache tier connected");
        Self::new(conn, config)
    }

    /// 健康检查
    pub async fn ping(&self) -> AppResult<()> {
        let mut conn = self.conn.clone();
        let result = check_connection(&mut conn).await;
        self.track(&result);
        result
    }

    fn prefixed(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    fn track<T>(&self, result: &AppResult<T>) {
        match result {
            Ok(_) => self.availability.mark_success(),
            Err(_) => self.availability.mark_failure(),
        }
    }

    fn tier_error(operation: &str, e: redis::RedisError) -> AppError {
        AppError::tier_unavailable("redis", format!("Redis {} failed: {}", operation, e))
    }

    async fn fetch(&self, key: &str) -> AppResult<Option<TierHit>> {
        let mut conn = self.conn.clone();
        let key = self.prefixed(key);
        let (value, pttl): (Option<String>, i64) = redis::pipe()
            .get(&key)
            .pttl(&key)
            .query_async(&mut conn)
            .await
            .map_err(|e| Self::tier_error("get", e))?;

        Ok(value.map(|value| TierHit::new(value, remaining_from_pttl(pttl))))
    }

    async fn clear_prefixed(&self) -> AppResult<usize> {
        let pattern = format!("{}*", escape_glob(&self.key_prefix));
        let keys: Vec<String> = {
            let mut conn = self.conn.clone();
            let iter = conn
                .scan_match::<_, String>(&pattern)
                .await
                .map_err(|e| Self::tier_error("scan", e))?;
            iter.collect().await
        };

        let mut conn = self.conn.clone();
        for chunk in keys.chunks(self.scan_batch) {
            let _: () = conn
                .del(chunk)
                .await
                .map_err(|e| Self::tier_error("clear", e))?;
        }
        Ok(keys.len())
    }
}

#[async_trait]
impl CacheTierPort for RedisTier {
    fn name(&self) -> &'static str {
        "redis"
    }

    fn is_available(&self) -> bool {
        self.availability.is_available()
    }

    async fn get(&self, key: &str) -> AppResult<Option<TierHit>> {
        let result = self.fetch(key).await;
        self.track(&result);
        result
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> AppResult<()> {
        let mut conn = self.conn.clone();
        let ttl_ms = (ttl.as_millis() as u64).max(1);
        let result: AppResult<()> = conn
            .pset_ex(self.prefixed(key), value, ttl_ms)
            .await
            .map_err(|e| Self::tier_error("set", e));
        self.track(&result);
        result
    }

    async fn delete(&self, key: &str) -> AppResult<()> {
        let mut conn = self.conn.clone();
        let result: AppResult<()> = conn
            .del(self.prefixed(key))
            .await
            .map_err(|e| Self::tier_error("delete", e));
        self.track(&result);
        result
    }

    async fn clear(&self) -> AppResult<()> {
        let result = self.clear_prefixed().await;
        self.track(&result);
        match result {
            Ok(removed) => {
                debug!(removed, prefix = %self.key_prefix, "Redis cache tier cleared");
                Ok(())
            }
            Err(e) => {
                warn!(prefix = %self.key_prefix, error = %e, "Redis cache tier clear failed");
                Err(e)
            }
        }
    }
}

/// PTTL 返回值：-2 键不存在，-1 没有过期时间
fn remaining_from_pttl(pttl: i64) -> Option<Duration> {
    u64::try_from(pttl).ok().map(Duration::from_millis)
}

/// 转义 SCAN MATCH 中的通配字符
fn escape_glob(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len());
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
