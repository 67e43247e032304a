//! PostgreSQL 缓存层实现
//!
//! 过期判断使用数据库时钟，避免应用与数据库之间的时钟偏差

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use errors::{AppError, AppResult};
use ports::{CacheTierPort, TierAvailability, TierHit};
use sqlx::PgPool;
use tracing::{debug, warn};

use crate::connection::{PostgresConfig, check_connection, create_pool};
use crate::schema::{ensure_schema, validate_table_name};

struct Statements {
    get: String,
    upsert: String,
    delete: String,
    clear: String,
    purge: String,
}

impl Statements {
    fn new(table: &str) -> Self {
        Self {
            get: format!(
                "SELECT value, GREATEST(0, (EXTRACT(EPOCH FROM (expires_at - NOW())) * 1000))::BIGINT \
                 FROM {table} WHERE key = $1 AND expires_at > NOW()"
            ),
            upsert: format!(
                "INSERT INTO {table} (key, value, expires_at) \
                 VALUES ($1, $2, NOW() + ($3 * INTERVAL '1 millisecond')) \
                 ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at"
            ),
            delete: format!("DELETE FROM {table} WHERE key = $1"),
            clear: format!("DELETE FROM {table}"),
            purge: format!("DELETE FROM {table} WHERE expires_at <= NOW()"),
        }
    }
}

/// PostgreSQL 缓存层
pub struct PostgresTier {
    pool: PgPool,
    table: String,
    statements: Statements,
    availability: TierAvailability,
    purge_every: u64,
    writes: AtomicU64,
}

impl PostgresTier {
    pub fn new(pool: PgPool, config: &PostgresConfig) -> AppResult<Self> {
        validate_table_name(&config.table)?;
        Ok(Self {
            pool,
            table: config.table.clone(),
            statements: Statements::new(&config.table),
            availability: TierAvailability::new(config.unavailable_cooldown),
            purge_every: config.purge_every,
            writes: AtomicU64::new(0),
        })
    }

    /// 建立连接池、验证连接并初始化表结构
    pub async fn connect(config: &PostgresConfig) -> AppResult<Self> {
        let pool = create_pool(config).await?;
        check_connection(&pool).await?;
        ensure_schema(&pool, &config.table).await?;
        Self::new(pool, config)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// 删除所有已过期的行，返回删除数量
    pub async fn purge_expired(&self) -> AppResult<u64> {
        let result = sqlx::query(&self.statements.purge)
            .execute(&self.pool)
            .await
            .map_err(|e| Self::tier_error("purge", e))?;
        let removed = result.rows_affected();
        if removed > 0 {
            debug!(table = %self.table, removed, "Expired cache rows purged");
        }
        Ok(removed)
    }

    fn track<T>(&self, result: &AppResult<T>) {
        match result {
            Ok(_) => self.availability.mark_success(),
            Err(_) => self.availability.mark_failure(),
        }
    }

    fn tier_error(operation: &str, e: sqlx::Error) -> AppError {
        AppError::tier_unavailable("postgres", format!("Postgres {} failed: {}", operation, e))
    }

    async fn maybe_purge(&self) {
        if self.purge_every == 0 {
            return;
        }
        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % self.purge_every == 0 {
            if let Err(e) = self.purge_expired().await {
                warn!(table = %self.table, error = %e, "Expired cache rows purge failed");
            }
        }
    }
}

#[async_trait]
impl CacheTierPort for PostgresTier {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn is_available(&self) -> bool {
        self.availability.is_available()
    }

    async fn get(&self, key: &str) -> AppResult<Option<TierHit>> {
        let result = sqlx::query_as::<_, (String, i64)>(&self.statements.get)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map(|row| {
                row.map(|(value, remaining_ms)| {
                    TierHit::new(value, Some(Duration::from_millis(remaining_ms.max(0) as u64)))
                })
            })
            .map_err(|e| Self::tier_error("get", e));
        self.track(&result);
        result
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> AppResult<()> {
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX).max(1);
        let result = sqlx::query(&self.statements.upsert)
            .bind(key)
            .bind(value)
            .bind(ttl_ms)
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|e| Self::tier_error("set", e));
        self.track(&result);
        if result.is_ok() {
            self.maybe_purge().await;
        }
        result
    }

    async fn delete(&self, key: &str) -> AppResult<()> {
        let result = sqlx::query(&self.statements.delete)
            .bind(key)
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|e| Self::tier_error("delete", e));
        self.track(&result);
        result
    }

    async fn clear(&self) -> AppResult<()> {
        let result = sqlx::query(&self.statements.clear)
            .execute(&self.pool)
            .await
            .map(|done| {
                debug!(table = %self.table, removed = done.rows_affected(), "Postgres cache tier cleared");
            })
            .map_err(|e| Self::tier_error("clear", e));
        self.track(&result);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statements_target_table() {
        let statements = Statements::new("cache_entries");
        assert!(statements.get.contains("FROM cache_entries WHERE key = $1"));
        assert!(statements.upsert.starts_with("INSERT INTO cache_entries"));
        assert!(statements.upsert.contains("ON CONFLICT (key)"));
        assert_eq!(statements.delete, "DELETE FROM cache_entries WHERE key = $1");
        assert_eq!(statements.clear, "DELETE FROM cache_entries");
    }

    #[test]
    fn test_config_defaults() {
        let config = PostgresConfig::new("postgres://localhost/cache").with_table("l3_cache");
        assert_eq!(config.table, "l3_cache");
        assert_eq!(config.purge_every, 1000);
        assert_eq!(config.unavailable_cooldown, Duration::from_secs(5));
    }
}
