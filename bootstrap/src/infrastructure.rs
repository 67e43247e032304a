//! 基础设施资源管理
//!
//! L2 / L3 都是可选的：未配置或连接失败时跳过，可靠性层只用 L1 继续工作

use std::sync::Arc;
use std::time::Duration;

use adapter_postgres::{PostgresConfig, PostgresTier};
use adapter_redis::{RedisTier, RedisTierConfig};
use common::{RetryConfig, with_retry_optional};
use config::AppConfig;
use ports::CacheTierPort;
use secrecy::ExposeSecret;
use tracing::info;

/// 外部缓存层连接
#[derive(Default)]
pub struct Infrastructure {
    redis: Option<Arc<RedisTier>>,
    postgres: Option<Arc<PostgresTier>>,
}

impl Infrastructure {
    /// 从配置建立连接（带重试，失败不报错）
    pub async fn from_config(config: &AppConfig) -> Self {
        let retry_config = RetryConfig::new(3, Duration::from_millis(500), Duration::from_secs(5));

        // 1. Redis（L2，可选）
        let redis = match &config.redis {
            Some(redis) if config.cache.tier2.enabled => {
                let tier_config = RedisTierConfig::new(redis.url.expose_secret().clone())
                    .with_key_prefix(redis.key_prefix.clone())
                    .with_connect_timeout(Duration::from_millis(redis.connect_timeout_ms))
                    .with_unavailable_cooldown(config.cache.tier2.unavailable_cooldown());
                let result = with_retry_optional(&retry_config, "Redis cache tier", || {
                    let cfg = tier_config.clone();
                    async move { RedisTier::connect(&cfg).await }
                })
                .await;
                if result.is_some() {
                    info!(prefix = %redis.key_prefix, "Redis cache tier (L2) ready");
                }
                result.map(Arc::new)
            }
            _ => {
                info!("Redis not configured or disabled, skipping L2");
                None
            }
        };

        // 2. PostgreSQL（L3，可选）
        let postgres = match &config.database {
            Some(database) if config.cache.tier3.enabled => {
                let mut pg_config = PostgresConfig::new(database.url.expose_secret().clone())
                    .with_max_connections(database.max_connections)
                    .with_table(database.table.clone())
                    .with_unavailable_cooldown(config.cache.tier3.unavailable_cooldown());
                pg_config.connect_timeout = Duration::from_millis(database.connect_timeout_ms);
                let result = with_retry_optional(&retry_config, "PostgreSQL cache tier", || {
                    let cfg = pg_config.clone();
                    async move { PostgresTier::connect(&cfg).await }
                })
                .await;
                if result.is_some() {
                    info!(
                        table = %database.table,
                        max_connections = database.max_connections,
                        "PostgreSQL cache tier (L3) ready"
                    );
                }
                result.map(Arc::new)
            }
            _ => {
                info!("Database not configured or disabled, skipping L3");
                None
            }
        };

        Self { redis, postgres }
    }

    pub fn redis(&self) -> Option<&Arc<RedisTier>> {
        self.redis.as_ref()
    }

    pub fn postgres(&self) -> Option<&Arc<PostgresTier>> {
        self.postgres.as_ref()
    }

    /// L2 端口
    pub fn l2(&self) -> Option<Arc<dyn CacheTierPort>> {
        self.redis
            .as_ref()
            .map(|tier| Arc::clone(tier) as Arc<dyn CacheTierPort>)
    }

    /// L3 端口
    pub fn l3(&self) -> Option<Arc<dyn CacheTierPort>> {
        self.postgres
            .as_ref()
            .map(|tier| Arc::clone(tier) as Arc<dyn CacheTierPort>)
    }
}
