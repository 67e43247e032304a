//! tiergate-config - 配置加载库
//!
//! 加载顺序：`default.toml` → `{APP_ENV}.toml` → `TIERGATE_` 前缀的环境变量（`__` 分隔层级）。
//! 所有字段都有默认值，`AppConfig::default()` 本身就是可用的配置。

use std::time::Duration;

use common::{CapacityUnit, EvictionPolicy};
use errors::ErrorKind;
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use secrecy::Secret;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load config: {0}")]
    Load(#[from] figment::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// 遥测配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
    /// 输出 JSON 格式日志
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json: false,
        }
    }
}

/// L1 内存缓存配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Tier1Config {
    pub capacity: usize,
    pub capacity_unit: CapacityUnit,
    pub ttl_ms: u64,
    pub eviction_policy: EvictionPolicy,
}

impl Default for Tier1Config {
    fn default() -> Self {
        Self {
            capacity: 1000,
            capacity_unit: CapacityUnit::Entries,
            ttl_ms: 5 * 60 * 1000,
            eviction_policy: EvictionPolicy::Lru,
        }
    }
}

impl Tier1Config {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

/// L2 / L3 缓存层配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemoteTierConfig {
    pub enabled: bool,
    /// 未设置时使用所在层的默认 TTL
    pub ttl_ms: Option<u64>,
    pub unavailable_cooldown_ms: u64,
}

impl Default for RemoteTierConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_ms: None,
            unavailable_cooldown_ms: 5000,
        }
    }
}

impl RemoteTierConfig {
    pub fn unavailable_cooldown(&self) -> Duration {
        Duration::from_millis(self.unavailable_cooldown_ms)
    }
}

const DEFAULT_TIER2_TTL_MS: u64 = 60 * 60 * 1000;
const DEFAULT_TIER3_TTL_MS: u64 = 24 * 60 * 60 * 1000;

/// 缓存配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// 缓存键命名空间
    pub namespace: String,
    /// 缓存键结构版本，升级后旧键自然失效
    pub schema_version: u32,
    /// 每隔多少次访问清理一次 L1 过期条目
    pub cleanup_every: u64,
    pub memory_ceiling_bytes: usize,
    pub min_requests_for_hit_rate: u64,
    pub min_hit_rate: f64,
    pub tier1: Tier1Config,
    pub tier2: RemoteTierConfig,
    pub tier3: RemoteTierConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            namespace: "tiergate".to_string(),
            schema_version: 1,
            cleanup_every: 100,
            memory_ceiling_bytes: 64 * 1024 * 1024,
            min_requests_for_hit_rate: 10,
            min_hit_rate: 0.30,
            tier1: Tier1Config::default(),
            tier2: RemoteTierConfig::default(),
            tier3: RemoteTierConfig::default(),
        }
    }
}

impl CacheConfig {
    pub fn tier2_ttl(&self) -> Duration {
        Duration::from_millis(self.tier2.ttl_ms.unwrap_or(DEFAULT_TIER2_TTL_MS))
    }

    pub fn tier3_ttl(&self) -> Duration {
        Duration::from_millis(self.tier3.ttl_ms.unwrap_or(DEFAULT_TIER3_TTL_MS))
    }
}

/// 重试配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
    pub jitter_fraction: f64,
    pub retryable_error_kinds: Vec<ErrorKind>,
    /// 单次尝试超时
    pub attempt_timeout_ms: u64,
    /// 重试上下文保留时长
    pub context_retention_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 10_000,
            backoff_factor: 2.0,
            jitter_fraction: 0.1,
            retryable_error_kinds: vec![
                ErrorKind::Timeout,
                ErrorKind::Network,
                ErrorKind::UpstreamApi,
                ErrorKind::RateLimit,
            ],
            attempt_timeout_ms: 30_000,
            context_retention_ms: 10 * 60 * 1000,
        }
    }
}

impl RetrySettings {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn context_retention(&self) -> Duration {
        Duration::from_millis(self.context_retention_ms)
    }
}

/// 断路器配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub open_duration_ms: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration_ms: 60_000,
        }
    }
}

impl BreakerSettings {
    pub fn open_duration(&self) -> Duration {
        Duration::from_millis(self.open_duration_ms)
    }
}

/// Redis 配置（L2）
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub url: Secret<String>,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_key_prefix() -> String {
    "tiergate:l2:".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

/// 数据库配置（L3）
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: Secret<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_max_connections() -> u32 {
    10
}

fn default_table() -> String {
    "tiergate_cache_entries".to_string()
}

/// 应用配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app_name: String,
    pub app_env: String,
    pub telemetry: TelemetryConfig,
    pub cache: CacheConfig,
    pub retry: RetrySettings,
    pub breaker: BreakerSettings,
    pub redis: Option<RedisConfig>,
    pub database: Option<DatabaseConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            app_name: "tiergate".to_string(),
            app_env: "development".to_string(),
            telemetry: TelemetryConfig::default(),
            cache: CacheConfig::default(),
            retry: RetrySettings::default(),
            breaker: BreakerSettings::default(),
            redis: None,
            database: None,
        }
    }
}

impl AppConfig {
    /// 从配置文件和环境变量加载配置
    pub fn load(config_dir: &str) -> Result<Self, ConfigError> {
        Self::from_figment(Self::figment(config_dir))
    }

    /// 组合配置来源
    pub fn figment(config_dir: &str) -> Figment {
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        Figment::new()
            .merge(Toml::file(format!("{}/default.toml", config_dir)))
            .merge(Toml::file(format!("{}/{}.toml", config_dir, env)))
            .merge(Env::prefixed("TIERGATE_").split("__"))
    }

    /// 从任意 figment 提取并校验
    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// 校验取值范围
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.cache.namespace.trim().is_empty() {
            return invalid("cache.namespace must not be empty");
        }
        if self.cache.schema_version == 0 {
            return invalid("cache.schema_version must be positive");
        }
        if self.cache.tier1.capacity == 0 {
            return invalid("cache.tier1.capacity must be positive");
        }
        if self.cache.tier1.ttl_ms == 0
            || self.cache.tier2.ttl_ms == Some(0)
            || self.cache.tier3.ttl_ms == Some(0)
        {
            return invalid("cache tier ttl_ms must be positive");
        }
        if !(0.0..=1.0).contains(&self.cache.min_hit_rate) {
            return invalid("cache.min_hit_rate must be within [0, 1]");
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be at least 1");
        }
        if self.retry.backoff_factor < 1.0 {
            return invalid("retry.backoff_factor must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_fraction) {
            return invalid("retry.jitter_fraction must be within [0, 1]");
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return invalid("retry.base_delay_ms must not exceed retry.max_delay_ms");
        }
        if self.retry.attempt_timeout_ms == 0 {
            return invalid("retry.attempt_timeout_ms must be positive");
        }
        if self.breaker.failure_threshold == 0 {
            return invalid("breaker.failure_threshold must be at least 1");
        }
        if let Some(redis) = &self.redis {
            if redis.key_prefix.trim().is_empty() {
                return invalid("redis.key_prefix must not be empty");
            }
        }
        Ok(())
    }

    /// 是否为生产环境
    pub fn is_production(&self) -> bool {
        self.app_env == "production"
    }

    /// 是否为开发环境
    pub fn is_development(&self) -> bool {
        self.app_env == "development"
    }
}

#[cfg(test)]
mod tests;
