//! Redis 连接管理

use std::time::Duration;

use errors::{AppError, AppResult};
use redis::Client;
use redis::aio::ConnectionManager;

/// 创建 Redis 连接管理器
pub async fn create_connection_manager(url: &str, timeout: Duration) -> AppResult<ConnectionManager> {
    let client = Client::open(url)
        .map_err(|e| AppError::tier_unavailable("redis", format!("Failed to create Redis client: {}", e)))?;

    match tokio::time::timeout(timeout, ConnectionManager::new(client)).await {
        Ok(Ok(manager)) => Ok(manager),
        Ok(Err(e)) => Err(AppError::tier_unavailable(
            "redis",
            format!("Failed to create Redis connection manager: {}", e),
        )),
        Err(_) => Err(AppError::tier_unavailable(
            "redis",
            format!("Redis connection timed out after {}ms", timeout.as_millis()),
        )),
    }
}

/// 检查 Redis 连接
pub async fn check_connection(conn: &mut ConnectionManager) -> AppResult<()> {
    redis::cmd("PING")
        .query_async::<String>(conn)
        .await
        .map_err(|e| AppError::tier_unavailable("redis", format!("Redis health check failed: {}", e)))?;
    Ok(())
}
