//! 缓存表结构初始化

use errors::{AppError, AppResult};
use sqlx::PgPool;
use tracing::info;

/// 校验表名，只允许字母、数字、下划线，且不能以数字开头
pub fn validate_table_name(table: &str) -> AppResult<()> {
    let mut chars = table.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    };
    if valid && table.len() <= 63 {
        Ok(())
    } else {
        Err(AppError::invalid_argument(format!(
            "invalid cache table name: {:?}",
            table
        )))
    }
}

/// 创建缓存表（幂等）
pub async fn ensure_schema(pool: &PgPool, table: &str) -> AppResult<()> {
    validate_table_name(table)?;

    let create_sql = format!(
        r#"
        CREATE TABLE IF NOT EXISTS {table} (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            expires_at TIMESTAMPTZ NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#
    );
    sqlx::query(&create_sql)
        .execute(pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to create cache table: {}", e)))?;

    let index_sql =
        format!("CREATE INDEX IF NOT EXISTS {table}_expires_at_idx ON {table} (expires_at)");
    sqlx::query(&index_sql)
        .execute(pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to create cache index: {}", e)))?;

    info!(table = %table, "Cache table initialized");
    Ok(())
}
