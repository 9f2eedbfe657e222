use std::time::Duration;

use async_trait::async_trait;
use sqlx::{PgPool, Row, postgres::PgPoolOptions};

use crate::cursor::{CursorStore, StoreError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// PostgreSQL-backed cursor store: one row per task in
/// `<prefix>checkpoints`, upserted on conflict.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
    table: String,
}

impl PostgresStore {
    /// Connects and creates the checkpoint table if it doesn't exist.
    ///
    /// An empty `table_prefix` defaults to `scanner_`, yielding the table
    /// `scanner_checkpoints`.
    pub async fn connect(database_url: &str, table_prefix: &str) -> Result<Self, StoreError> {
        let prefix = if table_prefix.is_empty() { "scanner_" } else { table_prefix };
        let table = format!("{prefix}checkpoints");
        // The table name is interpolated into DDL, so it must stay strictly
        // alphanumeric.
        if !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(StoreError(format!("invalid table name: {table}")));
        }

        let pool = PgPoolOptions::new()
            .acquire_timeout(CONNECT_TIMEOUT)
            .connect(database_url)
            .await
            .map_err(StoreError::backend)?;

        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                task_key     VARCHAR(255) PRIMARY KEY,
                block_height BIGINT NOT NULL,
                updated_at   TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )"
        ))
        .execute(&pool)
        .await
        .map_err(StoreError::backend)?;

        Ok(Self { pool, table })
    }
}

#[async_trait]
impl CursorStore for PostgresStore {
    async fn load(&self, task_key: &str) -> Result<u64, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT block_height FROM {} WHERE task_key = $1",
            self.table
        ))
        .bind(task_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::backend)?;

        Ok(row.map(|r| r.get::<i64, _>(0) as u64).unwrap_or(0))
    }

    async fn save(&self, task_key: &str, height: u64) -> Result<(), StoreError> {
        sqlx::query(&format!(
            "INSERT INTO {} (task_key, block_height, updated_at)
             VALUES ($1, $2, NOW())
             ON CONFLICT (task_key)
             DO UPDATE SET block_height = EXCLUDED.block_height, updated_at = NOW()",
            self.table
        ))
        .bind(task_key)
        .bind(height as i64)
        .execute(&self.pool)
        .await
        .map_err(StoreError::backend)?;

        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.pool.close().await;
        Ok(())
    }
}
