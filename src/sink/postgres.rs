use std::time::Duration;

use async_trait::async_trait;
use sqlx::{PgPool, postgres::PgPoolOptions};

use crate::sink::{DecodedLog, Sink, SinkError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Relational sink: one row per log, deduplicated on
/// `(tx_hash, log_index)` so re-delivered batches are harmless.
pub struct PostgresSink {
    pool: PgPool,
    table: String,
}

impl PostgresSink {
    /// Connects and creates the target table and block-number index.
    ///
    /// # Errors
    ///
    /// Rejects table names not matching `[A-Za-z0-9_]+`, since the name is
    /// interpolated into SQL.
    pub async fn connect(database_url: &str, table: &str) -> Result<Self, SinkError> {
        if table.is_empty() || !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(SinkError::Backend(format!("invalid table name: {table}")));
        }

        let pool = PgPoolOptions::new()
            .acquire_timeout(CONNECT_TIMEOUT)
            .connect(database_url)
            .await
            .map_err(SinkError::backend)?;

        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id           BIGSERIAL PRIMARY KEY,
                block_number BIGINT,
                tx_hash      TEXT,
                log_index    INT,
                event_name   TEXT,
                data         JSONB,
                created_at   TIMESTAMPTZ DEFAULT NOW(),
                UNIQUE (tx_hash, log_index)
            )"
        ))
        .execute(&pool)
        .await
        .map_err(SinkError::backend)?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{table}_block ON {table} (block_number)"
        ))
        .execute(&pool)
        .await
        .map_err(SinkError::backend)?;

        Ok(Self { pool, table: table.to_string() })
    }
}

#[async_trait]
impl Sink for PostgresSink {
    fn name(&self) -> &str {
        "postgres"
    }

    async fn send(&self, logs: &[DecodedLog]) -> Result<(), SinkError> {
        if logs.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await.map_err(SinkError::backend)?;
        for entry in logs {
            let data = serde_json::to_value(entry)?;
            let tx_hash = entry
                .log
                .transaction_hash
                .map(|hash| format!("{hash:#x}"))
                .unwrap_or_default();

            sqlx::query(&format!(
                "INSERT INTO {} (block_number, tx_hash, log_index, event_name, data)
                 VALUES ($1, $2, $3, $4, $5)
                 ON CONFLICT (tx_hash, log_index) DO NOTHING",
                self.table
            ))
            .bind(entry.log.block_number.unwrap_or_default() as i64)
            .bind(tx_hash)
            .bind(entry.log.log_index.unwrap_or_default() as i64)
            .bind(&entry.event_name)
            .bind(data)
            .execute(&mut *tx)
            .await
            .map_err(SinkError::backend)?;
        }
        tx.commit().await.map_err(SinkError::backend)?;
        Ok(())
    }

    async fn close(&self) -> Result<(), SinkError> {
        self.pool.close().await;
        Ok(())
    }
}
