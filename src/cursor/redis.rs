use std::time::Duration;

use async_trait::async_trait;
use redis::{AsyncCommands, Client, aio::MultiplexedConnection};
use tokio::time::timeout;

use crate::cursor::{CursorStore, StoreError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Redis-backed cursor store. Keys are `<prefix><task_key>`, values the
/// decimal block height, stored without expiry.
#[derive(Clone)]
pub struct RedisStore {
    conn: MultiplexedConnection,
    prefix: String,
}

impl RedisStore {
    /// Connects and pings the server. An empty `prefix` defaults to
    /// `scanner:`.
    pub async fn connect(url: &str, prefix: &str) -> Result<Self, StoreError> {
        let client = Client::open(url).map_err(StoreError::backend)?;
        let mut conn = timeout(CONNECT_TIMEOUT, client.get_multiplexed_async_connection())
            .await
            .map_err(|_| StoreError("redis connect timed out".to_string()))?
            .map_err(StoreError::backend)?;

        redis::cmd("PING")
            .query_async::<()>(&mut conn)
            .await
            .map_err(StoreError::backend)?;

        let prefix = if prefix.is_empty() { "scanner:" } else { prefix };
        Ok(Self { conn, prefix: prefix.to_string() })
    }

    fn key(&self, task_key: &str) -> String {
        format!("{}{task_key}", self.prefix)
    }
}

#[async_trait]
impl CursorStore for RedisStore {
    async fn load(&self, task_key: &str) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<u64> =
            conn.get(self.key(task_key)).await.map_err(StoreError::backend)?;
        Ok(value.unwrap_or(0))
    }

    async fn save(&self, task_key: &str, height: u64) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        // No TTL: a cursor must outlive any idle period.
        conn.set::<_, _, ()>(self.key(task_key), height).await.map_err(StoreError::backend)
    }

    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
