use std::time::Duration;

use async_trait::async_trait;
use redis::{Client, aio::MultiplexedConnection};
use tokio::time::timeout;

use crate::{
    config::RedisMode,
    sink::{DecodedLog, Sink, SinkError},
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Key-value sink: one JSON message per log, pipelined per batch.
pub struct RedisSink {
    conn: MultiplexedConnection,
    key: String,
    mode: RedisMode,
}

impl RedisSink {
    pub async fn connect(url: &str, key: &str, mode: RedisMode) -> Result<Self, SinkError> {
        let client = Client::open(url).map_err(SinkError::backend)?;
        let mut conn = timeout(CONNECT_TIMEOUT, client.get_multiplexed_async_connection())
            .await
            .map_err(|_| SinkError::Backend("redis connect timed out".to_string()))?
            .map_err(SinkError::backend)?;

        redis::cmd("PING").query_async::<()>(&mut conn).await.map_err(SinkError::backend)?;

        Ok(Self { conn, key: key.to_string(), mode })
    }
}

#[async_trait]
impl Sink for RedisSink {
    fn name(&self) -> &str {
        "redis"
    }

    async fn send(&self, logs: &[DecodedLog]) -> Result<(), SinkError> {
        let mut pipe = redis::pipe();
        for entry in logs {
            let data = serde_json::to_vec(entry)?;
            match self.mode {
                RedisMode::List => pipe.lpush(&self.key, data).ignore(),
                RedisMode::PubSub => pipe.publish(&self.key, data).ignore(),
            };
        }

        let mut conn = self.conn.clone();
        pipe.query_async::<()>(&mut conn).await.map_err(SinkError::backend)
    }

    async fn close(&self) -> Result<(), SinkError> {
        Ok(())
    }
}
