use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, Stdout, stdout};
use tokio::sync::Mutex;

use crate::sink::{DecodedLog, Sink, SinkError};

/// Writes one JSON document per log to stdout. Batches are serialized
/// under a lock so concurrent dispatches don't interleave lines.
pub struct ConsoleSink {
    out: Mutex<Stdout>,
}

impl ConsoleSink {
    pub fn new() -> Self {
        Self { out: Mutex::new(stdout()) }
    }
}

impl Default for ConsoleSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Sink for ConsoleSink {
    fn name(&self) -> &str {
        "console"
    }

    async fn send(&self, logs: &[DecodedLog]) -> Result<(), SinkError> {
        let mut out = self.out.lock().await;
        for log in logs {
            let mut line = serde_json::to_vec(log)?;
            line.push(b'\n');
            out.write_all(&line).await?;
        }
        out.flush().await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), SinkError> {
        self.out.lock().await.flush().await?;
        Ok(())
    }
}
