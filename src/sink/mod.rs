//! Output pipeline: the sink contract, the record sinks receive, and the
//! dispatcher that fans a batch out to every configured sink.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinSet;

use alloy::rpc::types::Log;

use crate::{
    BoxError,
    decoder::{DecodedEvent, EventDecoder},
    scanner::LogHandler,
};

mod console;
mod file;
mod webhook;

pub use console::ConsoleSink;
pub use file::FileSink;
pub use webhook::WebhookSink;

#[cfg(feature = "postgres")]
mod postgres;
#[cfg(feature = "postgres")]
pub use postgres::PostgresSink;

#[cfg(feature = "redis")]
mod redis;
#[cfg(feature = "redis")]
pub use redis::RedisSink;

#[cfg(feature = "kafka")]
mod kafka;
#[cfg(feature = "kafka")]
pub use kafka::KafkaSink;

#[cfg(feature = "rabbitmq")]
mod rabbitmq;
#[cfg(feature = "rabbitmq")]
pub use rabbitmq::RabbitMqSink;

/// What sinks receive: the raw log plus its decoded form when an ABI
/// decoder was configured and recognized the event.
#[derive(Debug, Clone, Serialize)]
pub struct DecodedLog {
    pub log: Log,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub decoded: Option<DecodedEvent>,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub event_name: String,
}

impl DecodedLog {
    /// Wraps a raw log with no decoded form.
    pub fn raw(log: Log) -> Self {
        Self { log, decoded: None, event_name: String::new() }
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink is closed")]
    Closed,

    #[error("serialize: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("http transport: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {0}")]
    Status(u16),

    #[error("delivery failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: usize,
        #[source]
        source: Box<SinkError>,
    },

    #[error("{0}")]
    Backend(String),
}

impl SinkError {
    pub(crate) fn backend(error: impl std::fmt::Display) -> Self {
        Self::Backend(error.to_string())
    }
}

/// Capability set every output backend provides.
///
/// `send` must tolerate duplicate batches: the scanner guarantees
/// at-least-once delivery, not exactly-once.
#[async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, logs: &[DecodedLog]) -> Result<(), SinkError>;

    async fn close(&self) -> Result<(), SinkError>;
}

/// The standard scan-loop handler: decodes each log, then delivers the
/// batch to every sink concurrently.
///
/// Sink failures are logged and swallowed so one broken sink cannot stall
/// the cursor; decode failures drop to a raw (undecoded) record rather
/// than aborting the range.
pub struct Dispatcher {
    sinks: Vec<Arc<dyn Sink>>,
    decoder: Option<Arc<EventDecoder>>,
}

impl Dispatcher {
    pub fn new(sinks: Vec<Arc<dyn Sink>>) -> Self {
        Self { sinks, decoder: None }
    }

    #[must_use]
    pub fn with_decoder(mut self, decoder: Arc<EventDecoder>) -> Self {
        self.decoder = Some(decoder);
        self
    }

    /// Decodes a batch; logs that the ABI doesn't cover stay raw.
    fn decorate(&self, logs: Vec<Log>) -> Vec<DecodedLog> {
        let Some(decoder) = &self.decoder else {
            return logs.into_iter().map(DecodedLog::raw).collect();
        };

        logs.into_iter()
            .map(|log| match decoder.decode(&log) {
                Ok(decoded) => {
                    let event_name = decoded.name.clone();
                    DecodedLog { log, decoded: Some(decoded), event_name }
                }
                Err(e) => {
                    tracing::warn!(
                        block = log.block_number,
                        log_index = log.log_index,
                        error = %e,
                        "failed to decode log, passing through raw"
                    );
                    DecodedLog::raw(log)
                }
            })
            .collect()
    }

    /// Delivers one decorated batch to all sinks, one task per sink.
    pub async fn dispatch(&self, logs: Vec<Log>) {
        let batch = Arc::new(self.decorate(logs));

        let mut set = JoinSet::new();
        for sink in &self.sinks {
            let sink = Arc::clone(sink);
            let batch = Arc::clone(&batch);
            set.spawn(async move {
                if let Err(e) = sink.send(&batch).await {
                    tracing::error!(sink = sink.name(), error = %e, "sink delivery failed");
                }
            });
        }
        while set.join_next().await.is_some() {}
    }

    /// Closes every sink, reporting the first failure after trying all.
    pub async fn close(&self) -> Result<(), SinkError> {
        let mut first_err = None;
        for sink in &self.sinks {
            if let Err(e) = sink.close().await {
                tracing::error!(sink = sink.name(), error = %e, "sink close failed");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl LogHandler for Dispatcher {
    async fn handle(&self, logs: Vec<Log>) -> Result<(), BoxError> {
        self.dispatch(logs).await;
        Ok(())
    }
}
