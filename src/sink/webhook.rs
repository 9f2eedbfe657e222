//! Webhook output in two flavors: synchronous delivery on the caller's
//! task, or a bounded queue drained by a fixed worker fleet.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use alloy::rpc::types::Log;

use crate::{
    sink::{DecodedLog, Sink, SinkError},
    webhook::WebhookClient,
};

/// Default capacity of the buffered intake channel.
pub const DEFAULT_BUFFER_SIZE: usize = 1000;

/// Default number of delivery workers in buffered mode.
pub const DEFAULT_WORKERS: usize = 1;

struct Intake {
    closed: bool,
    sender: Option<mpsc::Sender<Vec<Log>>>,
    workers: Vec<JoinHandle<()>>,
}

/// Sink wrapper around [`WebhookClient`].
///
/// In buffered mode `send` only enqueues, so the remote endpoint's latency
/// never reaches the scan loop, and worker delivery errors are logged
/// instead of returned. With more than one worker, delivery order to the remote
/// endpoint is not guaranteed; use a single worker where order matters.
pub struct WebhookSink {
    client: Arc<WebhookClient>,
    intake: Option<Mutex<Intake>>,
}

impl WebhookSink {
    /// Synchronous mode: `send` performs the HTTP delivery inline,
    /// including its retry budget.
    pub fn new(client: WebhookClient) -> Self {
        Self { client: Arc::new(client), intake: None }
    }

    /// Buffered mode: spawns `workers` consumers draining a channel of
    /// capacity `buffer_size`. Zero values fall back to the defaults.
    /// Must be called from within a tokio runtime.
    pub fn buffered(client: WebhookClient, buffer_size: usize, workers: usize) -> Self {
        let buffer_size = if buffer_size == 0 { DEFAULT_BUFFER_SIZE } else { buffer_size };
        let workers = if workers == 0 { DEFAULT_WORKERS } else { workers };

        let client = Arc::new(client);
        let (sender, receiver) = mpsc::channel::<Vec<Log>>(buffer_size);
        let receiver = Arc::new(Mutex::new(receiver));

        let handles = (0..workers)
            .map(|worker| {
                let client = Arc::clone(&client);
                let receiver = Arc::clone(&receiver);
                tokio::spawn(async move {
                    loop {
                        // Lock only around the dequeue so workers drain in
                        // parallel.
                        let batch = receiver.lock().await.recv().await;
                        let Some(batch) = batch else { break };
                        if let Err(e) = client.send(&batch).await {
                            tracing::error!(worker, error = %e, "buffered webhook delivery failed");
                        }
                    }
                    tracing::debug!(worker, "webhook worker drained");
                })
            })
            .collect();

        Self {
            client,
            intake: Some(Mutex::new(Intake { closed: false, sender: Some(sender), workers: handles })),
        }
    }
}

#[async_trait]
impl Sink for WebhookSink {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, logs: &[DecodedLog]) -> Result<(), SinkError> {
        let raw: Vec<Log> = logs.iter().map(|entry| entry.log.clone()).collect();

        let Some(intake) = &self.intake else {
            return self.client.send(&raw).await;
        };

        let sender = {
            let intake = intake.lock().await;
            if intake.closed {
                return Err(SinkError::Closed);
            }
            intake.sender.as_ref().expect("sender present until closed").clone()
        };

        sender.send(raw).await.map_err(|_| SinkError::Closed)
    }

    async fn close(&self) -> Result<(), SinkError> {
        let Some(intake) = &self.intake else {
            return Ok(());
        };

        let workers = {
            let mut intake = intake.lock().await;
            if intake.closed {
                return Ok(());
            }
            intake.closed = true;
            // Dropping the sender closes the channel; workers exit once
            // they have drained what was already queued.
            intake.sender = None;
            std::mem::take(&mut intake.workers)
        };

        for handle in workers {
            let _ = handle.await;
        }
        Ok(())
    }
}
