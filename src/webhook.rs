//! HTTP delivery of raw log batches with HMAC signing and bounded
//! exponential retry.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use backon::{ExponentialBuilder, Retryable};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;

use alloy::rpc::types::Log;

use crate::sink::SinkError;

/// Signature header attached when a secret is configured.
pub const SIGNATURE_HEADER: &str = "X-Scanner-Signature";

const USER_AGENT: &str = concat!("chainwatch/", env!("CARGO_PKG_VERSION"));

/// Per-request timeout, independent of the retry budget.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const DEFAULT_MAX_ATTEMPTS: usize = 1;
const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub url: String,

    /// HMAC-SHA256 key for the [`SIGNATURE_HEADER`] header. Empty disables
    /// signing.
    pub secret: String,

    /// Total attempts per batch, first try included. `0` means 1.
    pub max_attempts: usize,

    /// Wait before the second attempt; doubles per failure afterwards.
    pub initial_backoff: Duration,

    /// Backoff ceiling.
    pub max_backoff: Duration,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            secret: String::new(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }
}

#[derive(Serialize)]
struct Payload<'a> {
    timestamp: u64,
    logs: &'a [Log],
}

/// Posts JSON log batches to one endpoint. Any 2xx response is an ack;
/// everything else, transport errors included, counts as a failed
/// attempt and is retried up to `max_attempts`.
pub struct WebhookClient {
    config: WebhookConfig,
    http: reqwest::Client,
}

impl WebhookClient {
    /// # Errors
    ///
    /// [`SinkError::Http`] if the underlying HTTP client cannot be built.
    pub fn new(mut config: WebhookConfig) -> Result<Self, SinkError> {
        if config.max_attempts == 0 {
            config.max_attempts = DEFAULT_MAX_ATTEMPTS;
        }
        if config.initial_backoff.is_zero() {
            config.initial_backoff = DEFAULT_INITIAL_BACKOFF;
        }
        if config.max_backoff.is_zero() {
            config.max_backoff = DEFAULT_MAX_BACKOFF;
        }

        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { config, http })
    }

    pub fn config(&self) -> &WebhookConfig {
        &self.config
    }

    /// Delivers one batch, retrying with exponential backoff.
    ///
    /// Empty batches are acknowledged locally without a request.
    pub async fn send(&self, logs: &[Log]) -> Result<(), SinkError> {
        if logs.is_empty() {
            return Ok(());
        }

        let timestamp =
            SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
        let body = serde_json::to_vec(&Payload { timestamp, logs })?;

        let backoff = ExponentialBuilder::default()
            .with_min_delay(self.config.initial_backoff)
            .with_max_delay(self.config.max_backoff)
            .with_max_times(self.config.max_attempts - 1);

        (|| async { self.attempt(&body).await })
            .retry(backoff)
            .sleep(tokio::time::sleep)
            .notify(|err: &SinkError, delay: Duration| {
                tracing::warn!(error = %err, ?delay, "webhook attempt failed, backing off");
            })
            .await
            .map_err(|err| SinkError::RetriesExhausted {
                attempts: self.config.max_attempts,
                source: Box::new(err),
            })
    }

    async fn attempt(&self, body: &[u8]) -> Result<(), SinkError> {
        let mut request = self
            .http
            .post(&self.config.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .body(body.to_vec());

        if !self.config.secret.is_empty() {
            request = request.header(SIGNATURE_HEADER, self.sign(body));
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SinkError::Status(status.as_u16()));
        }
        Ok(())
    }

    fn sign(&self, body: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.config.secret.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }
}
