//! A single RPC endpoint with health tracking and admission control.
//!
//! Every call proxied through a [`Node`] feeds its latency average and error
//! streak, which in turn drive [`Node::score`] and the circuit breaker.
//! Admission (rate limit + concurrency cap) is enforced here; retry and
//! failover live in [`NodePool`](super::NodePool).

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU64, Ordering},
};
use std::time::Duration;

use serde::Deserialize;
use tokio::{
    sync::Semaphore,
    time::{Instant, sleep},
};

use alloy::{
    primitives::{Address, Bytes},
    rpc::types::{Block, Filter, Header, Log},
};

use crate::{ScannerError, client::RpcClient};

/// Consecutive errors required to open the circuit breaker.
const CIRCUIT_BREAK_THRESHOLD: u64 = 5;

/// How long an open breaker keeps the node out of service.
const CIRCUIT_BREAK_COOLDOWN: Duration = Duration::from_secs(30);

/// Score returned for nodes lagging more than 100 blocks behind the pool.
const SEVERE_LAG_SCORE: i64 = -10_000;

/// Static configuration for one RPC endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    pub url: String,

    /// Selection weight in `1..=100`; higher is preferred.
    #[serde(default = "default_priority")]
    pub priority: u32,

    /// Requests per second this endpoint tolerates. `0` means unlimited.
    #[serde(default)]
    pub rate_limit: u32,

    /// Maximum in-flight requests. `0` means unlimited.
    #[serde(default)]
    pub max_concurrent: u32,
}

fn default_priority() -> u32 {
    1
}

#[derive(Default)]
struct Metrics {
    /// Exponentially weighted latency average in milliseconds. New samples
    /// weigh 20%; the first sample replaces the initial zero.
    latency_ms: i64,
    consecutive_errors: u64,
    total_errors: u64,
}

#[derive(Default)]
struct Breaker {
    open: bool,
    last_error_at: Option<Instant>,
}

/// Classic token bucket: capacity equals the configured rate, refilled at
/// `rate` tokens per second with fractional carry-over.
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate: u32) -> Self {
        Self {
            capacity: f64::from(rate),
            tokens: f64::from(rate),
            refill_per_sec: f64::from(rate),
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    fn try_take(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Takes a token, or returns how long until one becomes available.
    fn take_or_delay(&mut self) -> Option<Duration> {
        if self.try_take() {
            return None;
        }
        Some(Duration::from_secs_f64((1.0 - self.tokens) / self.refill_per_sec))
    }
}

/// Runtime state for one RPC endpoint.
pub struct Node {
    config: NodeConfig,
    client: Arc<dyn RpcClient>,

    metrics: Mutex<Metrics>,
    observed_height: AtomicU64,

    // Kept apart from `metrics` so breaker reads don't contend with the
    // per-call latency updates.
    breaker: Mutex<Breaker>,

    bucket: Option<Mutex<TokenBucket>>,
    semaphore: Option<Semaphore>,
}

impl Node {
    pub fn new(config: NodeConfig, client: Arc<dyn RpcClient>) -> Self {
        let bucket = (config.rate_limit > 0).then(|| Mutex::new(TokenBucket::new(config.rate_limit)));
        let semaphore =
            (config.max_concurrent > 0).then(|| Semaphore::new(config.max_concurrent as usize));
        Self {
            config,
            client,
            metrics: Mutex::new(Metrics::default()),
            observed_height: AtomicU64::new(0),
            breaker: Mutex::new(Breaker::default()),
            bucket,
            semaphore,
        }
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    pub fn priority(&self) -> u32 {
        self.config.priority
    }

    /// Real-time selection score; higher is better.
    ///
    /// `priority * 100 - latency_ms / 10 - consecutive_errors * 500`, with an
    /// additional penalty the further this node's observed height lags behind
    /// `global_max`. Nodes more than 100 blocks behind are effectively
    /// disqualified.
    pub fn score(&self, global_max: u64) -> i64 {
        let (latency_ms, consecutive_errors) = {
            let metrics = self.metrics.lock().expect("metrics lock poisoned");
            (metrics.latency_ms, metrics.consecutive_errors)
        };

        let mut score = i64::from(self.config.priority) * 100;
        score -= latency_ms / 10;
        score -= consecutive_errors as i64 * 500;

        let observed = self.observed_height.load(Ordering::Relaxed);
        if global_max > 0 && observed < global_max {
            let lag = (global_max - observed) as i64;
            if lag > 100 {
                return SEVERE_LAG_SCORE;
            } else if lag > 20 {
                score -= lag * 200;
            } else if lag > 5 {
                score -= lag * 100;
            } else {
                score -= lag * 20;
            }
        }

        score
    }

    /// Folds the outcome of one proxied call into the node's health state.
    ///
    /// Errors bump the streak and may trip the breaker; a success walks the
    /// streak back by one and closes the breaker once it reaches zero.
    pub fn record_metric(&self, started: Instant, failed: bool) {
        let sample = started.elapsed().as_millis() as i64;

        let streak = {
            let mut metrics = self.metrics.lock().expect("metrics lock poisoned");
            if metrics.latency_ms == 0 {
                metrics.latency_ms = sample;
            } else {
                metrics.latency_ms = (metrics.latency_ms * 8 + sample * 2) / 10;
            }

            if failed {
                metrics.consecutive_errors += 1;
                metrics.total_errors += 1;
            } else {
                metrics.consecutive_errors = metrics.consecutive_errors.saturating_sub(1);
            }
            metrics.consecutive_errors
        };

        if failed {
            let mut breaker = self.breaker.lock().expect("breaker lock poisoned");
            breaker.last_error_at = Some(Instant::now());
            if streak >= CIRCUIT_BREAK_THRESHOLD && !breaker.open {
                breaker.open = true;
                tracing::warn!(url = %self.config.url, streak, "circuit breaker opened");
            }
        } else if streak == 0 {
            let mut breaker = self.breaker.lock().expect("breaker lock poisoned");
            if breaker.open {
                breaker.open = false;
                tracing::info!(url = %self.config.url, "circuit breaker closed");
            }
        }
    }

    /// Raises the observed chain height; never lowers it.
    pub fn update_height(&self, height: u64) {
        self.observed_height.fetch_max(height, Ordering::Relaxed);
    }

    pub fn observed_height(&self) -> u64 {
        self.observed_height.load(Ordering::Relaxed)
    }

    pub fn meets_height(&self, required: u64) -> bool {
        self.observed_height() >= required
    }

    pub fn consecutive_errors(&self) -> u64 {
        self.metrics.lock().expect("metrics lock poisoned").consecutive_errors
    }

    pub fn total_errors(&self) -> u64 {
        self.metrics.lock().expect("metrics lock poisoned").total_errors
    }

    pub fn avg_latency_ms(&self) -> i64 {
        self.metrics.lock().expect("metrics lock poisoned").latency_ms
    }

    /// Whether the breaker currently keeps this node out of service.
    ///
    /// An open breaker is considered closed again once the cooldown has
    /// elapsed since the last recorded error.
    pub fn is_circuit_open(&self) -> bool {
        let breaker = self.breaker.lock().expect("breaker lock poisoned");
        if !breaker.open {
            return false;
        }
        match breaker.last_error_at {
            Some(at) => at.elapsed() <= CIRCUIT_BREAK_COOLDOWN,
            None => false,
        }
    }

    /// Non-blocking admission check, in order: circuit breaker, rate limit,
    /// concurrency cap.
    ///
    /// The rate token is spent before the semaphore attempt, so a [`Busy`]
    /// rejection has still consumed one token. Callers that get `Ok` must
    /// pair this with [`Node::release`].
    ///
    /// [`Busy`]: ScannerError::Busy
    ///
    /// # Errors
    ///
    /// * [`ScannerError::CircuitOpen`] - the breaker is open.
    /// * [`ScannerError::RateLimited`] - the token bucket is empty.
    /// * [`ScannerError::Busy`] - all concurrency permits are in use.
    pub fn try_acquire(&self) -> Result<(), ScannerError> {
        if self.is_circuit_open() {
            return Err(ScannerError::CircuitOpen);
        }

        if let Some(bucket) = &self.bucket
            && !bucket.lock().expect("token bucket lock poisoned").try_take()
        {
            return Err(ScannerError::RateLimited);
        }

        if let Some(semaphore) = &self.semaphore {
            match semaphore.try_acquire() {
                Ok(permit) => permit.forget(),
                Err(_) => return Err(ScannerError::Busy),
            }
        }

        Ok(())
    }

    /// Blocking admission: waits for a rate token, then for a concurrency
    /// permit. Cancel by dropping the future (or racing it against a
    /// shutdown token, as the pool does).
    pub async fn wait_acquire(&self) -> Result<(), ScannerError> {
        if let Some(bucket) = &self.bucket {
            loop {
                let delay =
                    bucket.lock().expect("token bucket lock poisoned").take_or_delay();
                match delay {
                    None => break,
                    Some(delay) => sleep(delay).await,
                }
            }
        }

        if let Some(semaphore) = &self.semaphore {
            let permit = semaphore.acquire().await.map_err(|_| ScannerError::Cancelled)?;
            permit.forget();
        }

        Ok(())
    }

    /// Returns the concurrency permit taken by an acquire. No-op when no
    /// concurrency cap is configured.
    pub fn release(&self) {
        if let Some(semaphore) = &self.semaphore {
            semaphore.add_permits(1);
        }
    }

    /// In-flight request count, as far as the concurrency cap can tell.
    pub fn current_concurrency(&self) -> usize {
        match &self.semaphore {
            Some(semaphore) => {
                self.config.max_concurrent as usize - semaphore.available_permits()
            }
            None => 0,
        }
    }

    // Proxied RPC calls. Each one feeds the health metrics; none of them
    // retries. Failover is the pool's job.

    pub async fn block_number(&self) -> Result<u64, ScannerError> {
        let started = Instant::now();
        let result = self.client.block_number().await;
        self.record_metric(started, result.is_err());
        if let Ok(height) = &result {
            self.update_height(*height);
        }
        result
    }

    pub async fn chain_id(&self) -> Result<u64, ScannerError> {
        let started = Instant::now();
        let result = self.client.chain_id().await;
        self.record_metric(started, result.is_err());
        result
    }

    pub async fn header_by_number(&self, number: u64) -> Result<Header, ScannerError> {
        let started = Instant::now();
        let result = self.client.header_by_number(number).await;
        self.record_metric(started, result.is_err());
        result
    }

    pub async fn block_by_number(&self, number: u64) -> Result<Block, ScannerError> {
        let started = Instant::now();
        let result = self.client.block_by_number(number).await;
        self.record_metric(started, result.is_err());
        result
    }

    pub async fn filter_logs(&self, query: &Filter) -> Result<Vec<Log>, ScannerError> {
        let started = Instant::now();
        let result = self.client.filter_logs(query).await;
        self.record_metric(started, result.is_err());
        result
    }

    pub async fn code_at(&self, address: Address, number: u64) -> Result<Bytes, ScannerError> {
        let started = Instant::now();
        let result = self.client.code_at(address, number).await;
        self.record_metric(started, result.is_err());
        result
    }

    #[cfg(test)]
    pub(crate) fn backdate_last_error(&self, by: Duration) {
        let mut breaker = self.breaker.lock().expect("breaker lock poisoned");
        breaker.last_error_at = Some(Instant::now() - by);
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("url", &self.config.url)
            .field("priority", &self.config.priority)
            .field("observed_height", &self.observed_height())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockRpcClient;

    fn node(config: NodeConfig) -> Node {
        Node::new(config, Arc::new(MockRpcClient::new(100)))
    }

    fn config(priority: u32, rate_limit: u32, max_concurrent: u32) -> NodeConfig {
        NodeConfig {
            url: "http://node.test".to_string(),
            priority,
            rate_limit,
            max_concurrent,
        }
    }

    #[test]
    fn score_uses_priority() {
        let node = node(config(10, 0, 0));
        assert_eq!(node.score(0), 1000);
    }

    #[test]
    fn score_decreases_with_consecutive_errors() {
        let node = node(config(10, 0, 0));

        let mut previous = node.score(0);
        for _ in 0..3 {
            node.metrics.lock().unwrap().consecutive_errors += 1;
            let current = node.score(0);
            assert!(current < previous);
            previous = current;
        }
    }

    #[test]
    fn score_decreases_with_lag() {
        let node = node(config(10, 0, 0));
        node.update_height(1000);

        // lag 0, 3 (light), 10 (medium), 50 (heavy)
        let s0 = node.score(1000);
        let s3 = node.score(1003);
        let s10 = node.score(1010);
        let s50 = node.score(1050);
        assert!(s0 > s3);
        assert!(s3 > s10);
        assert!(s10 > s50);
        assert_eq!(s3, 1000 - 3 * 20);
        assert_eq!(s10, 1000 - 10 * 100);
        assert_eq!(s50, 1000 - 50 * 200);
    }

    #[test]
    fn score_lag_penalty_boundaries() {
        let node = node(config(10, 0, 0));
        node.update_height(1000);

        // 5 is still light, 20 still medium, 100 still heavy, 101 disqualifies.
        assert_eq!(node.score(1005), 1000 - 5 * 20);
        assert_eq!(node.score(1020), 1000 - 20 * 100);
        assert_eq!(node.score(1100), 1000 - 100 * 200);
        assert_eq!(node.score(1101), -10_000);
    }

    #[test]
    fn score_disqualifies_severe_lag() {
        let node = node(config(100, 0, 0));
        node.update_height(0);
        assert_eq!(node.score(101), -10_000);
    }

    #[tokio::test(start_paused = true)]
    async fn latency_ewma_first_sample_replaces_zero() {
        let node = node(config(1, 0, 0));

        let started = Instant::now();
        tokio::time::advance(Duration::from_millis(50)).await;
        node.record_metric(started, false);
        assert_eq!(node.avg_latency_ms(), 50);

        let started = Instant::now();
        tokio::time::advance(Duration::from_millis(100)).await;
        node.record_metric(started, false);
        // 50 * 0.8 + 100 * 0.2
        assert_eq!(node.avg_latency_ms(), 60);
    }

    #[test]
    fn height_is_monotonic() {
        let node = node(config(1, 0, 0));
        node.update_height(10);
        node.update_height(5);
        assert_eq!(node.observed_height(), 10);
        assert!(node.meets_height(10));
        assert!(!node.meets_height(11));
    }

    #[tokio::test]
    async fn breaker_opens_on_fifth_consecutive_error() {
        let node = node(config(1, 0, 0));

        for i in 1..=4 {
            node.record_metric(Instant::now(), true);
            assert_eq!(node.consecutive_errors(), i);
            assert!(!node.is_circuit_open(), "breaker open after {i} errors");
        }

        node.record_metric(Instant::now(), true);
        assert!(node.is_circuit_open());
        assert!(matches!(node.try_acquire(), Err(ScannerError::CircuitOpen)));
        assert_eq!(node.total_errors(), 5);
    }

    #[tokio::test]
    async fn breaker_closes_after_cooldown() {
        let node = node(config(1, 0, 0));
        for _ in 0..5 {
            node.record_metric(Instant::now(), true);
        }
        assert!(node.is_circuit_open());

        node.backdate_last_error(Duration::from_secs(31));
        assert!(!node.is_circuit_open());
        assert!(node.try_acquire().is_ok());
    }

    #[tokio::test]
    async fn breaker_closes_when_streak_decays() {
        let node = node(config(1, 0, 0));
        for _ in 0..5 {
            node.record_metric(Instant::now(), true);
        }
        assert!(node.is_circuit_open());

        for _ in 0..5 {
            node.record_metric(Instant::now(), false);
        }
        assert_eq!(node.consecutive_errors(), 0);
        assert!(!node.is_circuit_open());
    }

    #[tokio::test]
    async fn try_acquire_rate_limits() {
        let node = node(config(1, 2, 0));

        assert!(node.try_acquire().is_ok());
        assert!(node.try_acquire().is_ok());
        assert!(matches!(node.try_acquire(), Err(ScannerError::RateLimited)));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_tokens_refill_over_time() {
        let node = node(config(1, 1, 0));

        assert!(node.try_acquire().is_ok());
        assert!(matches!(node.try_acquire(), Err(ScannerError::RateLimited)));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(node.try_acquire().is_ok());
    }

    #[tokio::test]
    async fn try_acquire_reports_busy_and_release_frees() {
        let node = node(config(1, 0, 1));

        assert!(node.try_acquire().is_ok());
        assert_eq!(node.current_concurrency(), 1);
        assert!(matches!(node.try_acquire(), Err(ScannerError::Busy)));

        node.release();
        assert_eq!(node.current_concurrency(), 0);
        assert!(node.try_acquire().is_ok());
    }

    #[tokio::test]
    async fn release_without_limits_is_noop() {
        let node = node(config(1, 0, 0));
        assert!(node.try_acquire().is_ok());
        node.release();
        node.release();
        assert_eq!(node.current_concurrency(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_acquire_waits_for_token() {
        let node = node(config(1, 1, 0));
        assert!(node.try_acquire().is_ok());

        let acquire = node.wait_acquire();
        tokio::pin!(acquire);

        // Not ready until the bucket refills.
        assert!(
            tokio::time::timeout(Duration::from_millis(10), &mut acquire).await.is_err()
        );
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(acquire.await.is_ok());
    }

    #[tokio::test]
    async fn proxy_calls_update_metrics_and_height() {
        let client = Arc::new(MockRpcClient::new(42));
        let node = Node::new(config(1, 0, 0), client.clone());

        let height = node.block_number().await.unwrap();
        assert_eq!(height, 42);
        assert_eq!(node.observed_height(), 42);

        client.fail_block_number(true);
        assert!(node.block_number().await.is_err());
        assert_eq!(node.total_errors(), 1);
        assert_eq!(node.consecutive_errors(), 1);
    }
}
