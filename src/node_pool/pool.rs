//! Scored multi-endpoint pool with bounded cross-node failover.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use alloy::{
    primitives::{Address, Bytes},
    rpc::types::{Block, Filter, Header, Log},
};

use crate::{
    ScannerError,
    client::AlloyClient,
    node_pool::{Node, NodeConfig},
};

/// How often the background task refreshes every node's observed height.
const HEIGHT_SYNC_INTERVAL: Duration = Duration::from_secs(5);

/// Cap on cross-node attempts per operation. Scoring plus the circuit
/// breaker shift load off bad nodes within a few attempts; unbounded retry
/// amplifies incidents instead of containing them.
const MAX_ATTEMPTS: usize = 3;

/// Owns a set of [`Node`]s and routes every RPC operation to the currently
/// best-scored endpoint, failing over across nodes on error.
///
/// A background task refreshes each node's observed height every
/// [`HEIGHT_SYNC_INTERVAL`] and keeps the pool-wide maximum for both lag
/// scoring and the [`NodePool::block_number`] fast path. The task exits when
/// the pool is dropped or [`NodePool::close`] is called.
pub struct NodePool {
    nodes: Vec<Arc<Node>>,
    global_max: Arc<AtomicU64>,
    shutdown: CancellationToken,
}

impl NodePool {
    /// Builds a pool over pre-constructed nodes and starts the height sync
    /// task. Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// [`ScannerError::NoAvailableNodes`] if `nodes` is empty.
    pub fn new(nodes: Vec<Node>) -> Result<Self, ScannerError> {
        if nodes.is_empty() {
            return Err(ScannerError::NoAvailableNodes);
        }

        let nodes: Vec<Arc<Node>> = nodes.into_iter().map(Arc::new).collect();
        let global_max = Arc::new(AtomicU64::new(0));
        let shutdown = CancellationToken::new();

        spawn_height_sync(nodes.clone(), global_max.clone(), shutdown.clone());

        Ok(Self { nodes, global_max, shutdown })
    }

    /// Dials every configured endpoint over HTTP and builds a pool from the
    /// ones that parse. Endpoints with invalid URLs are skipped with a
    /// warning; the pool only fails when none remain.
    pub fn connect(configs: &[NodeConfig]) -> Result<Self, ScannerError> {
        let mut nodes = Vec::with_capacity(configs.len());
        for config in configs {
            match AlloyClient::connect(&config.url) {
                Ok(client) => nodes.push(Node::new(config.clone(), Arc::new(client))),
                Err(e) => {
                    tracing::warn!(url = %config.url, error = %e, "skipping unusable endpoint");
                }
            }
        }
        Self::new(nodes)
    }

    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    /// Pool-wide maximum observed height, `0` until the first sync lands.
    pub fn global_max(&self) -> u64 {
        self.global_max.load(Ordering::Relaxed)
    }

    /// Stops the background height sync. Also happens on drop.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    /// Picks the best node that admits a request right now.
    ///
    /// Nodes are tried in descending score order (ties keep insertion
    /// order); nodes below `min_height` are skipped. If nobody admits
    /// non-blocking, the best non-broken candidate is awaited via
    /// [`Node::wait_acquire`]. The returned node has been acquired; the
    /// caller must [`Node::release`] it.
    ///
    /// # Errors
    ///
    /// * [`ScannerError::NoNodeMeetsHeight`] - no node has reached `min_height`.
    /// * [`ScannerError::NoAvailableNodes`] - every candidate's breaker is open.
    /// * [`ScannerError::Cancelled`] - the pool shut down while waiting.
    pub async fn pick_available(&self, min_height: u64) -> Result<Arc<Node>, ScannerError> {
        let global_max = self.global_max();

        let mut candidates: Vec<&Arc<Node>> = self.nodes.iter().collect();
        candidates.sort_by_key(|node| std::cmp::Reverse(node.score(global_max)));

        for node in &candidates {
            if min_height > 0 && !node.meets_height(min_height) {
                continue;
            }
            if node.try_acquire().is_ok() {
                return Ok(Arc::clone(node));
            }
        }

        // Nothing admitted non-blocking; queue on the best viable candidate.
        let eligible: Vec<&Arc<Node>> = candidates
            .into_iter()
            .filter(|node| min_height == 0 || node.meets_height(min_height))
            .collect();
        if eligible.is_empty() {
            return Err(ScannerError::NoNodeMeetsHeight(min_height));
        }

        let Some(best) = eligible.into_iter().find(|node| !node.is_circuit_open()) else {
            return Err(ScannerError::NoAvailableNodes);
        };

        tokio::select! {
            _ = self.shutdown.cancelled() => Err(ScannerError::Cancelled),
            result = best.wait_acquire() => {
                result?;
                Ok(Arc::clone(best))
            }
        }
    }

    /// Runs `op` against the pool with failover: up to
    /// `min(node_count, 3)` attempts, each on the currently best available
    /// node. Cancellation and timeouts short-circuit; other errors move on
    /// to the next attempt and the last one is returned on exhaustion.
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T, ScannerError>
    where
        F: Fn(Arc<Node>) -> Fut,
        Fut: Future<Output = Result<T, ScannerError>>,
    {
        let attempts = self.nodes.len().min(MAX_ATTEMPTS);
        let mut last_err = None;

        for attempt in 1..=attempts {
            let node = self.pick_available(0).await?;
            let result = op(Arc::clone(&node)).await;
            node.release();

            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_terminal() => return Err(e),
                Err(e) => {
                    tracing::debug!(
                        url = %node.url(),
                        attempt,
                        error = %e,
                        "node attempt failed, failing over"
                    );
                    // The failed call already dented the node's score, so the
                    // next pick naturally prefers a different node.
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or(ScannerError::NoAvailableNodes))
    }

    /// Latest chain height. Served from the synced pool-wide maximum when
    /// available, falling back to one RPC round-trip before the first sync.
    pub async fn block_number(&self) -> Result<u64, ScannerError> {
        let cached = self.global_max();
        if cached > 0 {
            return Ok(cached);
        }
        self.execute(|node| async move { node.block_number().await }).await
    }

    pub async fn chain_id(&self) -> Result<u64, ScannerError> {
        self.execute(|node| async move { node.chain_id().await }).await
    }

    pub async fn header_by_number(&self, number: u64) -> Result<Header, ScannerError> {
        self.execute(|node| async move { node.header_by_number(number).await }).await
    }

    pub async fn block_by_number(&self, number: u64) -> Result<Block, ScannerError> {
        self.execute(|node| async move { node.block_by_number(number).await }).await
    }

    pub async fn filter_logs(&self, query: &Filter) -> Result<Vec<Log>, ScannerError> {
        self.execute(|node| {
            let query = query.clone();
            async move { node.filter_logs(&query).await }
        })
        .await
    }

    pub async fn code_at(&self, address: Address, number: u64) -> Result<Bytes, ScannerError> {
        self.execute(|node| async move { node.code_at(address, number).await }).await
    }
}

impl Drop for NodePool {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Periodically polls `blockNumber` on every node, bypassing rate and
/// concurrency limits: maintenance traffic must not starve, and must keep
/// flowing even when a breaker is open so recovery is observable.
fn spawn_height_sync(
    nodes: Vec<Arc<Node>>,
    global_max: Arc<AtomicU64>,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HEIGHT_SYNC_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let mut set = JoinSet::new();
            for node in &nodes {
                let node = Arc::clone(node);
                set.spawn(async move { node.block_number().await.ok() });
            }

            let mut max = 0u64;
            while let Some(joined) = set.join_next().await {
                if let Ok(Some(height)) = joined {
                    max = max.max(height);
                }
            }

            if max > 0 {
                global_max.store(max, Ordering::Relaxed);
            }
        }
        tracing::debug!("height sync task stopped");
    });
}
