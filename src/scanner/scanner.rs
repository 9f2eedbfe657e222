//! The block-cursor scan loop.
//!
//! On every tick the scanner compares its cursor with the reorg-safe head
//! and catches up in batches of at most `batch_size` blocks. Each
//! successfully handled range advances the cursor to `end + 1` and persists
//! it, so a restart resumes where the last range finished (possibly minus
//! `cursor_rewind`, to re-cover blocks a reorg might have rewritten).
//!
//! Failure semantics: a failed range does not advance the cursor; the loop
//! waits a second and retries the same range on the next tick. A failed
//! cursor save is logged and tolerated; the worst case is re-delivery of
//! one batch after a restart, consistent with at-least-once semantics.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use alloy::rpc::types::Log;
use async_trait::async_trait;

use crate::{
    BoxError, ScannerError,
    cursor::CursorStore,
    filter::Filter,
    node_pool::NodePool,
    scanner::ScanConfig,
};

/// Pause before retrying after a failed range.
const RANGE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Receives every non-empty batch of matching logs, in ascending
/// `(block_number, log_index)` order.
///
/// Decoding and fan-out happen behind this seam; see
/// [`Dispatcher`](crate::sink::Dispatcher) for the standard implementation.
/// An error returned here aborts the current range without advancing the
/// cursor; the same range is retried on the next tick.
#[async_trait]
pub trait LogHandler: Send + Sync {
    async fn handle(&self, logs: Vec<Log>) -> Result<(), BoxError>;
}

/// Cursor-driven log scanner for a single chain.
pub struct Scanner {
    pool: Arc<NodePool>,
    store: Arc<dyn CursorStore>,
    config: ScanConfig,
    filter: Filter,
    handler: Option<Arc<dyn LogHandler>>,
}

impl Scanner {
    pub fn new(
        pool: Arc<NodePool>,
        store: Arc<dyn CursorStore>,
        config: ScanConfig,
        filter: Filter,
    ) -> Self {
        Self { pool, store, config: config.normalized(), filter, handler: None }
    }

    /// Installs the handler invoked for every non-empty batch.
    pub fn set_handler(&mut self, handler: Arc<dyn LogHandler>) {
        self.handler = Some(handler);
    }

    /// Resolves the height scanning starts from, in priority order:
    /// forced `start_block`, persisted cursor minus `cursor_rewind`,
    /// configured `start_block`, then head minus `start_rewind`.
    ///
    /// # Errors
    ///
    /// Cursor-store and RPC failures are fatal here: without a trustworthy
    /// start height the scanner must not guess.
    pub async fn start_block(&self) -> Result<u64, ScannerError> {
        if self.config.force_start && self.config.start_block > 0 {
            tracing::info!(block = self.config.start_block, "start strategy: forced");
            return Ok(self.config.start_block);
        }

        let saved = self.store.load(&self.config.chain_id).await?;
        if saved > 0 {
            let start = saved.saturating_sub(self.config.cursor_rewind);
            tracing::info!(
                saved,
                rewind = self.config.cursor_rewind,
                start,
                "start strategy: resume from persisted cursor"
            );
            return Ok(start);
        }

        if self.config.start_block > 0 {
            tracing::info!(block = self.config.start_block, "start strategy: configured start");
            return Ok(self.config.start_block);
        }

        let head = self.pool.block_number().await?;
        let start = head.saturating_sub(self.config.start_rewind);
        tracing::info!(head, rewind = self.config.start_rewind, start, "start strategy: head rewind");
        Ok(start)
    }

    /// Runs the scan loop until `shutdown` fires.
    ///
    /// Blocks the calling task; spawn it to run alongside other work.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), ScannerError> {
        let mut cursor = self.start_block().await?;
        tracing::info!(
            chain_id = %self.config.chain_id,
            start_block = cursor,
            batch_size = self.config.batch_size,
            reorg_safe = self.config.reorg_safe,
            "scanner started"
        );

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(chain_id = %self.config.chain_id, "scanner stopped");
                    return Ok(());
                }
                _ = ticker.tick() => {}
            }

            let head = match self.pool.block_number().await {
                Ok(head) => head,
                Err(e) => {
                    tracing::error!(error = %e, "failed to fetch head, skipping tick");
                    continue;
                }
            };
            let safe_head = head.saturating_sub(self.config.reorg_safe);

            while cursor <= safe_head {
                if shutdown.is_cancelled() {
                    return Ok(());
                }

                let end = (cursor + self.config.batch_size - 1).min(safe_head);
                if let Err(e) = self.scan_range(cursor, end).await {
                    tracing::error!(from = cursor, to = end, error = %e, "scan range failed");
                    // Cursor untouched; next tick retries the same range.
                    tokio::select! {
                        _ = shutdown.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(RANGE_RETRY_DELAY) => {}
                    }
                    break;
                }

                cursor = end + 1;
                if let Err(e) = self.store.save(&self.config.chain_id, cursor).await {
                    // At-least-once: tolerate the miss and keep scanning.
                    tracing::error!(cursor, error = %e, "failed to persist cursor");
                }
            }
        }
    }

    /// Fetches and hands off logs for one inclusive range.
    ///
    /// Single-block ranges may be skipped entirely when the header bloom
    /// proves no match. Ranges wider than one block always hit
    /// `eth_getLogs`: their bloom would be the union of several headers,
    /// which the RPC doesn't expose.
    async fn scan_range(&self, from: u64, to: u64) -> Result<(), ScannerError> {
        let check_bloom = self.config.use_bloom && !self.filter.is_heavy() && from == to;
        if check_bloom {
            let header = self.pool.header_by_number(from).await?;
            if !self.filter.matches_bloom(&header.inner.logs_bloom) {
                tracing::trace!(block = from, "bloom ruled out block, skipping logs call");
                return Ok(());
            }
        }

        let query = self.filter.to_query(from, to).from_block(from).to_block(to);
        let logs = self.pool.filter_logs(&query).await?;
        tracing::debug!(from, to, count = logs.len(), "scanned range");

        if !logs.is_empty()
            && let Some(handler) = &self.handler
        {
            handler.handle(logs).await.map_err(|e| ScannerError::Handler(e.to_string()))?;
        }

        Ok(())
    }
}
