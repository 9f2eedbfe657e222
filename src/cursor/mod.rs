//! Scan-progress persistence.
//!
//! A cursor is the *next* block to scan for a named task, not the last one
//! scanned. Stores return `0` for unknown tasks: a fresh task simply has
//! no progress yet.

use async_trait::async_trait;
use thiserror::Error;

mod memory;
pub use memory::MemoryStore;

#[cfg(feature = "postgres")]
mod postgres;
#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;

#[cfg(feature = "redis")]
mod redis;
#[cfg(feature = "redis")]
pub use redis::RedisStore;

#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct StoreError(pub String);

impl StoreError {
    pub(crate) fn backend(error: impl std::fmt::Display) -> Self {
        Self(error.to_string())
    }
}

/// Capability set every cursor backend provides.
#[async_trait]
pub trait CursorStore: Send + Sync {
    /// Reads the cursor for `task_key`; `0` when no entry exists.
    async fn load(&self, task_key: &str) -> Result<u64, StoreError>;

    /// Upserts the cursor for `task_key`; the latest write wins.
    async fn save(&self, task_key: &str, height: u64) -> Result<(), StoreError>;

    /// Releases backend resources.
    async fn close(&self) -> Result<(), StoreError>;
}
