use std::sync::Arc;

use alloy::transports::{RpcError, TransportErrorKind};
use thiserror::Error;

use crate::cursor::StoreError;

/// Boxed error type accepted from user-supplied log handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug, Clone)]
pub enum ScannerError {
    #[error("RPC error: {0}")]
    Rpc(Arc<RpcError<TransportErrorKind>>),

    #[error("node circuit breaker is open")]
    CircuitOpen,

    #[error("node rate limit exceeded")]
    RateLimited,

    #[error("node is busy (max concurrent reached)")]
    Busy,

    #[error("no available rpc nodes")]
    NoAvailableNodes,

    #[error("no node has observed block {0}")]
    NoNodeMeetsHeight(u64),

    #[error("block {0} not found")]
    BlockNotFound(u64),

    #[error("invalid endpoint url: {0}")]
    InvalidEndpoint(String),

    #[error("operation timed out")]
    Timeout,

    #[error("operation cancelled")]
    Cancelled,

    #[error("cursor store error: {0}")]
    Store(#[from] StoreError),

    #[error("handler error: {0}")]
    Handler(String),
}

impl ScannerError {
    /// Builds a [`ScannerError::Rpc`] from a plain message.
    ///
    /// Mostly useful for mock clients injecting transport failures.
    pub fn rpc(message: impl std::fmt::Display) -> Self {
        ScannerError::Rpc(Arc::new(TransportErrorKind::custom_str(&message.to_string())))
    }

    /// Whether the error should short-circuit cross-node failover.
    pub(crate) fn is_terminal(&self) -> bool {
        matches!(self, ScannerError::Cancelled | ScannerError::Timeout)
    }
}

impl From<RpcError<TransportErrorKind>> for ScannerError {
    fn from(error: RpcError<TransportErrorKind>) -> Self {
        ScannerError::Rpc(Arc::new(error))
    }
}
