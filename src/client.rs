//! Abstraction over the upstream Ethereum JSON-RPC surface.
//!
//! The pool never talks to a concrete transport directly; it goes through
//! [`RpcClient`] so that tests (and alternative transports) can plug in
//! without touching the selection or scoring logic.

use async_trait::async_trait;

use alloy::{
    primitives::{Address, Bytes},
    providers::{Provider, RootProvider},
    rpc::types::{Block, Filter, Header, Log},
};

use crate::ScannerError;

/// The subset of `eth_*` operations the scanner relies on.
///
/// One implementor wraps one endpoint. Implementations must be safe to call
/// concurrently; the pool enforces per-endpoint concurrency caps above this
/// layer, not inside it.
#[async_trait]
pub trait RpcClient: Send + Sync {
    async fn chain_id(&self) -> Result<u64, ScannerError>;

    async fn block_number(&self) -> Result<u64, ScannerError>;

    async fn header_by_number(&self, number: u64) -> Result<Header, ScannerError>;

    async fn block_by_number(&self, number: u64) -> Result<Block, ScannerError>;

    async fn filter_logs(&self, query: &Filter) -> Result<Vec<Log>, ScannerError>;

    async fn code_at(&self, address: Address, number: u64) -> Result<Bytes, ScannerError>;
}

/// Production [`RpcClient`] backed by an Alloy [`RootProvider`].
#[derive(Clone)]
pub struct AlloyClient {
    provider: RootProvider,
}

impl AlloyClient {
    /// Connects over HTTP to the given endpoint URL.
    pub fn connect(url: &str) -> Result<Self, ScannerError> {
        let parsed = url.parse().map_err(|_| ScannerError::InvalidEndpoint(url.to_string()))?;
        Ok(Self { provider: RootProvider::new_http(parsed) })
    }

    /// Wraps an existing provider.
    pub fn new(provider: RootProvider) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl RpcClient for AlloyClient {
    async fn chain_id(&self) -> Result<u64, ScannerError> {
        Ok(self.provider.get_chain_id().await?)
    }

    async fn block_number(&self) -> Result<u64, ScannerError> {
        Ok(self.provider.get_block_number().await?)
    }

    async fn header_by_number(&self, number: u64) -> Result<Header, ScannerError> {
        let block = self
            .provider
            .get_block_by_number(number.into())
            .await?
            .ok_or(ScannerError::BlockNotFound(number))?;
        Ok(block.header)
    }

    async fn block_by_number(&self, number: u64) -> Result<Block, ScannerError> {
        self.provider
            .get_block_by_number(number.into())
            .await?
            .ok_or(ScannerError::BlockNotFound(number))
    }

    async fn filter_logs(&self, query: &Filter) -> Result<Vec<Log>, ScannerError> {
        Ok(self.provider.get_logs(query).await?)
    }

    async fn code_at(&self, address: Address, number: u64) -> Result<Bytes, ScannerError> {
        Ok(self.provider.get_code_at(address).block_id(number.into()).await?)
    }
}
