//! chainwatch is a cursor-driven EVM event scanner.
//!
//! The scanner advances a cursor through finalized blocks, fetches matching
//! event logs through a scored multi-endpoint [`NodePool`], optionally
//! decodes them against event ABIs, and fans the batches out to the
//! configured [`sink`]s while persisting progress in a [`cursor`] store so
//! a restart resumes where it left off.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use chainwatch::{
//!     Filter, NodeConfig, NodePool, ScanConfig, Scanner,
//!     cursor::MemoryStore,
//!     sink::{ConsoleSink, Dispatcher},
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = Arc::new(NodePool::connect(&[NodeConfig {
//!     url: "https://rpc.example.org".to_string(),
//!     priority: 10,
//!     rate_limit: 50,
//!     max_concurrent: 8,
//! }])?);
//!
//! let config = ScanConfig { chain_id: "eth-mainnet".to_string(), reorg_safe: 12, ..Default::default() };
//! let mut scanner = Scanner::new(pool, Arc::new(MemoryStore::new("")), config, Filter::new());
//! scanner.set_handler(Arc::new(Dispatcher::new(vec![Arc::new(ConsoleSink::new())])));
//!
//! let shutdown = CancellationToken::new();
//! scanner.run(shutdown).await?;
//! # Ok(())
//! # }
//! ```

pub mod chain;
pub mod client;
pub mod config;
pub mod cursor;
pub mod decoder;
pub mod filter;
pub mod node_pool;
pub mod scanner;
pub mod sink;
pub mod webhook;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

mod error;

pub use error::{BoxError, ScannerError};

pub use filter::Filter;
pub use node_pool::{Node, NodeConfig, NodePool};
pub use scanner::{LogHandler, ScanConfig, Scanner};
