//! Scan USDC Transfer events on mainnet and deliver each batch to the
//! console and a JSON-lines file at the same time.
//!
//! ```sh
//! cargo run --example multi_sink -- https://your-rpc-endpoint
//! ```

use std::sync::Arc;

use alloy::primitives::{address, b256};
use tokio_util::sync::CancellationToken;

use chainwatch::{
    Filter, NodeConfig, NodePool, ScanConfig, Scanner, chain,
    cursor::MemoryStore,
    sink::{ConsoleSink, Dispatcher, FileSink},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let rpc_url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "https://ethereum-rpc.publicnode.com".to_string());

    let pool = Arc::new(NodePool::connect(&[NodeConfig {
        url: rpc_url,
        priority: 10,
        rate_limit: 10,
        max_concurrent: 4,
    }])?);

    let preset = chain::preset("eth-mainnet").expect("built-in preset");
    let config = ScanConfig {
        chain_id: "eth-mainnet".to_string(),
        start_rewind: 20,
        reorg_safe: preset.reorg_safe,
        batch_size: preset.batch_size,
        interval: preset.block_time,
        ..Default::default()
    };

    // ERC-20 Transfer(address,address,uint256) on the USDC contract.
    let filter = Filter::new()
        .contract(address!("a0b86991c6218b36c1d19d4a2e9eb0ce3606eb48"))
        .event_signature(b256!(
            "ddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"
        ));

    let file_sink = FileSink::create("transfers.jsonl").await?;
    let dispatcher =
        Dispatcher::new(vec![Arc::new(ConsoleSink::new()), Arc::new(file_sink)]);

    let mut scanner =
        Scanner::new(pool, Arc::new(MemoryStore::new("demo:")), config, filter);
    scanner.set_handler(Arc::new(dispatcher));

    let shutdown = CancellationToken::new();
    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        ctrl_c.cancel();
    });

    scanner.run(shutdown).await?;
    Ok(())
}
