//! Decode matched logs against a JSON ABI inside a custom handler instead
//! of going through the sink dispatcher.
//!
//! ```sh
//! cargo run --example decode_transfers -- https://your-rpc-endpoint
//! ```

use std::sync::Arc;

use alloy::{primitives::address, rpc::types::Log};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use chainwatch::{
    BoxError, Filter, LogHandler, NodeConfig, NodePool, ScanConfig, Scanner,
    cursor::MemoryStore,
    decoder::EventDecoder,
};

const ERC20_ABI: &str = r#"[
    {
        "type": "event",
        "name": "Transfer",
        "inputs": [
            {"name": "from", "type": "address", "indexed": true},
            {"name": "to", "type": "address", "indexed": true},
            {"name": "value", "type": "uint256", "indexed": false}
        ],
        "anonymous": false
    }
]"#;

struct PrintDecoded {
    decoder: EventDecoder,
}

#[async_trait]
impl LogHandler for PrintDecoded {
    async fn handle(&self, logs: Vec<Log>) -> Result<(), BoxError> {
        for log in &logs {
            match self.decoder.decode(log) {
                Ok(event) => println!(
                    "block {} {}: {}",
                    log.block_number.unwrap_or_default(),
                    event.name,
                    serde_json::to_string(&event.params)?
                ),
                Err(e) => eprintln!("undecodable log: {e}"),
            }
        }
        Ok(())
    }
}

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

    let config = ScanConfig {
        chain_id: "decode-demo".to_string(),
        start_rewind: 20,
        reorg_safe: 12,
        ..Default::default()
    };
    let filter =
        Filter::new().contract(address!("a0b86991c6218b36c1d19d4a2e9eb0ce3606eb48"));

    let mut scanner =
        Scanner::new(pool, Arc::new(MemoryStore::new("demo:")), config, filter);
    scanner.set_handler(Arc::new(PrintDecoded {
        decoder: EventDecoder::from_json(ERC20_ABI)?,
    }));

    let shutdown = CancellationToken::new();
    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        ctrl_c.cancel();
    });

    scanner.run(shutdown).await?;
    Ok(())
}
