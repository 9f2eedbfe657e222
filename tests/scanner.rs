//! End-to-end scenarios over the mock RPC client: failover, start-block
//! derivation, bloom skipping, cursor persistence, and delivery ordering.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use alloy::primitives::{Address, B256, Bytes, address};

use chainwatch::{
    Filter, NodeConfig, NodePool, ScanConfig, Scanner,
    cursor::{CursorStore, MemoryStore, StoreError},
    sink::{DecodedLog, Dispatcher, Sink, SinkError},
    test_utils::{MockRpcClient, log_at},
};

const FAST_INTERVAL: Duration = Duration::from_millis(10);
const WAIT_BUDGET: Duration = Duration::from_secs(5);

fn node(client: Arc<MockRpcClient>, priority: u32) -> chainwatch::Node {
    chainwatch::Node::new(
        NodeConfig {
            url: format!("http://node-{priority}.test"),
            priority,
            rate_limit: 0,
            max_concurrent: 0,
        },
        client,
    )
}

fn single_node_pool(client: Arc<MockRpcClient>) -> Arc<NodePool> {
    Arc::new(NodePool::new(vec![node(client, 10)]).expect("pool"))
}

fn scan_config(chain_id: &str) -> ScanConfig {
    ScanConfig { chain_id: chain_id.to_string(), interval: FAST_INTERVAL, ..Default::default() }
}

/// Polls `check` until it returns true or the wait budget runs out.
async fn wait_until<F, Fut>(what: &str, check: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT_BUDGET;
    loop {
        if check().await {
            return;
        }
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Cursor store that remembers every save for monotonicity assertions.
struct RecordingStore {
    inner: MemoryStore,
    saves: Mutex<Vec<u64>>,
}

impl RecordingStore {
    fn new() -> Arc<Self> {
        Arc::new(Self { inner: MemoryStore::new(""), saves: Mutex::new(Vec::new()) })
    }
}

#[async_trait]
impl CursorStore for RecordingStore {
    async fn load(&self, task_key: &str) -> Result<u64, StoreError> {
        self.inner.load(task_key).await
    }

    async fn save(&self, task_key: &str, height: u64) -> Result<(), StoreError> {
        self.saves.lock().unwrap().push(height);
        self.inner.save(task_key, height).await
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.inner.close().await
    }
}

/// Sink that records every batch it receives.
struct CollectingSink {
    batches: Mutex<Vec<Vec<DecodedLog>>>,
}

impl CollectingSink {
    fn new() -> Arc<Self> {
        Arc::new(Self { batches: Mutex::new(Vec::new()) })
    }

    fn flattened(&self) -> Vec<(u64, u64)> {
        self.batches
            .lock()
            .unwrap()
            .iter()
            .flatten()
            .map(|entry| (entry.log.block_number.unwrap(), entry.log.log_index.unwrap()))
            .collect()
    }
}

#[async_trait]
impl Sink for CollectingSink {
    fn name(&self) -> &str {
        "collecting"
    }

    async fn send(&self, logs: &[DecodedLog]) -> Result<(), SinkError> {
        self.batches.lock().unwrap().push(logs.to_vec());
        Ok(())
    }

    async fn close(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

#[tokio::test]
async fn failover_serves_height_from_healthy_node() -> Result<()> {
    let broken = Arc::new(MockRpcClient::new(0));
    broken.fail_block_number(true);
    let healthy = Arc::new(MockRpcClient::new(100));

    let pool = NodePool::new(vec![node(broken, 10), node(healthy, 8)])?;

    assert_eq!(pool.block_number().await?, 100);
    assert!(pool.nodes()[0].total_errors() >= 1);
    Ok(())
}

#[tokio::test]
async fn saved_cursor_is_rewound_on_startup() -> Result<()> {
    let client = Arc::new(MockRpcClient::new(1000));
    let store = Arc::new(MemoryStore::new(""));
    store.save("task", 500).await?;

    let config = ScanConfig { cursor_rewind: 10, ..scan_config("task") };
    let scanner = Scanner::new(single_node_pool(client), store, config, Filter::new());

    assert_eq!(scanner.start_block().await?, 490);
    Ok(())
}

#[tokio::test]
async fn head_rewind_saturates_at_genesis() -> Result<()> {
    let client = Arc::new(MockRpcClient::new(50));
    let config = ScanConfig { start_rewind: 100, ..scan_config("task") };
    let scanner = Scanner::new(
        single_node_pool(client),
        Arc::new(MemoryStore::new("")),
        config,
        Filter::new(),
    );

    assert_eq!(scanner.start_block().await?, 0);
    Ok(())
}

#[tokio::test]
async fn forced_start_overrides_saved_cursor() -> Result<()> {
    let client = Arc::new(MockRpcClient::new(1000));
    let store = Arc::new(MemoryStore::new(""));
    store.save("task", 500).await?;

    let config = ScanConfig { start_block: 123, force_start: true, ..scan_config("task") };
    let scanner = Scanner::new(single_node_pool(client), store, config, Filter::new());

    assert_eq!(scanner.start_block().await?, 123);
    Ok(())
}

#[tokio::test]
async fn configured_start_used_without_cursor() -> Result<()> {
    let client = Arc::new(MockRpcClient::new(1000));
    let config = ScanConfig { start_block: 77, ..scan_config("task") };
    let scanner = Scanner::new(
        single_node_pool(client),
        Arc::new(MemoryStore::new("")),
        config,
        Filter::new(),
    );

    assert_eq!(scanner.start_block().await?, 77);
    Ok(())
}

#[tokio::test]
async fn bloom_miss_skips_logs_call_and_advances_cursor() -> Result<()> {
    let client = Arc::new(MockRpcClient::new(10));
    // Block 10 keeps its default (empty) bloom: the filtered contract
    // cannot be present.
    let filter = Filter::new().contract(address!("a0b86991c6218b36c1d19d4a2e9eb0ce3606eb48"));

    let store = Arc::new(MemoryStore::new(""));
    let config = ScanConfig {
        start_block: 10,
        force_start: true,
        batch_size: 1,
        use_bloom: true,
        ..scan_config("bloom-task")
    };
    let scanner =
        Arc::new(Scanner::new(single_node_pool(client.clone()), store.clone(), config, filter));

    let shutdown = CancellationToken::new();
    let handle = {
        let scanner = Arc::clone(&scanner);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { scanner.run(shutdown).await })
    };

    wait_until("cursor to advance past the skipped block", || {
        let store = store.clone();
        async move { store.load("bloom-task").await.unwrap() == 11 }
    })
    .await;

    // Give the loop a couple more ticks to prove it stays idle.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(client.header_calls(), 1, "exactly one header fetch for the bloom check");
    assert_eq!(client.logs_calls(), 0, "bloom miss must prevent the logs call");

    shutdown.cancel();
    handle.await??;
    Ok(())
}

#[tokio::test]
async fn bloom_hit_still_fetches_logs() -> Result<()> {
    let contract = address!("a0b86991c6218b36c1d19d4a2e9eb0ce3606eb48");
    let client = Arc::new(MockRpcClient::new(10));
    let mut bloom = alloy::primitives::Bloom::default();
    bloom.accrue(alloy::primitives::BloomInput::Raw(contract.as_slice()));
    client.set_bloom(10, bloom);

    let store = Arc::new(MemoryStore::new(""));
    let config = ScanConfig {
        start_block: 10,
        force_start: true,
        batch_size: 1,
        use_bloom: true,
        ..scan_config("bloom-hit")
    };
    let scanner = Arc::new(Scanner::new(
        single_node_pool(client.clone()),
        store.clone(),
        config,
        Filter::new().contract(contract),
    ));

    let shutdown = CancellationToken::new();
    let handle = {
        let scanner = Arc::clone(&scanner);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { scanner.run(shutdown).await })
    };

    wait_until("cursor to advance", || {
        let store = store.clone();
        async move { store.load("bloom-hit").await.unwrap() == 11 }
    })
    .await;

    assert_eq!(client.logs_calls(), 1, "bloom hit must be confirmed by eth_getLogs");

    shutdown.cancel();
    handle.await??;
    Ok(())
}

#[tokio::test]
async fn delivers_logs_in_order_and_persists_monotonic_cursor() -> Result<()> {
    let client = Arc::new(MockRpcClient::new(25));
    for (block, index) in [(3, 0), (3, 1), (10, 0), (17, 2), (25, 0)] {
        client.push_log(log_at(block, index, Address::ZERO, vec![B256::ZERO], Bytes::new()));
    }

    let store = RecordingStore::new();
    let sink = CollectingSink::new();
    let config = ScanConfig {
        start_block: 1,
        force_start: true,
        batch_size: 10,
        ..scan_config("ordered")
    };

    let mut scanner = Scanner::new(
        single_node_pool(client.clone()),
        store.clone(),
        config,
        Filter::new(),
    );
    scanner.set_handler(Arc::new(Dispatcher::new(vec![sink.clone()])));
    let scanner = Arc::new(scanner);

    let shutdown = CancellationToken::new();
    let handle = {
        let scanner = Arc::clone(&scanner);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { scanner.run(shutdown).await })
    };

    wait_until("the whole safe range to be scanned", || {
        let store = store.clone();
        async move { store.load("ordered").await.unwrap() == 26 }
    })
    .await;
    shutdown.cancel();
    handle.await??;

    // Ranges 1-10, 11-20, 21-25: the cursor always lands on lastScanned+1.
    assert_eq!(*store.saves.lock().unwrap(), vec![11, 21, 26]);

    let delivered = sink.flattened();
    assert_eq!(delivered, vec![(3, 0), (3, 1), (10, 0), (17, 2), (25, 0)]);
    assert!(delivered.windows(2).all(|pair| pair[0] < pair[1]), "strictly ascending order");
    Ok(())
}

#[tokio::test]
async fn failed_range_is_retried_without_advancing_cursor() -> Result<()> {
    let client = Arc::new(MockRpcClient::new(25));
    client.push_log(log_at(5, 0, Address::ZERO, vec![B256::ZERO], Bytes::new()));
    client.fail_filter_logs(true);

    let store = Arc::new(MemoryStore::new(""));
    let sink = CollectingSink::new();
    let config =
        ScanConfig { start_block: 1, force_start: true, ..scan_config("retry") };

    let mut scanner =
        Scanner::new(single_node_pool(client.clone()), store.clone(), config, Filter::new());
    scanner.set_handler(Arc::new(Dispatcher::new(vec![sink.clone()])));
    let scanner = Arc::new(scanner);

    let shutdown = CancellationToken::new();
    let handle = {
        let scanner = Arc::clone(&scanner);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { scanner.run(shutdown).await })
    };

    wait_until("at least one failed attempt", || {
        let client = client.clone();
        async move { client.logs_calls() >= 1 }
    })
    .await;
    assert_eq!(store.load("retry").await?, 0, "failed range must not advance the cursor");

    client.fail_filter_logs(false);
    wait_until("recovery after the fault clears", || {
        let store = store.clone();
        async move { store.load("retry").await.unwrap() == 26 }
    })
    .await;

    shutdown.cancel();
    handle.await??;

    assert_eq!(sink.flattened(), vec![(5, 0)]);
    Ok(())
}

#[tokio::test]
async fn reorg_safety_window_holds_back_the_tip() -> Result<()> {
    let client = Arc::new(MockRpcClient::new(100));
    let store = Arc::new(MemoryStore::new(""));
    let config = ScanConfig {
        start_block: 80,
        force_start: true,
        reorg_safe: 10,
        batch_size: 50,
        ..scan_config("window")
    };
    let scanner = Arc::new(Scanner::new(
        single_node_pool(client.clone()),
        store.clone(),
        config,
        Filter::new(),
    ));

    let shutdown = CancellationToken::new();
    let handle = {
        let scanner = Arc::clone(&scanner);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { scanner.run(shutdown).await })
    };

    wait_until("the safe range to be scanned", || {
        let store = store.clone();
        async move { store.load("window").await.unwrap() == 91 }
    })
    .await;

    // Blocks 91..=100 sit inside the safety window and must stay unscanned.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(store.load("window").await?, 91);

    shutdown.cancel();
    handle.await??;
    Ok(())
}

#[tokio::test]
async fn shutdown_token_stops_the_loop() -> Result<()> {
    let client = Arc::new(MockRpcClient::new(100));
    let scanner = Arc::new(Scanner::new(
        single_node_pool(client),
        Arc::new(MemoryStore::new("")),
        ScanConfig { start_block: 1, force_start: true, ..scan_config("stop") },
        Filter::new(),
    ));

    let shutdown = CancellationToken::new();
    let handle = {
        let scanner = Arc::clone(&scanner);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { scanner.run(shutdown).await })
    };

    tokio::time::sleep(Duration::from_millis(30)).await;
    shutdown.cancel();

    tokio::time::timeout(Duration::from_secs(1), handle).await???;
    Ok(())
}
