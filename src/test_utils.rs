//! Test doubles: a scriptable [`RpcClient`] and a capture-everything HTTP
//! listener for webhook assertions.

use std::collections::HashMap;
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
};
use std::time::Duration;

use async_trait::async_trait;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
    task::JoinHandle,
};

use alloy::{
    consensus,
    primitives::{Address, B256, Bloom, Bytes},
    rpc::types::{Block, BlockTransactions, Filter, Header, Log},
};

use crate::{ScannerError, client::RpcClient};

/// Builds an RPC-shaped log positioned at `(block_number, log_index)`.
pub fn log_at(
    block_number: u64,
    log_index: u64,
    address: Address,
    topics: Vec<B256>,
    data: Bytes,
) -> Log {
    Log {
        inner: alloy::primitives::Log::new_unchecked(address, topics, data),
        block_hash: Some(B256::ZERO),
        block_number: Some(block_number),
        block_timestamp: None,
        transaction_hash: Some(B256::with_last_byte((block_number % 251 + 1) as u8)),
        transaction_index: Some(0),
        log_index: Some(log_index),
        removed: false,
    }
}

/// Scriptable in-memory [`RpcClient`].
///
/// Height, per-method failure injection, canned logs, and per-block header
/// blooms are all settable after construction; call counters expose what
/// the code under test actually did on the wire.
pub struct MockRpcClient {
    chain_id: u64,
    height: AtomicU64,
    fail_block_number: AtomicBool,
    fail_filter_logs: AtomicBool,
    logs: Mutex<Vec<Log>>,
    blooms: Mutex<HashMap<u64, Bloom>>,
    block_number_calls: AtomicUsize,
    header_calls: AtomicUsize,
    logs_calls: AtomicUsize,
}

impl MockRpcClient {
    pub fn new(height: u64) -> Self {
        Self {
            chain_id: 1,
            height: AtomicU64::new(height),
            fail_block_number: AtomicBool::new(false),
            fail_filter_logs: AtomicBool::new(false),
            logs: Mutex::new(Vec::new()),
            blooms: Mutex::new(HashMap::new()),
            block_number_calls: AtomicUsize::new(0),
            header_calls: AtomicUsize::new(0),
            logs_calls: AtomicUsize::new(0),
        }
    }

    pub fn set_height(&self, height: u64) {
        self.height.store(height, Ordering::Relaxed);
    }

    pub fn fail_block_number(&self, fail: bool) {
        self.fail_block_number.store(fail, Ordering::Relaxed);
    }

    pub fn fail_filter_logs(&self, fail: bool) {
        self.fail_filter_logs.store(fail, Ordering::Relaxed);
    }

    /// Registers a log returned by `filter_logs` for queries covering its
    /// block number.
    pub fn push_log(&self, log: Log) {
        self.logs.lock().expect("mock logs lock").push(log);
    }

    /// Sets the header bloom reported for `block_number`.
    pub fn set_bloom(&self, block_number: u64, bloom: Bloom) {
        self.blooms.lock().expect("mock blooms lock").insert(block_number, bloom);
    }

    pub fn block_number_calls(&self) -> usize {
        self.block_number_calls.load(Ordering::Relaxed)
    }

    pub fn header_calls(&self) -> usize {
        self.header_calls.load(Ordering::Relaxed)
    }

    pub fn logs_calls(&self) -> usize {
        self.logs_calls.load(Ordering::Relaxed)
    }

    fn header_at(&self, number: u64) -> Header {
        let bloom = self
            .blooms
            .lock()
            .expect("mock blooms lock")
            .get(&number)
            .copied()
            .unwrap_or_default();
        let inner = consensus::Header { number, logs_bloom: bloom, ..Default::default() };
        Header { hash: B256::ZERO, inner, total_difficulty: None, size: None }
    }
}

#[async_trait]
impl RpcClient for MockRpcClient {
    async fn chain_id(&self) -> Result<u64, ScannerError> {
        Ok(self.chain_id)
    }

    async fn block_number(&self) -> Result<u64, ScannerError> {
        self.block_number_calls.fetch_add(1, Ordering::Relaxed);
        if self.fail_block_number.load(Ordering::Relaxed) {
            return Err(ScannerError::rpc("injected blockNumber failure"));
        }
        Ok(self.height.load(Ordering::Relaxed))
    }

    async fn header_by_number(&self, number: u64) -> Result<Header, ScannerError> {
        self.header_calls.fetch_add(1, Ordering::Relaxed);
        Ok(self.header_at(number))
    }

    async fn block_by_number(&self, number: u64) -> Result<Block, ScannerError> {
        Ok(Block {
            header: self.header_at(number),
            uncles: Vec::new(),
            transactions: BlockTransactions::Hashes(Vec::new()),
            withdrawals: None,
        })
    }

    async fn filter_logs(&self, query: &Filter) -> Result<Vec<Log>, ScannerError> {
        self.logs_calls.fetch_add(1, Ordering::Relaxed);
        if self.fail_filter_logs.load(Ordering::Relaxed) {
            return Err(ScannerError::rpc("injected getLogs failure"));
        }

        let from = query.get_from_block().unwrap_or(0);
        let to = query.get_to_block().unwrap_or(u64::MAX);
        let logs = self
            .logs
            .lock()
            .expect("mock logs lock")
            .iter()
            .filter(|log| {
                log.block_number.is_some_and(|number| number >= from && number <= to)
            })
            .cloned()
            .collect();
        Ok(logs)
    }

    async fn code_at(&self, _address: Address, _number: u64) -> Result<Bytes, ScannerError> {
        Ok(Bytes::new())
    }
}

/// One HTTP request captured by [`http_server`].
pub struct CapturedRequest {
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl CapturedRequest {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers.iter().find(|(key, _)| *key == name).map(|(_, value)| value.as_str())
    }
}

/// Handle to a one-shot local HTTP server.
pub struct TestHttpServer {
    pub url: String,
    requests: Arc<Mutex<Vec<CapturedRequest>>>,
    delay: Arc<Mutex<Duration>>,
    accept_task: JoinHandle<()>,
}

impl TestHttpServer {
    /// Adds a fixed pause before each response is written.
    #[must_use]
    pub fn with_delay(self, delay: Duration) -> Self {
        *self.delay.lock().expect("delay lock") = delay;
        self
    }

    /// Stops accepting and returns everything captured so far.
    pub async fn finish(self) -> Vec<CapturedRequest> {
        self.accept_task.abort();
        let _ = self.accept_task.await;
        match Arc::try_unwrap(self.requests) {
            Ok(requests) => requests.into_inner().expect("requests lock"),
            Err(shared) => std::mem::take(&mut *shared.lock().expect("requests lock")),
        }
    }
}

/// Spawns a local HTTP server answering successive requests with the given
/// status codes, capturing each request's headers and body.
pub async fn http_server(statuses: Vec<u16>) -> TestHttpServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind test listener");
    let url = format!("http://{}/", listener.local_addr().expect("listener addr"));

    let requests: Arc<Mutex<Vec<CapturedRequest>>> = Arc::new(Mutex::new(Vec::new()));
    let delay: Arc<Mutex<Duration>> = Arc::new(Mutex::new(Duration::ZERO));

    let task_requests = Arc::clone(&requests);
    let task_delay = Arc::clone(&delay);
    let accept_task = tokio::spawn(async move {
        for status in statuses {
            let Ok((mut socket, _)) = listener.accept().await else { break };
            let Some(request) = read_request(&mut socket).await else { continue };
            task_requests.lock().expect("requests lock").push(request);

            let pause = *task_delay.lock().expect("delay lock");
            if !pause.is_zero() {
                tokio::time::sleep(pause).await;
            }

            let response = format!(
                "HTTP/1.1 {status} {}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
                reason(status)
            );
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
        }
    });

    TestHttpServer { url, requests, delay, accept_task }
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        204 => "No Content",
        400 => "Bad Request",
        500 => "Internal Server Error",
        _ => "Status",
    }
}

async fn read_request(socket: &mut tokio::net::TcpStream) -> Option<CapturedRequest> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    // Read until the blank line that ends the header block.
    let header_end = loop {
        let read = socket.read(&mut chunk).await.ok()?;
        if read == 0 {
            return None;
        }
        buffer.extend_from_slice(&chunk[..read]);
        if let Some(pos) = buffer.windows(4).position(|window| window == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let header_text = String::from_utf8_lossy(&buffer[..header_end]).to_string();
    let headers: Vec<(String, String)> = header_text
        .lines()
        .skip(1)
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            Some((name.trim().to_ascii_lowercase(), value.trim().to_string()))
        })
        .collect();

    let content_length: usize = headers
        .iter()
        .find(|(name, _)| name == "content-length")
        .and_then(|(_, value)| value.parse().ok())
        .unwrap_or(0);

    let mut body = buffer[header_end..].to_vec();
    while body.len() < content_length {
        let read = socket.read(&mut chunk).await.ok()?;
        if read == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..read]);
    }

    Some(CapturedRequest { headers, body })
}
