//! Built-in per-chain defaults.
//!
//! A preset bundles the parameters that usually need tuning per chain:
//! block time (drives the polling interval), the recommended reorg safety
//! window, and a sensible batch size. Applications can register their own
//! chains at startup.

use std::collections::HashMap;
use std::sync::{LazyLock, RwLock};
use std::time::Duration;

/// Default behavior parameters for a chain.
#[derive(Debug, Clone)]
pub struct ChainPreset {
    /// Numeric chain id as used for the cursor task key, e.g. `"1"`.
    pub chain_id: String,
    /// Average block time; a reasonable scan interval.
    pub block_time: Duration,
    /// Recommended reorg safety window in blocks.
    pub reorg_safe: u64,
    /// Recommended scan batch size.
    pub batch_size: u64,
}

static REGISTRY: LazyLock<RwLock<HashMap<&'static str, ChainPreset>>> = LazyLock::new(|| {
    let mut presets = HashMap::new();
    presets.insert(
        "eth-mainnet",
        ChainPreset {
            chain_id: "1".to_string(),
            block_time: Duration::from_secs(12),
            reorg_safe: 12,
            batch_size: 100,
        },
    );
    presets.insert(
        "bsc-mainnet",
        ChainPreset {
            chain_id: "56".to_string(),
            block_time: Duration::from_secs(3),
            // BSC reorgs are relatively frequent
            reorg_safe: 15,
            batch_size: 200,
        },
    );
    presets.insert(
        "polygon-mainnet",
        ChainPreset {
            chain_id: "137".to_string(),
            block_time: Duration::from_secs(2),
            // Polygon recommends deeper confirmations
            reorg_safe: 32,
            batch_size: 200,
        },
    );
    RwLock::new(presets)
});

/// Looks up a preset by its registered name.
pub fn preset(name: &str) -> Option<ChainPreset> {
    REGISTRY.read().expect("preset registry lock poisoned").get(name).cloned()
}

/// Registers (or replaces) a preset for custom or private chains.
pub fn register(name: &'static str, preset: ChainPreset) {
    REGISTRY.write().expect("preset registry lock poisoned").insert(name, preset);
}
