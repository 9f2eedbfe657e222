use std::time::Duration;

use serde::{Deserialize, Deserializer};

/// Default number of blocks fetched per `eth_getLogs` range.
pub const DEFAULT_BATCH_SIZE: u64 = 100;

/// Default pause between scan ticks.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(3);

/// Scan-loop configuration for one chain.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Task identifier used as the cursor key, e.g. `"eth-mainnet"`.
    pub chain_id: String,

    /// Explicit start height. Used when `force_start` is set, or as the
    /// default when no cursor has been persisted yet.
    pub start_block: u64,

    /// Ignore any persisted cursor and start from `start_block`.
    pub force_start: bool,

    /// With neither a cursor nor a `start_block`, start this many blocks
    /// behind the current head.
    pub start_rewind: u64,

    /// Safety rewind applied to a persisted cursor on startup, to re-cover
    /// blocks that may have been reorged while the scanner was down.
    pub cursor_rewind: u64,

    /// Blocks per `eth_getLogs` range. `0` falls back to
    /// [`DEFAULT_BATCH_SIZE`].
    pub batch_size: u64,

    /// Pause between scan ticks. Zero falls back to [`DEFAULT_INTERVAL`].
    #[serde(rename = "interval_ms", deserialize_with = "duration_from_millis")]
    pub interval: Duration,

    /// Reorg safety window: only blocks at `head - reorg_safe` or lower are
    /// scanned.
    pub reorg_safe: u64,

    /// Skip single-block ranges whose header bloom rules the filter out.
    pub use_bloom: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            chain_id: String::new(),
            start_block: 0,
            force_start: false,
            start_rewind: 0,
            cursor_rewind: 0,
            batch_size: DEFAULT_BATCH_SIZE,
            interval: DEFAULT_INTERVAL,
            reorg_safe: 0,
            use_bloom: false,
        }
    }
}

impl ScanConfig {
    /// Replaces zero batch size and interval with their defaults.
    pub(crate) fn normalized(mut self) -> Self {
        if self.batch_size == 0 {
            self.batch_size = DEFAULT_BATCH_SIZE;
        }
        if self.interval.is_zero() {
            self.interval = DEFAULT_INTERVAL;
        }
        self
    }
}

fn duration_from_millis<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
    u64::deserialize(de).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_constants() {
        let config = ScanConfig::default();
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.interval, Duration::from_secs(3));
        assert!(!config.use_bloom);
    }

    #[test]
    fn normalized_fills_zero_fields() {
        let config = ScanConfig {
            batch_size: 0,
            interval: Duration::ZERO,
            ..ScanConfig::default()
        }
        .normalized();
        assert_eq!(config.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(config.interval, DEFAULT_INTERVAL);
    }

    #[test]
    fn deserializes_interval_from_millis() {
        let config: ScanConfig =
            serde_json::from_str(r#"{"chain_id": "eth", "interval_ms": 250}"#).unwrap();
        assert_eq!(config.chain_id, "eth");
        assert_eq!(config.interval, Duration::from_millis(250));
    }
}
