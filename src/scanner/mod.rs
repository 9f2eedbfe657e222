mod config;
#[allow(clippy::module_inception)]
mod scanner;

pub use config::{DEFAULT_BATCH_SIZE, DEFAULT_INTERVAL, ScanConfig};
pub use scanner::{LogHandler, Scanner};
