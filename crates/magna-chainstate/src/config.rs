//! Store configuration.

use serde::{Deserialize, Serialize};

/// Default maximum batch size before a partial flush (16 MiB).
pub const DEFAULT_DB_BATCH_SIZE: usize = 16 * 1024 * 1024;

/// Default per-store cache budget (64 MiB).
pub const DEFAULT_DB_CACHE_SIZE: usize = 64 * 1024 * 1024;

/// Configuration shared by the chain-state stores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainStateConfig {
    /// Byte threshold at which a commit flushes a partial batch.
    #[serde(default = "default_db_batch_size")]
    pub db_batch_size: usize,

    /// When non-zero, abort the process with probability `1/db_crash_ratio`
    /// after each partial flush. Fault-injection knob for crash testing.
    #[serde(default)]
    pub db_crash_ratio: u32,

    /// Per-store cache budget in bytes.
    #[serde(default = "default_db_cache_size")]
    pub db_cache_size: usize,

    /// Force a full reindex on startup.
    #[serde(default)]
    pub reindex: bool,

    /// Maintain the transaction position index.
    #[serde(default)]
    pub tx_index: bool,
}

fn default_db_batch_size() -> usize {
    DEFAULT_DB_BATCH_SIZE
}

fn default_db_cache_size() -> usize {
    DEFAULT_DB_CACHE_SIZE
}

impl Default for ChainStateConfig {
    fn default() -> Self {
        Self {
            db_batch_size: DEFAULT_DB_BATCH_SIZE,
            db_crash_ratio: 0,
            db_cache_size: DEFAULT_DB_CACHE_SIZE,
            reindex: false,
            tx_index: false,
        }
    }
}
