//! # magna-storage
//!
//! Storage layer for the MagnaChain node: a persistent ordered map from
//! opaque byte keys to opaque byte values.
//!
//! Each chain-state database (`chainstate/`, `blocks/index/`, `contract/`)
//! is one [`Database`] holding a single keyspace; the first byte of every
//! key is its namespace prefix. The store guarantees:
//!
//! - atomic application of a [`WriteBatch`], optionally synced to disk
//! - forward iteration from an arbitrary start key, over a snapshot taken
//!   at iterator creation
//! - range compaction and range size estimation

mod batch;
mod database;
mod error;

pub use batch::WriteBatch;
pub use database::Database;
pub use error::{StorageError, StorageResult};

/// Ordered key-value store with atomic batched writes.
///
/// Abstracting the backend keeps the higher stores testable against mock
/// implementations.
pub trait KeyValueStore: Send + Sync {
    /// Point lookup. Absence is `Ok(None)`, not an error.
    fn get(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>>;

    /// Whether a key is present.
    fn exists(&self, key: &[u8]) -> StorageResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Apply a batch atomically. With `sync` the write is fsynced before
    /// returning.
    fn write_batch(&self, batch: WriteBatch, sync: bool) -> StorageResult<()>;

    /// Forward iteration starting at `start` (inclusive), over a snapshot
    /// as of the call.
    fn iter_from<'a>(
        &'a self,
        start: &[u8],
    ) -> StorageResult<Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + 'a>>;

    /// Compact the `[begin, end)` key range.
    fn compact_range(&self, begin: &[u8], end: &[u8]);

    /// Approximate on-disk size of the `[begin, end)` key range in bytes.
    fn estimate_size(&self, begin: &[u8], end: &[u8]) -> StorageResult<u64>;
}
