//! Error types for the storage layer.

use thiserror::Error;

/// Storage-specific errors.
#[derive(Error, Debug)]
pub enum StorageError {
    /// RocksDB error.
    #[error("database error: {0}")]
    Database(#[from] rocksdb::Error),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Corruption detected.
    #[error("data corruption detected: {0}")]
    Corruption(String),
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
