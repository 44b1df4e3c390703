//! Error types for the chain-state stores.

use thiserror::Error;

/// Chain-state errors.
#[derive(Error, Debug)]
pub enum ChainStateError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] magna_storage::StorageError),

    /// A stored record failed to decode.
    #[error("codec error: {0}")]
    Codec(#[from] magna_core::CodecError),

    /// A stored record is structurally inconsistent.
    #[error("corrupt chain state: {0}")]
    Corruption(String),

    /// A long-running pass was stopped by a shutdown request. Durable
    /// state is consistent and the pass resumes on next start.
    #[error("operation interrupted by shutdown request")]
    Interrupted,

    /// Legacy per-transaction coin records are present; run the upgrade
    /// pass and retry.
    #[error("legacy coin database format, upgrade required")]
    UpgradeRequired,
}

/// Result type for chain-state operations.
pub type ChainStateResult<T> = Result<T, ChainStateError>;
