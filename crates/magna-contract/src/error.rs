//! Error types for the contract state store.

use crate::ContractId;
use thiserror::Error;

/// Contract-state errors.
#[derive(Error, Debug)]
pub enum ContractError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] magna_storage::StorageError),

    /// A stored record failed to decode.
    #[error("codec error: {0}")]
    Codec(#[from] magna_core::CodecError),

    /// A stored record is structurally inconsistent.
    #[error("corrupt contract state: {0}")]
    Corruption(String),

    /// A long-running pass was stopped by a shutdown request.
    #[error("operation interrupted by shutdown request")]
    Interrupted,

    /// Two execution groups touched the same contract; the caller's
    /// partition is not conflict-free.
    #[error("contract {contract} touched by more than one execution group")]
    GroupConflict {
        /// The doubly-touched contract.
        contract: ContractId,
    },

    /// The worker pool has shut down.
    #[error("contract worker pool stopped")]
    PoolStopped,
}

/// Result type for contract-state operations.
pub type ContractResult<T> = Result<T, ContractError>;
