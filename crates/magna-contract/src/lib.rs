//! # magna-contract
//!
//! Contract state store for the MagnaChain node.
//!
//! Tracks each contract's program and key-value storage, with a per-height
//! snapshot (reverse delta) for every block that touched it so reorgs can
//! be undone. Block execution runs the caller-partitioned transaction
//! groups in parallel on a fixed worker pool, staging writes in
//! per-thread [`ContractContext`] values that merge at the end-of-block
//! barrier.
//!
//! The scripting VM itself is out of scope; it enters through the
//! [`ContractVm`] trait, one owned instance per worker thread.

mod context;
mod error;
mod executor;
mod state;
mod store;

pub use context::{ContractContext, ContractData, ContractTxFinalData};
pub use error::{ContractError, ContractResult};
pub use executor::{
    BlockExecutionOutcome, CoinAmountCache, ContractExecutor, ContractTransaction, ContractVm,
};
pub use state::{ContractId, ContractInfo, ContractRecord, HeightEntry, StorageDelta};
pub use store::ContractStateDb;
