//! # magna-chainstate
//!
//! Chain-state persistence for the MagnaChain node:
//!
//! - [`CoinsView`] / [`CoinsViewCache`] / [`CoinsViewDb`]: the layered
//!   coin (UTXO) set with a crash-safe commit protocol
//! - [`CoinListDb`]: the address-to-outpoint reverse index, flushed in the
//!   same logical transaction as the coin view
//! - [`BlockTreeDb`]: the durable block-header catalog with file
//!   placement, status flags and the transaction position index
//! - the legacy per-transaction coin format upgrade pass
//!
//! ## Crash consistency
//!
//! Exactly one tip form exists on disk at all times: either the
//! consistent form (best-block set, head-blocks absent) or the
//! transitional form (head-blocks `[target, previous]`, best-block
//! absent). On startup a two-element head-blocks record means a commit
//! was interrupted; the caller replays forward from `head_blocks()[1]`.

mod addrindex;
mod blocktree;
mod coindb;
mod coins;
mod config;
mod error;
pub mod keys;

pub use addrindex::{CoinList, CoinListDb};
pub use blocktree::{
    check_proof_of_work, status, BlockFileInfo, BlockHandle, BlockIndexArena, BlockRecord,
    BlockTreeDb, DiskTxPos, InternedBlock,
};
pub use coindb::{CoinsStats, CoinsViewDb, LegacyCoinsRecord};
pub use coins::{CacheEntry, CoinsMap, CoinsView, CoinsViewCache};
pub use config::{ChainStateConfig, DEFAULT_DB_BATCH_SIZE, DEFAULT_DB_CACHE_SIZE};
pub use error::{ChainStateError, ChainStateResult};
