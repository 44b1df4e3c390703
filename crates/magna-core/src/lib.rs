//! # magna-core
//!
//! Primitive value types shared by every store in the MagnaChain node:
//!
//! - 256-bit hashes and 160-bit address keys
//! - Outpoints, transaction outputs and coins
//! - The compact-size and ascending-varint wire encodings
//! - Script destination extraction (key-hash, script-hash, contract,
//!   branch-transfer)
//! - The partial merkle tree used by block validation
//! - The process-wide interrupt token polled by long-running scans

mod encode;
mod error;
mod hash;
mod interrupt;
pub mod merkle;
mod script;
mod types;

pub use encode::{
    read_compact_size, read_varint, write_compact_size, write_varint, SliceReader,
};
pub use error::{CodecError, CodecResult};
pub use hash::{double_sha256, hash160, AddressKey, Hash256};
pub use interrupt::{InterruptToken, ProgressFn};
pub use merkle::{merkle_root, PartialMerkleTree};
pub use script::{Destination, Script, OP_CONTRACT, OP_CONTRACT_CHANGE, OP_TRANS_BRANCH};
pub use types::{Amount, Coin, OutPoint, TxOut};
