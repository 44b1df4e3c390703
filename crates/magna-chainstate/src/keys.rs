//! Key encodings for the chain-state databases.
//!
//! Every key starts with a single namespace prefix byte. The encodings are
//! wire-compatible with existing stores and must not change.

use crate::{ChainStateError, ChainStateResult};
use magna_core::{
    read_varint, write_compact_size, write_varint, AddressKey, Hash256, OutPoint, SliceReader,
};

/// Per-output coin record.
pub const DB_COIN: u8 = b'C';
/// Legacy per-transaction coin record (upgrade source).
pub const DB_COINS_LEGACY: u8 = b'c';
/// Block file accounting.
pub const DB_BLOCK_FILES: u8 = b'f';
/// Transaction position index.
pub const DB_TXINDEX: u8 = b't';
/// Block index record.
pub const DB_BLOCK_INDEX: u8 = b'b';
/// Consistent tip marker.
pub const DB_BEST_BLOCK: u8 = b'B';
/// Transitional tip marker.
pub const DB_HEAD_BLOCKS: u8 = b'H';
/// Named feature flag.
pub const DB_FLAG: u8 = b'F';
/// Reindex-in-progress marker (presence-only).
pub const DB_REINDEX_FLAG: u8 = b'R';
/// Highest block file number in use.
pub const DB_LAST_BLOCK: u8 = b'l';
/// Address to coin-list record.
pub const DB_COINLIST: u8 = b'A';

/// Coin key: `C` ‖ txid ‖ varint(output index).
pub fn coin_key(outpoint: &OutPoint) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + 32 + 5);
    key.push(DB_COIN);
    key.extend_from_slice(outpoint.txid.as_bytes());
    write_varint(&mut key, outpoint.index as u64);
    key
}

/// Decode a coin key back into an outpoint.
pub fn parse_coin_key(key: &[u8]) -> ChainStateResult<OutPoint> {
    let mut reader = SliceReader::new(key);
    if reader.read_u8()? != DB_COIN {
        return Err(ChainStateError::Corruption("not a coin key".into()));
    }
    let txid = Hash256::from_bytes(reader.read_array_32()?);
    let index = read_varint(&mut reader)?;
    let index =
        u32::try_from(index).map_err(|_| ChainStateError::Corruption("coin index range".into()))?;
    if !reader.is_empty() {
        return Err(ChainStateError::Corruption("oversized coin key".into()));
    }
    Ok(OutPoint::new(txid, index))
}

/// Legacy coin key: `c` ‖ txid.
pub fn legacy_coin_key(txid: &Hash256) -> Vec<u8> {
    let mut key = Vec::with_capacity(33);
    key.push(DB_COINS_LEGACY);
    key.extend_from_slice(txid.as_bytes());
    key
}

/// Block-file-info key: `f` ‖ i32-le file number.
pub fn block_file_key(file: i32) -> Vec<u8> {
    let mut key = Vec::with_capacity(5);
    key.push(DB_BLOCK_FILES);
    key.extend_from_slice(&file.to_le_bytes());
    key
}

/// Tx-index key: `t` ‖ txid.
pub fn tx_index_key(txid: &Hash256) -> Vec<u8> {
    let mut key = Vec::with_capacity(33);
    key.push(DB_TXINDEX);
    key.extend_from_slice(txid.as_bytes());
    key
}

/// Block-index key: `b` ‖ block hash.
pub fn block_index_key(hash: &Hash256) -> Vec<u8> {
    let mut key = Vec::with_capacity(33);
    key.push(DB_BLOCK_INDEX);
    key.extend_from_slice(hash.as_bytes());
    key
}

/// Flag key: `F` ‖ compact-size length ‖ name bytes.
pub fn flag_key(name: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(2 + name.len());
    key.push(DB_FLAG);
    write_compact_size(&mut key, name.len() as u64);
    key.extend_from_slice(name.as_bytes());
    key
}

/// Address coin-list key: `A` ‖ 20-byte address.
pub fn coin_list_key(addr: &AddressKey) -> Vec<u8> {
    let mut key = Vec::with_capacity(21);
    key.push(DB_COINLIST);
    key.extend_from_slice(addr.as_bytes());
    key
}
