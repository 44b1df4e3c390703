//! Durable catalog of known block headers and their on-disk placement.
//!
//! Backed by the `blocks/index/` database. Block records form a
//! parent-chain DAG; parent pointers are stable handles into a
//! [`BlockIndexArena`] that interns block hashes, never owning references.

use crate::{keys, ChainStateError, ChainStateResult};
use magna_core::{
    read_varint, write_varint, Hash256, InterruptToken, SliceReader,
};
use magna_storage::{Database, KeyValueStore, WriteBatch};
use num_bigint::BigUint;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Block status bits stored in [`BlockRecord::status`].
pub mod status {
    /// Mask over the validity level.
    pub const VALID_MASK: u32 = 0x07;
    /// The block body is stored in a block file.
    pub const HAVE_DATA: u32 = 1 << 3;
    /// Undo data is stored in an undo file.
    pub const HAVE_UNDO: u32 = 1 << 4;
    /// The block failed validation.
    pub const FAILED: u32 = 1 << 5;
    /// A descendant of a failed block.
    pub const FAILED_CHILD: u32 = 1 << 6;
}

/// One known block: header fields plus file placement and status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRecord {
    /// Block hash (the record's key; not part of the stored value).
    pub hash: Hash256,
    /// Parent block hash; zero for genesis.
    pub prev_hash: Hash256,
    /// Height in the chain.
    pub height: u32,
    /// Block file number holding the body.
    pub file: u32,
    /// Byte offset of the body within the file.
    pub data_pos: u32,
    /// Byte offset of the undo data within the undo file.
    pub undo_pos: u32,
    /// Header version.
    pub version: u32,
    /// Transaction merkle root.
    pub merkle_root: Hash256,
    /// Merkle root over transactions with contract data.
    pub merkle_root_with_data: Hash256,
    /// Merkle root binding the previous block's contract data.
    pub merkle_root_with_prev_data: Hash256,
    /// Header timestamp.
    pub time: u32,
    /// Compact difficulty target.
    pub bits: u32,
    /// Header nonce.
    pub nonce: u32,
    /// Status bitmask, see [`status`].
    pub status: u32,
    /// Number of transactions in the block.
    pub tx_count: u32,
}

impl BlockRecord {
    /// Encode the stored value (everything but the hash).
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(160);
        write_varint(&mut buf, self.version as u64);
        write_varint(&mut buf, self.height as u64);
        write_varint(&mut buf, self.status as u64);
        write_varint(&mut buf, self.tx_count as u64);
        write_varint(&mut buf, self.file as u64);
        write_varint(&mut buf, self.data_pos as u64);
        write_varint(&mut buf, self.undo_pos as u64);
        buf.extend_from_slice(self.prev_hash.as_bytes());
        buf.extend_from_slice(self.merkle_root.as_bytes());
        buf.extend_from_slice(self.merkle_root_with_data.as_bytes());
        buf.extend_from_slice(self.merkle_root_with_prev_data.as_bytes());
        write_varint(&mut buf, self.time as u64);
        write_varint(&mut buf, self.bits as u64);
        write_varint(&mut buf, self.nonce as u64);
        buf
    }

    /// Decode a stored value; `hash` comes from the record's key.
    pub fn decode(hash: Hash256, bytes: &[u8]) -> ChainStateResult<Self> {
        let mut reader = SliceReader::new(bytes);
        let version = read_varint(&mut reader)? as u32;
        let height = read_varint(&mut reader)? as u32;
        let status = read_varint(&mut reader)? as u32;
        let tx_count = read_varint(&mut reader)? as u32;
        let file = read_varint(&mut reader)? as u32;
        let data_pos = read_varint(&mut reader)? as u32;
        let undo_pos = read_varint(&mut reader)? as u32;
        let prev_hash = Hash256::from_bytes(reader.read_array_32()?);
        let merkle_root = Hash256::from_bytes(reader.read_array_32()?);
        let merkle_root_with_data = Hash256::from_bytes(reader.read_array_32()?);
        let merkle_root_with_prev_data = Hash256::from_bytes(reader.read_array_32()?);
        let time = read_varint(&mut reader)? as u32;
        let bits = read_varint(&mut reader)? as u32;
        let nonce = read_varint(&mut reader)? as u32;
        Ok(Self {
            hash,
            prev_hash,
            height,
            file,
            data_pos,
            undo_pos,
            version,
            merkle_root,
            merkle_root_with_data,
            merkle_root_with_prev_data,
            time,
            bits,
            nonce,
            status,
            tx_count,
        })
    }
}

/// Per-file accounting for the `blkNNNNN.dat` block files.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockFileInfo {
    /// Number of blocks stored in the file.
    pub blocks: u32,
    /// Bytes used by block data.
    pub size: u32,
    /// Bytes used by undo data.
    pub undo_size: u32,
    /// Lowest block height in the file.
    pub height_first: u32,
    /// Highest block height in the file.
    pub height_last: u32,
    /// Earliest block time in the file.
    pub time_first: u64,
    /// Latest block time in the file.
    pub time_last: u64,
}

impl BlockFileInfo {
    /// Account for a block of `height`/`time` landing in this file.
    pub fn add_block(&mut self, height: u32, time: u64) {
        if self.blocks == 0 || height < self.height_first {
            self.height_first = height;
        }
        if self.blocks == 0 || time < self.time_first {
            self.time_first = time;
        }
        self.blocks += 1;
        if height > self.height_last {
            self.height_last = height;
        }
        if time > self.time_last {
            self.time_last = time;
        }
    }

    /// Encode for storage.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(32);
        write_varint(&mut buf, self.blocks as u64);
        write_varint(&mut buf, self.size as u64);
        write_varint(&mut buf, self.undo_size as u64);
        write_varint(&mut buf, self.height_first as u64);
        write_varint(&mut buf, self.height_last as u64);
        write_varint(&mut buf, self.time_first);
        write_varint(&mut buf, self.time_last);
        buf
    }

    /// Decode from storage.
    pub fn decode(bytes: &[u8]) -> ChainStateResult<Self> {
        let mut reader = SliceReader::new(bytes);
        Ok(Self {
            blocks: read_varint(&mut reader)? as u32,
            size: read_varint(&mut reader)? as u32,
            undo_size: read_varint(&mut reader)? as u32,
            height_first: read_varint(&mut reader)? as u32,
            height_last: read_varint(&mut reader)? as u32,
            time_first: read_varint(&mut reader)?,
            time_last: read_varint(&mut reader)?,
        })
    }
}

/// Position of a transaction inside a block file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskTxPos {
    /// Block file number.
    pub file: u32,
    /// Offset of the containing block.
    pub block_offset: u32,
    /// Offset of the transaction within the block.
    pub tx_offset: u32,
}

impl DiskTxPos {
    /// Encode for storage.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(12);
        write_varint(&mut buf, self.file as u64);
        write_varint(&mut buf, self.block_offset as u64);
        write_varint(&mut buf, self.tx_offset as u64);
        buf
    }

    /// Decode from storage.
    pub fn decode(bytes: &[u8]) -> ChainStateResult<Self> {
        let mut reader = SliceReader::new(bytes);
        Ok(Self {
            file: read_varint(&mut reader)? as u32,
            block_offset: read_varint(&mut reader)? as u32,
            tx_offset: read_varint(&mut reader)? as u32,
        })
    }
}

/// Stable handle to an interned block hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockHandle(u32);

impl BlockHandle {
    /// Slab index of the handle.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// An interned block: hash, parent handle, and the loaded record once
/// its row has been read.
#[derive(Debug, Clone)]
pub struct InternedBlock {
    /// The block hash.
    pub hash: Hash256,
    /// Parent handle; `None` for genesis (zero parent hash).
    pub prev: Option<BlockHandle>,
    /// Loaded record, absent for blocks only referenced as parents.
    pub record: Option<BlockRecord>,
}

/// Interns block hashes into stable handles, deduplicating instances, and
/// holds the loaded records in a slab.
#[derive(Debug, Default)]
pub struct BlockIndexArena {
    handles: HashMap<Hash256, BlockHandle>,
    blocks: Vec<InternedBlock>,
}

impl BlockIndexArena {
    /// Create an empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern `hash`, returning the existing handle if already present.
    pub fn intern(&mut self, hash: Hash256) -> BlockHandle {
        if let Some(&handle) = self.handles.get(&hash) {
            return handle;
        }
        let handle = BlockHandle(self.blocks.len() as u32);
        self.blocks.push(InternedBlock {
            hash,
            prev: None,
            record: None,
        });
        self.handles.insert(hash, handle);
        handle
    }

    /// Look up the handle for `hash` without interning.
    pub fn lookup(&self, hash: &Hash256) -> Option<BlockHandle> {
        self.handles.get(hash).copied()
    }

    /// The interned block behind `handle`.
    pub fn get(&self, handle: BlockHandle) -> &InternedBlock {
        &self.blocks[handle.index()]
    }

    /// Number of interned blocks.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Whether the arena is empty.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Iterate handles in interning order.
    pub fn iter(&self) -> impl Iterator<Item = (BlockHandle, &InternedBlock)> {
        self.blocks
            .iter()
            .enumerate()
            .map(|(i, block)| (BlockHandle(i as u32), block))
    }

    fn attach(&mut self, handle: BlockHandle, record: BlockRecord) {
        let prev = if record.prev_hash.is_zero() {
            None
        } else {
            Some(self.intern(record.prev_hash))
        };
        let block = &mut self.blocks[handle.index()];
        block.prev = prev;
        block.record = Some(record);
    }
}

/// The block index database.
pub struct BlockTreeDb {
    store: Arc<Database>,
}

impl BlockTreeDb {
    /// Create a block tree over `store`.
    pub fn new(store: Arc<Database>) -> Self {
        Self { store }
    }

    /// Write changed file infos, the new last-file number and changed
    /// block records in one synchronous batch.
    pub fn write_batch_sync(
        &self,
        file_infos: &[(i32, BlockFileInfo)],
        last_file: i32,
        blocks: &[BlockRecord],
    ) -> ChainStateResult<()> {
        let mut batch = WriteBatch::new();
        for (file, info) in file_infos {
            batch.put(keys::block_file_key(*file), info.encode());
        }
        batch.put([keys::DB_LAST_BLOCK], last_file.to_le_bytes().to_vec());
        for record in blocks {
            batch.put(keys::block_index_key(&record.hash), record.encode());
        }
        self.store.write_batch(batch, true)?;
        debug!(
            files = file_infos.len(),
            blocks = blocks.len(),
            last_file,
            "block index batch committed"
        );
        Ok(())
    }

    /// Read the accounting record for `file`.
    pub fn read_block_file_info(&self, file: i32) -> ChainStateResult<Option<BlockFileInfo>> {
        match self.store.get(&keys::block_file_key(file))? {
            Some(bytes) => Ok(Some(BlockFileInfo::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Read the highest block file number in use.
    pub fn read_last_block_file(&self) -> ChainStateResult<Option<i32>> {
        match self.store.get(&[keys::DB_LAST_BLOCK])? {
            Some(bytes) => {
                let arr: [u8; 4] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| ChainStateError::Corruption("last block file record".into()))?;
                Ok(Some(i32::from_le_bytes(arr)))
            }
            None => Ok(None),
        }
    }

    /// Set or clear the reindex-in-progress marker.
    pub fn write_reindexing(&self, reindexing: bool) -> ChainStateResult<()> {
        let mut batch = WriteBatch::new();
        if reindexing {
            batch.put([keys::DB_REINDEX_FLAG], b"1".to_vec());
        } else {
            batch.delete([keys::DB_REINDEX_FLAG]);
        }
        self.store.write_batch(batch, false)?;
        Ok(())
    }

    /// Whether a reindex was in progress when the process stopped.
    pub fn is_reindexing(&self) -> ChainStateResult<bool> {
        Ok(self.store.exists(&[keys::DB_REINDEX_FLAG])?)
    }

    /// Store a named boolean flag.
    pub fn write_flag(&self, name: &str, value: bool) -> ChainStateResult<()> {
        let mut batch = WriteBatch::new();
        batch.put(keys::flag_key(name), if value { b"1" } else { b"0" }.to_vec());
        self.store.write_batch(batch, false)?;
        Ok(())
    }

    /// Read a named boolean flag; absent flags are `None`.
    pub fn read_flag(&self, name: &str) -> ChainStateResult<Option<bool>> {
        Ok(self
            .store
            .get(&keys::flag_key(name))?
            .map(|bytes| bytes.first() == Some(&b'1')))
    }

    /// Bulk-write transaction positions. Separate from the main batch so
    /// indexing can be disabled without touching the write path.
    pub fn write_tx_index(&self, positions: &[(Hash256, DiskTxPos)]) -> ChainStateResult<()> {
        let mut batch = WriteBatch::new();
        for (txid, pos) in positions {
            batch.put(keys::tx_index_key(txid), pos.encode());
        }
        self.store.write_batch(batch, false)?;
        Ok(())
    }

    /// Look up a transaction's position.
    pub fn read_tx_index(&self, txid: &Hash256) -> ChainStateResult<Option<DiskTxPos>> {
        match self.store.get(&keys::tx_index_key(txid))? {
            Some(bytes) => Ok(Some(DiskTxPos::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Load every block record into `arena`, reconstructing parent
    /// pointers as handles and verifying each record's proof of work.
    ///
    /// Interrupt-checked per record so a shutdown during startup aborts
    /// the load with [`ChainStateError::Interrupted`].
    pub fn load_block_index(
        &self,
        arena: &mut BlockIndexArena,
        interrupt: &InterruptToken,
    ) -> ChainStateResult<()> {
        let mut loaded = 0usize;
        for (key, value) in self.store.iter_from(&[keys::DB_BLOCK_INDEX])? {
            if key.first() != Some(&keys::DB_BLOCK_INDEX) {
                break;
            }
            if interrupt.is_requested() {
                return Err(ChainStateError::Interrupted);
            }
            if key.len() != 33 {
                return Err(ChainStateError::Corruption("block index key length".into()));
            }
            let hash = Hash256::from_slice(&key[1..33]).expect("32 bytes");
            let record = BlockRecord::decode(hash, &value)?;
            if !check_proof_of_work(&hash, record.bits) {
                return Err(ChainStateError::Corruption(format!(
                    "proof of work check failed for block {hash}"
                )));
            }
            let handle = arena.intern(hash);
            arena.attach(handle, record);
            loaded += 1;
        }
        info!(blocks = loaded, "block index loaded");
        Ok(())
    }
}

/// Verify `hash` satisfies the compact difficulty target `bits`.
pub fn check_proof_of_work(hash: &Hash256, bits: u32) -> bool {
    match compact_to_target(bits) {
        Some(target) => BigUint::from_bytes_le(hash.as_bytes()) <= target,
        None => false,
    }
}

/// Expand a compact target. `None` for negative, zero or overflowing
/// encodings.
fn compact_to_target(bits: u32) -> Option<BigUint> {
    let exponent = bits >> 24;
    let mantissa = bits & 0x007f_ffff;
    if mantissa == 0 {
        return None;
    }
    if bits & 0x0080_0000 != 0 {
        return None;
    }
    let overflow = exponent > 34
        || (mantissa > 0xff && exponent > 33)
        || (mantissa > 0xffff && exponent > 32);
    if overflow {
        return None;
    }
    let target = if exponent <= 3 {
        BigUint::from(mantissa >> (8 * (3 - exponent)))
    } else {
        BigUint::from(mantissa) << (8 * (exponent - 3))
    };
    if target == BigUint::default() {
        return None;
    }
    Some(target)
}
