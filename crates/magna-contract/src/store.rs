//! Durable contract state with per-height snapshots.
//!
//! Backed by the `contract/` database. Two namespaces:
//!
//! - `K` ‖ contract-id: the contract record (code, current storage, and
//!   the retained per-height reverse deltas)
//! - `h` ‖ big-endian height: the set of contracts touched at that
//!   height, with the touching block's hash
//!
//! A block connect appends one height entry per touched contract; a
//! disconnect applies the reverse deltas and deletes the entries; pruning
//! drops entries below the caller's finality horizon. The caller sequences
//! these writes inside the coin view's tip-transition window so the whole
//! commit is guarded by one head-blocks marker.

use crate::{
    ContractData, ContractError, ContractId, ContractInfo, ContractRecord, ContractResult,
    HeightEntry, StorageDelta,
};
use magna_core::{read_compact_size, write_compact_size, Hash256, InterruptToken, SliceReader};
use magna_storage::{Database, KeyValueStore, WriteBatch};
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Contract record namespace.
const DB_CONTRACT: u8 = b'K';
/// Height index namespace.
const DB_CONTRACT_HEIGHT: u8 = b'h';

fn contract_key(id: &ContractId) -> Vec<u8> {
    let mut key = Vec::with_capacity(21);
    key.push(DB_CONTRACT);
    key.extend_from_slice(id.as_bytes());
    key
}

fn height_key(height: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(5);
    key.push(DB_CONTRACT_HEIGHT);
    key.extend_from_slice(&height.to_be_bytes());
    key
}

/// The contract state store.
pub struct ContractStateDb {
    store: Arc<Database>,
    cache: Mutex<HashMap<ContractId, ContractRecord>>,
}

impl ContractStateDb {
    /// Create a store over `store`.
    pub fn new(store: Arc<Database>) -> Self {
        Self {
            store,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// The current state of `id`, or `None` for an unknown contract.
    pub fn get_info(&self, id: &ContractId) -> ContractResult<Option<ContractInfo>> {
        let mut cache = self.cache.lock();
        Ok(self.record_mut(&mut cache, id)?.map(|r| r.info.clone()))
    }

    /// Reconstruct the state of `id` as of `height` by applying retained
    /// reverse deltas downward. `None` when the contract did not exist at
    /// that height. Heights below the pruning horizon are not
    /// reconstructible.
    pub fn get_info_at(&self, id: &ContractId, height: u32) -> ContractResult<Option<ContractInfo>> {
        let mut cache = self.cache.lock();
        let Some(record) = self.record_mut(&mut cache, id)? else {
            return Ok(None);
        };
        let mut info = record.info.clone();
        for entry in record.heights.iter().rev() {
            if entry.height <= height {
                break;
            }
            if let Some(delta) = &entry.reverse_delta {
                if delta.created {
                    return Ok(None);
                }
                delta.apply_reverse(&mut info.storage);
            }
        }
        Ok(Some(info))
    }

    /// Persist one connected block's contract modifications: update each
    /// touched contract's current state, append its height entry, and
    /// record the height-to-contracts index. One atomic batch.
    pub fn write_block(
        &self,
        height: u32,
        block_hash: Hash256,
        data: &ContractData,
    ) -> ContractResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        let mut cache = self.cache.lock();
        let mut batch = WriteBatch::new();
        let mut touched: Vec<ContractId> = Vec::with_capacity(data.len());

        for (id, new_info) in data {
            // Load (or create) the record first so the borrow below is
            // straightforward.
            let created = match cache.entry(*id) {
                Entry::Occupied(_) => false,
                Entry::Vacant(vacant) => match self.store.get(&contract_key(id))? {
                    Some(bytes) => {
                        vacant.insert(ContractRecord::decode(&bytes)?);
                        false
                    }
                    None => {
                        vacant.insert(ContractRecord {
                            info: new_info.clone(),
                            heights: Vec::new(),
                        });
                        true
                    }
                },
            };
            let record = cache.get_mut(id).expect("record just ensured");

            let delta = if created {
                StorageDelta {
                    entries: Default::default(),
                    created: true,
                }
            } else {
                if let Some(last) = record.heights.last() {
                    if last.height >= height {
                        return Err(ContractError::Corruption(format!(
                            "non-monotonic height entry for contract {id}: {} then {height}",
                            last.height
                        )));
                    }
                }
                let delta = StorageDelta::between(&record.info.storage, &new_info.storage);
                record.info = new_info.clone();
                delta
            };
            record.heights.push(HeightEntry {
                height,
                block_hash,
                reverse_delta: if delta.is_empty() { None } else { Some(delta) },
            });
            batch.put(contract_key(id), record.encode());
            touched.push(*id);
        }

        batch.put(height_key(height), encode_height_index(&block_hash, &touched));
        self.store.write_batch(batch, false)?;
        debug!(height, contracts = touched.len(), "contract block written");
        Ok(())
    }

    /// Undo the block at `height`: apply every touched contract's reverse
    /// delta and delete the height entries. `block_hash` must match the
    /// recorded connecting block.
    pub fn rollback_block(&self, height: u32, block_hash: Hash256) -> ContractResult<()> {
        let Some((recorded_hash, contracts)) = self.contracts_at(height)? else {
            return Ok(());
        };
        if recorded_hash != block_hash {
            return Err(ContractError::Corruption(format!(
                "rollback of height {height} expected block {block_hash}, index has {recorded_hash}"
            )));
        }

        let mut cache = self.cache.lock();
        let mut batch = WriteBatch::new();
        for id in &contracts {
            let Some(record) = self.record_mut(&mut cache, id)? else {
                return Err(ContractError::Corruption(format!(
                    "height index names unknown contract {id}"
                )));
            };
            let Some(entry) = record.heights.pop() else {
                return Err(ContractError::Corruption(format!(
                    "contract {id} has no height entries to roll back"
                )));
            };
            if entry.height != height || entry.block_hash != block_hash {
                return Err(ContractError::Corruption(format!(
                    "contract {id} newest entry is height {}, rolling back {height}",
                    entry.height
                )));
            }
            match entry.reverse_delta {
                Some(delta) if delta.created => {
                    cache.remove(id);
                    batch.delete(contract_key(id));
                }
                Some(delta) => {
                    delta.apply_reverse(&mut record.info.storage);
                    batch.put(contract_key(id), record.encode());
                }
                None => {
                    batch.put(contract_key(id), record.encode());
                }
            }
        }
        batch.delete(height_key(height));
        self.store.write_batch(batch, false)?;
        debug!(height, contracts = contracts.len(), "contract block rolled back");
        Ok(())
    }

    /// Drop snapshot data below the finality horizon. Rollback to any
    /// height at or above `horizon` remains possible; the current state
    /// already incorporates every collapsed delta.
    ///
    /// Interrupt-checked per contract; partial pruning is durable and the
    /// pass is idempotent.
    pub fn prune(&self, horizon: u32, interrupt: &InterruptToken) -> ContractResult<()> {
        let mut batch = WriteBatch::new();
        let mut pruned_contracts = 0usize;

        // Contract records first.
        for (key, value) in self.store.iter_from(&[DB_CONTRACT])? {
            if key.first() != Some(&DB_CONTRACT) {
                break;
            }
            if interrupt.is_requested() {
                self.store.write_batch(batch, false)?;
                return Err(ContractError::Interrupted);
            }
            let mut record = ContractRecord::decode(&value)?;
            let before = record.heights.len();
            record.heights.retain(|entry| entry.height >= horizon);
            if record.heights.len() != before {
                batch.put(key.clone(), record.encode());
                pruned_contracts += 1;
                if let Some(id) = ContractId::from_slice(&key[1..]) {
                    if let Some(cached) = self.cache.lock().get_mut(&id) {
                        cached.heights.retain(|entry| entry.height >= horizon);
                    }
                }
            }
        }

        // Then the height index below the horizon.
        for (key, _) in self.store.iter_from(&[DB_CONTRACT_HEIGHT])? {
            if key.first() != Some(&DB_CONTRACT_HEIGHT) {
                break;
            }
            if key.len() != 5 {
                return Err(ContractError::Corruption("height index key length".into()));
            }
            let height = u32::from_be_bytes(key[1..5].try_into().expect("4 bytes"));
            if height >= horizon {
                break;
            }
            batch.delete(key);
        }

        self.store.write_batch(batch, false)?;
        info!(horizon, pruned_contracts, "contract snapshots pruned");
        Ok(())
    }

    /// The block hash and contract set recorded at `height`, if any block
    /// touching contracts was connected there.
    pub fn contracts_at(&self, height: u32) -> ContractResult<Option<(Hash256, Vec<ContractId>)>> {
        match self.store.get(&height_key(height))? {
            Some(bytes) => Ok(Some(decode_height_index(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Drop the in-memory record cache (records reload on demand).
    pub fn clear_cache(&self) {
        self.cache.lock().clear();
    }

    fn record_mut<'c>(
        &self,
        cache: &'c mut HashMap<ContractId, ContractRecord>,
        id: &ContractId,
    ) -> ContractResult<Option<&'c mut ContractRecord>> {
        match cache.entry(*id) {
            Entry::Occupied(occupied) => Ok(Some(occupied.into_mut())),
            Entry::Vacant(vacant) => match self.store.get(&contract_key(id))? {
                Some(bytes) => Ok(Some(vacant.insert(ContractRecord::decode(&bytes)?))),
                None => Ok(None),
            },
        }
    }
}

fn encode_height_index(block_hash: &Hash256, contracts: &[ContractId]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(33 + contracts.len() * 20);
    buf.extend_from_slice(block_hash.as_bytes());
    write_compact_size(&mut buf, contracts.len() as u64);
    for id in contracts {
        buf.extend_from_slice(id.as_bytes());
    }
    buf
}

fn decode_height_index(bytes: &[u8]) -> ContractResult<(Hash256, Vec<ContractId>)> {
    let mut reader = SliceReader::new(bytes);
    let block_hash = Hash256::from_bytes(reader.read_array_32()?);
    let count = read_compact_size(&mut reader)? as usize;
    let mut contracts = Vec::with_capacity(count);
    for _ in 0..count {
        let id = ContractId::from_slice(reader.read_bytes(20)?)
            .expect("20 bytes");
        contracts.push(id);
    }
    Ok((block_hash, contracts))
}
