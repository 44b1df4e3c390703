//! Address-to-coin reverse index.
//!
//! Driven by the same dirty-entry stream the coin view flushes: every
//! dirty outpoint is resolved to a destination and the owning address's
//! coin list is updated. The index is advisory — a malformed or
//! unresolvable script skips the entry rather than failing the commit.

use crate::{keys, ChainStateResult, CoinsMap};
use magna_core::{
    read_compact_size, read_varint, write_compact_size, write_varint, AddressKey, Coin,
    Destination, Hash256, OutPoint, Script, SliceReader,
};
use magna_storage::{Database, KeyValueStore, WriteBatch};
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// The ordered outpoints currently owned by one address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoinList {
    /// Outpoints in first-seen order.
    pub coins: Vec<OutPoint>,
}

impl CoinList {
    /// Encode: compact-size count, then txid ‖ varint(index) per coin.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + self.coins.len() * 33);
        write_compact_size(&mut buf, self.coins.len() as u64);
        for outpoint in &self.coins {
            buf.extend_from_slice(outpoint.txid.as_bytes());
            write_varint(&mut buf, outpoint.index as u64);
        }
        buf
    }

    /// Decode a stored list.
    pub fn decode(bytes: &[u8]) -> ChainStateResult<Self> {
        let mut reader = SliceReader::new(bytes);
        let count = read_compact_size(&mut reader)? as usize;
        let mut coins = Vec::with_capacity(count);
        for _ in 0..count {
            let txid = Hash256::from_bytes(reader.read_array_32()?);
            let index = read_varint(&mut reader)? as u32;
            coins.push(OutPoint::new(txid, index));
        }
        Ok(Self { coins })
    }
}

/// The address index over the `A` namespace of the chainstate database.
pub struct CoinListDb {
    store: Arc<Database>,
    batch_size: usize,
    cache: Mutex<HashMap<AddressKey, CoinList>>,
}

impl CoinListDb {
    /// Create an index over `store`.
    pub fn new(store: Arc<Database>, batch_size: usize) -> Self {
        Self {
            store,
            batch_size,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Interpret a dirty coin map, updating the in-memory lists.
    ///
    /// Lists are loaded lazily on first touch. Called by the coin
    /// database at the start of every commit, before the map is drained.
    pub fn ingest(&self, coins: &CoinsMap) -> ChainStateResult<()> {
        let mut cache = self.cache.lock();
        for (outpoint, entry) in coins {
            if !entry.is_dirty() {
                continue;
            }
            let Some(addr) = self.resolve(outpoint, &entry.coin)? else {
                continue;
            };

            let list = match cache.entry(addr) {
                Entry::Occupied(occupied) => occupied.into_mut(),
                Entry::Vacant(vacant) => {
                    let loaded = match self.store.get(&keys::coin_list_key(&addr))? {
                        Some(bytes) => CoinList::decode(&bytes)?,
                        None => CoinList::default(),
                    };
                    vacant.insert(loaded)
                }
            };

            if entry.coin.is_spent() {
                if let Some(pos) = list.coins.iter().position(|o| o == outpoint) {
                    list.coins.remove(pos);
                }
            } else if list.coins.contains(outpoint) {
                // Crash replay can feed the same creation twice; the
                // duplicate is harmless.
                warn!(%outpoint, %addr, "re-adding outpoint already in coin list");
            } else {
                list.coins.push(*outpoint);
            }
        }
        Ok(())
    }

    /// Write every touched list and drop the cache.
    ///
    /// Runs inside the coin commit, after the coin data and before the
    /// final tip batch, so an observer that sees an indexed outpoint also
    /// finds its coin.
    pub fn flush(&self) -> ChainStateResult<()> {
        let mut cache = self.cache.lock();
        let mut batch = WriteBatch::new();
        let mut total_coins = 0usize;

        for (addr, list) in cache.iter() {
            total_coins += list.coins.len();
            let key = keys::coin_list_key(addr);
            if list.coins.is_empty() {
                batch.delete(key);
            } else {
                batch.put(key, list.encode());
            }
            if batch.size_estimate() > self.batch_size {
                debug!(
                    mib = batch.size_estimate() as f64 / 1048576.0,
                    "writing partial coin-list batch"
                );
                self.store.write_batch(std::mem::take(&mut batch), false)?;
            }
        }

        self.store.write_batch(batch, false)?;
        debug!(
            addresses = cache.len(),
            total_coins, "flushed address index"
        );
        cache.clear();
        Ok(())
    }

    /// The coin list for `addr`: the cached copy if one is loaded, else a
    /// fresh read.
    pub fn get_list(&self, addr: &AddressKey) -> ChainStateResult<CoinList> {
        if let Some(list) = self.cache.lock().get(addr) {
            return Ok(list.clone());
        }
        match self.store.get(&keys::coin_list_key(addr))? {
            Some(bytes) => CoinList::decode(&bytes),
            None => Ok(CoinList::default()),
        }
    }

    /// Resolve the address a dirty entry belongs to, or `None` when the
    /// entry is not indexable.
    ///
    /// A spent entry carries no script, so the durable record is consulted
    /// to recover it; if the coin never reached disk there is nothing to
    /// remove and the entry is skipped.
    fn resolve(&self, outpoint: &OutPoint, coin: &Coin) -> ChainStateResult<Option<AddressKey>> {
        let script: Script;
        let is_coinbase;
        if coin.is_spent() {
            match self.store.get(&keys::coin_key(outpoint))? {
                Some(bytes) => {
                    let db_coin = Coin::consensus_decode(&bytes)?;
                    is_coinbase = db_coin.is_coinbase;
                    script = db_coin.out.script;
                }
                None => return Ok(None),
            }
        } else {
            is_coinbase = coin.is_coinbase;
            script = coin.out.script.clone();
        }

        if is_coinbase {
            return Ok(None);
        }
        match script.destination() {
            Destination::KeyHash(addr) => Ok(Some(addr)),
            // A branch transfer resolves to a derived key-hash address.
            Destination::BranchTransfer(addr) => Ok(Some(addr)),
            Destination::ScriptHash(_) | Destination::Contract(_) | Destination::Unresolved => {
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CacheEntry;
    use magna_core::TxOut;
    use tempfile::TempDir;

    fn setup() -> (CoinListDb, Arc<Database>, TempDir) {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(Database::open(tmp.path()).unwrap());
        (CoinListDb::new(Arc::clone(&store), 1 << 20), store, tmp)
    }

    fn outpoint(n: u8) -> OutPoint {
        OutPoint::new(Hash256::from_bytes([n; 32]), 0)
    }

    fn addr(n: u8) -> AddressKey {
        AddressKey::from_bytes([n; 20])
    }

    fn dirty_live(addr_byte: u8, coinbase: bool) -> CacheEntry {
        let script = Script::pay_to_key_hash(&addr(addr_byte));
        CacheEntry {
            coin: Coin::new(TxOut::new(10, script), 1, coinbase),
            flags: CacheEntry::DIRTY,
        }
    }

    #[test]
    fn live_coin_is_indexed_under_its_address() {
        let (index, _store, _tmp) = setup();
        let mut map = CoinsMap::new();
        map.insert(outpoint(1), dirty_live(0x11, false));

        index.ingest(&map).unwrap();
        index.flush().unwrap();

        let list = index.get_list(&addr(0x11)).unwrap();
        assert_eq!(list.coins, vec![outpoint(1)]);
    }

    #[test]
    fn coinbase_and_script_hash_are_skipped() {
        let (index, _store, _tmp) = setup();
        let mut map = CoinsMap::new();
        map.insert(outpoint(1), dirty_live(0x22, true));
        let p2sh = CacheEntry {
            coin: Coin::new(
                TxOut::new(5, Script::pay_to_script_hash(&addr(0x33))),
                1,
                false,
            ),
            flags: CacheEntry::DIRTY,
        };
        map.insert(outpoint(2), p2sh);

        index.ingest(&map).unwrap();
        index.flush().unwrap();

        assert!(index.get_list(&addr(0x22)).unwrap().coins.is_empty());
        assert!(index.get_list(&addr(0x33)).unwrap().coins.is_empty());
    }

    #[test]
    fn non_dirty_entries_are_ignored() {
        let (index, _store, _tmp) = setup();
        let mut map = CoinsMap::new();
        let mut entry = dirty_live(0x44, false);
        entry.flags = 0;
        map.insert(outpoint(1), entry);

        index.ingest(&map).unwrap();
        assert!(index.get_list(&addr(0x44)).unwrap().coins.is_empty());
    }

    #[test]
    fn duplicate_add_is_ignored() {
        let (index, _store, _tmp) = setup();
        let mut map = CoinsMap::new();
        map.insert(outpoint(1), dirty_live(0x55, false));

        index.ingest(&map).unwrap();
        index.ingest(&map).unwrap();
        index.flush().unwrap();

        assert_eq!(index.get_list(&addr(0x55)).unwrap().coins.len(), 1);
    }

    #[test]
    fn spend_recovers_script_from_durable_record() {
        let (index, store, _tmp) = setup();

        // Persist the coin record the way a prior commit would have.
        let script = Script::pay_to_key_hash(&addr(0x66));
        let coin = Coin::new(TxOut::new(9, script), 3, false);
        let mut batch = WriteBatch::new();
        batch.put(keys::coin_key(&outpoint(7)), coin.consensus_encode());
        batch.put(
            keys::coin_list_key(&addr(0x66)),
            CoinList {
                coins: vec![outpoint(7)],
            }
            .encode(),
        );
        store.write_batch(batch, false).unwrap();

        // The spend arrives as a dirty spent entry with no script.
        let mut map = CoinsMap::new();
        map.insert(
            outpoint(7),
            CacheEntry {
                coin: Coin::spent(),
                flags: CacheEntry::DIRTY,
            },
        );
        index.ingest(&map).unwrap();
        index.flush().unwrap();

        assert!(index.get_list(&addr(0x66)).unwrap().coins.is_empty());
    }

    #[test]
    fn flush_clears_the_cache_and_persists() {
        let (index, store, _tmp) = setup();
        let mut map = CoinsMap::new();
        map.insert(outpoint(1), dirty_live(0x77, false));

        index.ingest(&map).unwrap();
        index.flush().unwrap();
        assert!(index.cache.lock().is_empty());

        // Readable straight from disk after the cache is gone.
        let raw = store.get(&keys::coin_list_key(&addr(0x77))).unwrap();
        assert!(raw.is_some());
        let list = CoinList::decode(&raw.unwrap()).unwrap();
        assert_eq!(list.coins, vec![outpoint(1)]);
    }

    #[test]
    fn coin_list_roundtrips() {
        let list = CoinList {
            coins: vec![outpoint(1), OutPoint::new(Hash256::from_bytes([2; 32]), 300)],
        };
        assert_eq!(CoinList::decode(&list.encode()).unwrap(), list);
    }
}
