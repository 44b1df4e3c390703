//! Durable coin database: the bottom layer of the view stack.
//!
//! Commits follow a two-marker protocol so a crash at any point leaves the
//! database either at the old tip or verifiably mid-transition:
//!
//! 1. the first batch erases the best-block record and writes the
//!    head-blocks marker `[target, previous]`
//! 2. dirty coin entries stream to disk in size-bounded batches
//! 3. the address index flushes
//! 4. the final batch erases the marker and writes the best-block record
//!
//! The backend preserves write order, so the marker is on disk before any
//! coin data of the new tip.

use crate::{
    keys, ChainStateConfig, ChainStateError, ChainStateResult, CoinListDb, CoinsMap, CoinsView,
};
use magna_core::{
    read_compact_size, read_varint, write_compact_size, write_varint, Coin, Hash256, InterruptToken,
    OutPoint, ProgressFn, SliceReader, TxOut,
};
use magna_storage::{Database, KeyValueStore, WriteBatch};
use rand::Rng;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The durable coin view backed by the `chainstate/` database.
pub struct CoinsViewDb {
    store: Arc<Database>,
    batch_size: usize,
    crash_ratio: u32,
    addr_index: Option<Arc<CoinListDb>>,
}

impl CoinsViewDb {
    /// Create a view over `store` with the given commit tuning.
    pub fn new(store: Arc<Database>, config: &ChainStateConfig) -> Self {
        Self {
            store,
            batch_size: config.db_batch_size,
            crash_ratio: config.db_crash_ratio,
            addr_index: None,
        }
    }

    /// Attach the address index flushed inside every commit.
    pub fn attach_address_index(&mut self, index: Arc<CoinListDb>) {
        self.addr_index = Some(index);
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<Database> {
        &self.store
    }

    /// Whether legacy per-transaction records are present and the upgrade
    /// pass must run before the view is usable.
    pub fn needs_upgrade(&self) -> ChainStateResult<bool> {
        let mut iter = self.store.iter_from(&[keys::DB_COINS_LEGACY])?;
        Ok(matches!(iter.next(), Some((key, _)) if key.first() == Some(&keys::DB_COINS_LEGACY)))
    }

    /// Startup format check: fails with
    /// [`ChainStateError::UpgradeRequired`] while legacy records remain.
    /// The caller runs [`Self::upgrade`] and retries.
    pub fn check_format(&self) -> ChainStateResult<()> {
        if self.needs_upgrade()? {
            return Err(ChainStateError::UpgradeRequired);
        }
        Ok(())
    }

    /// Convert every legacy per-transaction record into per-output
    /// records.
    ///
    /// The pass is interruptible: work completed so far is durable, and
    /// rerunning after an interruption continues where it stopped.
    /// Progress is reported through `progress` in 1% increments.
    pub fn upgrade(
        &self,
        interrupt: &InterruptToken,
        progress: Option<&ProgressFn>,
    ) -> ChainStateResult<()> {
        info!("upgrading coin database to per-output records");

        let mut batch = WriteBatch::new();
        let mut count: u64 = 0;
        let mut reported = 0u32;
        let mut prev_key = vec![keys::DB_COINS_LEGACY];
        let mut interrupted = false;
        let mut last_key = prev_key.clone();

        for (key, value) in self.store.iter_from(&[keys::DB_COINS_LEGACY])? {
            if key.first() != Some(&keys::DB_COINS_LEGACY) {
                break;
            }
            if interrupt.is_requested() {
                interrupted = true;
                break;
            }
            if key.len() != 33 {
                return Err(ChainStateError::Corruption("legacy coin key length".into()));
            }

            if count % 256 == 0 {
                let high = (key[1] as u32) << 8 | key[2] as u32;
                let pct = (high * 100 + 32768) / 65536;
                if pct > reported {
                    reported = pct;
                    if let Some(progress) = progress {
                        progress(pct);
                    }
                }
            }
            count += 1;

            let txid = Hash256::from_slice(&key[1..33])
                .ok_or_else(|| ChainStateError::Corruption("legacy coin key length".into()))?;
            let legacy = LegacyCoinsRecord::decode(&value)?;
            for (index, out) in legacy.outputs.into_iter().enumerate() {
                let Some(out) = out else { continue };
                if out.script.is_unspendable() {
                    continue;
                }
                let coin = Coin::new(out, legacy.height, legacy.is_coinbase);
                let outpoint = OutPoint::new(txid, index as u32);
                batch.put(keys::coin_key(&outpoint), coin.consensus_encode());
            }
            batch.delete(key.clone());
            last_key = key.clone();

            if batch.size_estimate() > self.batch_size {
                self.store
                    .write_batch(std::mem::take(&mut batch), false)?;
                self.store.compact_range(&prev_key, &key);
                prev_key = key;
            }
        }

        self.store.write_batch(batch, false)?;
        self.store
            .compact_range(&[keys::DB_COINS_LEGACY], &last_key);

        if interrupted {
            info!(converted = count, "coin database upgrade interrupted");
            return Err(ChainStateError::Interrupted);
        }
        info!(converted = count, "coin database upgrade done");
        Ok(())
    }

    /// Scan the whole coin set and accumulate summary statistics.
    pub fn stats(&self, interrupt: &InterruptToken) -> ChainStateResult<CoinsStats> {
        let mut stats = CoinsStats {
            best_block: self.best_block()?,
            ..CoinsStats::default()
        };
        for item in self.cursor()? {
            if interrupt.is_requested() {
                return Err(ChainStateError::Interrupted);
            }
            let (_, coin) = item?;
            stats.tx_outputs += 1;
            stats.total_amount += coin.out.amount;
        }
        stats.disk_size = self.estimate_size()?;
        Ok(stats)
    }

    fn maybe_simulate_crash(&self) {
        if self.crash_ratio == 0 {
            return;
        }
        if rand::thread_rng().gen_range(0..self.crash_ratio) == 0 {
            warn!("simulating a crash, goodbye");
            std::process::exit(0);
        }
    }
}

impl CoinsView for CoinsViewDb {
    fn get_coin(&self, outpoint: &OutPoint) -> ChainStateResult<Option<Coin>> {
        match self.store.get(&keys::coin_key(outpoint))? {
            Some(bytes) => Ok(Some(Coin::consensus_decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn have_coin(&self, outpoint: &OutPoint) -> ChainStateResult<bool> {
        Ok(self.store.exists(&keys::coin_key(outpoint))?)
    }

    fn best_block(&self) -> ChainStateResult<Option<Hash256>> {
        match self.store.get(&[keys::DB_BEST_BLOCK])? {
            Some(bytes) => Hash256::from_slice(&bytes)
                .map(Some)
                .ok_or_else(|| ChainStateError::Corruption("best block record length".into())),
            None => Ok(None),
        }
    }

    fn head_blocks(&self) -> ChainStateResult<Vec<Hash256>> {
        match self.store.get(&[keys::DB_HEAD_BLOCKS])? {
            Some(bytes) => decode_hash_list(&bytes),
            None => Ok(Vec::new()),
        }
    }

    fn batch_write(&self, coins: &mut CoinsMap, tip: Hash256) -> ChainStateResult<()> {
        self.commit(coins, tip, || Ok(()))
    }

    fn cursor(
        &self,
    ) -> ChainStateResult<Box<dyn Iterator<Item = ChainStateResult<(OutPoint, Coin)>> + '_>> {
        let iter = self.store.iter_from(&[keys::DB_COIN])?;
        Ok(Box::new(
            iter.take_while(|(key, _)| key.first() == Some(&keys::DB_COIN))
                .map(|(key, value)| {
                    let outpoint = keys::parse_coin_key(&key)?;
                    let coin = Coin::consensus_decode(&value)?;
                    Ok((outpoint, coin))
                }),
        ))
    }

    fn estimate_size(&self) -> ChainStateResult<u64> {
        Ok(self
            .store
            .estimate_size(&[keys::DB_COIN], &[keys::DB_COIN + 1])?)
    }
}

impl CoinsViewDb {
    /// The durable commit. Identical to
    /// [`CoinsView::batch_write`], except that `companion` runs inside
    /// the tip-transition window — after the coin data and reverse-index
    /// writes, before the final batch that flips the tip. Writes the
    /// companion issues (block index, contract state) are therefore
    /// guarded by the same head-blocks marker: a crash anywhere in the
    /// window leaves the transitional form on disk and the caller
    /// replays from the previous tip.
    pub fn commit(
        &self,
        coins: &mut CoinsMap,
        tip: Hash256,
        companion: impl FnOnce() -> ChainStateResult<()>,
    ) -> ChainStateResult<()> {
        assert!(!tip.is_zero(), "batch write with null tip");

        let mut old_tip = self.best_block()?;
        if old_tip.is_none() {
            // We may be resuming a commit that was interrupted mid-way.
            let heads = self.head_blocks()?;
            if heads.len() == 2 {
                assert_eq!(heads[0], tip, "resumed commit targets a different tip");
                old_tip = Some(heads[1]);
            }
        }

        // The reverse index interprets the dirty entries before the map
        // is drained below.
        if let Some(index) = &self.addr_index {
            index.ingest(coins)?;
        }

        // First batch: mark the database as transitioning to `tip`.
        let mut batch = WriteBatch::new();
        batch.delete([keys::DB_BEST_BLOCK]);
        batch.put(
            [keys::DB_HEAD_BLOCKS],
            encode_hash_list(&[tip, old_tip.unwrap_or(Hash256::ZERO)]),
        );

        let mut count: usize = 0;
        let mut changed: usize = 0;
        for (outpoint, entry) in std::mem::take(coins) {
            count += 1;
            if !entry.is_dirty() {
                continue;
            }
            let key = keys::coin_key(&outpoint);
            if entry.coin.is_spent() {
                batch.delete(key);
            } else {
                batch.put(key, entry.coin.consensus_encode());
            }
            changed += 1;

            if batch.size_estimate() > self.batch_size {
                debug!(
                    mib = batch.size_estimate() as f64 / 1048576.0,
                    "writing partial coin batch"
                );
                self.store.write_batch(std::mem::take(&mut batch), false)?;
                self.maybe_simulate_crash();
            }
        }

        // Tail coin data must land before the reverse index does.
        if !batch.is_empty() {
            self.store.write_batch(std::mem::take(&mut batch), false)?;
        }

        if let Some(index) = &self.addr_index {
            index.flush()?;
        }

        // Companion writes (block index, contract state) land inside the
        // marker window.
        companion()?;

        // Final batch: consistent with `tip` again.
        let mut batch = WriteBatch::new();
        batch.delete([keys::DB_HEAD_BLOCKS]);
        batch.put([keys::DB_BEST_BLOCK], tip.as_bytes().to_vec());
        self.store.write_batch(batch, true)?;

        debug!(changed, count, tip = %tip, "committed coin database");
        Ok(())
    }
}

/// Summary of a full coin-set scan.
#[derive(Debug, Clone, Default)]
pub struct CoinsStats {
    /// Tip the scan is consistent with.
    pub best_block: Option<Hash256>,
    /// Number of live outputs.
    pub tx_outputs: u64,
    /// Sum of all output amounts.
    pub total_amount: i64,
    /// Approximate on-disk size of the coin namespace.
    pub disk_size: u64,
}

/// A legacy per-transaction coin record, the `c`-prefixed format the
/// upgrade pass consumes.
///
/// Layout: varint(height << 1 | coinbase) ‖ compact-size output count ‖
/// per output a presence byte followed, when present, by varint(amount) ‖
/// varint(script length) ‖ script bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyCoinsRecord {
    /// Height of the containing block.
    pub height: u32,
    /// Whether the transaction was a coinbase.
    pub is_coinbase: bool,
    /// Outputs; spent ones are `None`.
    pub outputs: Vec<Option<TxOut>>,
}

impl LegacyCoinsRecord {
    /// Encode to the legacy wire format.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        write_varint(
            &mut buf,
            ((self.height as u64) << 1) | self.is_coinbase as u64,
        );
        write_compact_size(&mut buf, self.outputs.len() as u64);
        for out in &self.outputs {
            match out {
                Some(out) => {
                    buf.push(1);
                    write_varint(&mut buf, out.amount as u64);
                    write_varint(&mut buf, out.script.len() as u64);
                    buf.extend_from_slice(out.script.as_bytes());
                }
                None => buf.push(0),
            }
        }
        buf
    }

    /// Decode from the legacy wire format.
    pub fn decode(bytes: &[u8]) -> ChainStateResult<Self> {
        let mut reader = SliceReader::new(bytes);
        let code = read_varint(&mut reader)?;
        let height = u32::try_from(code >> 1)
            .map_err(|_| ChainStateError::Corruption("legacy coin height".into()))?;
        let is_coinbase = code & 1 == 1;
        let count = read_compact_size(&mut reader)? as usize;
        let mut outputs = Vec::with_capacity(count);
        for _ in 0..count {
            match reader.read_u8()? {
                0 => outputs.push(None),
                1 => {
                    let amount = read_varint(&mut reader)? as i64;
                    let script_len = read_varint(&mut reader)? as usize;
                    let script =
                        magna_core::Script::from_bytes(reader.read_bytes(script_len)?.to_vec());
                    outputs.push(Some(TxOut::new(amount, script)));
                }
                _ => {
                    return Err(ChainStateError::Corruption(
                        "legacy coin presence byte".into(),
                    ))
                }
            }
        }
        Ok(Self {
            height,
            is_coinbase,
            outputs,
        })
    }
}

fn encode_hash_list(hashes: &[Hash256]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + hashes.len() * 32);
    write_compact_size(&mut buf, hashes.len() as u64);
    for hash in hashes {
        buf.extend_from_slice(hash.as_bytes());
    }
    buf
}

fn decode_hash_list(bytes: &[u8]) -> ChainStateResult<Vec<Hash256>> {
    let mut reader = SliceReader::new(bytes);
    let count = read_compact_size(&mut reader)? as usize;
    let mut hashes = Vec::with_capacity(count);
    for _ in 0..count {
        hashes.push(Hash256::from_bytes(reader.read_array_32()?));
    }
    Ok(hashes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CacheEntry;
    use magna_core::{AddressKey, Script};
    use tempfile::TempDir;

    fn open_db(tmp: &TempDir) -> CoinsViewDb {
        let store = Arc::new(Database::open(tmp.path()).unwrap());
        CoinsViewDb::new(store, &ChainStateConfig::default())
    }

    fn live_entry(amount: i64, height: u32) -> CacheEntry {
        let script = Script::pay_to_key_hash(&AddressKey::from_bytes([1; 20]));
        CacheEntry {
            coin: Coin::new(TxOut::new(amount, script), height, false),
            flags: CacheEntry::DIRTY | CacheEntry::FRESH,
        }
    }

    fn spent_entry() -> CacheEntry {
        CacheEntry {
            coin: Coin::spent(),
            flags: CacheEntry::DIRTY,
        }
    }

    fn outpoint(n: u8) -> OutPoint {
        OutPoint::new(Hash256::from_bytes([n; 32]), 0)
    }

    #[test]
    fn flush_sets_best_block_and_clears_marker() {
        let tmp = TempDir::new().unwrap();
        let db = open_db(&tmp);
        let tip = Hash256::from_bytes([0xA1; 32]);

        let mut map = CoinsMap::new();
        map.insert(outpoint(1), live_entry(50, 0));
        db.batch_write(&mut map, tip).unwrap();

        assert!(map.is_empty());
        assert_eq!(db.best_block().unwrap(), Some(tip));
        assert!(db.head_blocks().unwrap().is_empty());
        assert!(db.have_coin(&outpoint(1)).unwrap());
    }

    #[test]
    fn spend_erases_the_record() {
        let tmp = TempDir::new().unwrap();
        let db = open_db(&tmp);

        let mut map = CoinsMap::new();
        map.insert(outpoint(2), live_entry(10, 1));
        db.batch_write(&mut map, Hash256::from_bytes([0xB1; 32]))
            .unwrap();

        let mut map = CoinsMap::new();
        map.insert(outpoint(2), spent_entry());
        db.batch_write(&mut map, Hash256::from_bytes([0xB2; 32]))
            .unwrap();

        assert!(!db.have_coin(&outpoint(2)).unwrap());
        assert_eq!(
            db.best_block().unwrap(),
            Some(Hash256::from_bytes([0xB2; 32]))
        );
    }

    #[test]
    fn non_dirty_entries_are_not_written() {
        let tmp = TempDir::new().unwrap();
        let db = open_db(&tmp);

        let mut map = CoinsMap::new();
        let mut entry = live_entry(10, 1);
        entry.flags = 0;
        map.insert(outpoint(3), entry);
        db.batch_write(&mut map, Hash256::from_bytes([0xC1; 32]))
            .unwrap();

        assert!(!db.have_coin(&outpoint(3)).unwrap());
    }

    #[test]
    fn cursor_iterates_in_key_order() {
        let tmp = TempDir::new().unwrap();
        let db = open_db(&tmp);

        let mut map = CoinsMap::new();
        for n in [9u8, 3, 6] {
            map.insert(outpoint(n), live_entry(n as i64, 1));
        }
        db.batch_write(&mut map, Hash256::from_bytes([0xD1; 32]))
            .unwrap();

        let outs: Vec<OutPoint> = db
            .cursor()
            .unwrap()
            .map(|item| item.unwrap().0)
            .collect();
        assert_eq!(outs, vec![outpoint(3), outpoint(6), outpoint(9)]);
    }

    #[test]
    fn stats_sum_the_coin_set() {
        let tmp = TempDir::new().unwrap();
        let db = open_db(&tmp);

        let mut map = CoinsMap::new();
        for n in 1..=4u8 {
            map.insert(outpoint(n), live_entry(n as i64 * 100, 1));
        }
        db.batch_write(&mut map, Hash256::from_bytes([0xE1; 32]))
            .unwrap();

        let stats = db.stats(&InterruptToken::new()).unwrap();
        assert_eq!(stats.tx_outputs, 4);
        assert_eq!(stats.total_amount, 1000);
        assert_eq!(stats.best_block, Some(Hash256::from_bytes([0xE1; 32])));
    }

    #[test]
    fn legacy_record_roundtrips() {
        let record = LegacyCoinsRecord {
            height: 77,
            is_coinbase: true,
            outputs: vec![
                Some(TxOut::new(
                    12,
                    Script::pay_to_key_hash(&AddressKey::from_bytes([4; 20])),
                )),
                None,
                Some(TxOut::new(34, Script::op_return(b"x"))),
            ],
        };
        assert_eq!(
            LegacyCoinsRecord::decode(&record.encode()).unwrap(),
            record
        );
    }

    #[test]
    fn upgrade_converts_and_erases_legacy_records() {
        let tmp = TempDir::new().unwrap();
        let db = open_db(&tmp);

        let txid = Hash256::from_bytes([0x42; 32]);
        let record = LegacyCoinsRecord {
            height: 5,
            is_coinbase: false,
            outputs: vec![
                Some(TxOut::new(
                    100,
                    Script::pay_to_key_hash(&AddressKey::from_bytes([7; 20])),
                )),
                None,
                // Unspendable outputs are dropped by the upgrade.
                Some(TxOut::new(0, Script::op_return(b"data"))),
                Some(TxOut::new(
                    25,
                    Script::pay_to_key_hash(&AddressKey::from_bytes([8; 20])),
                )),
            ],
        };

        let mut batch = WriteBatch::new();
        batch.put(keys::legacy_coin_key(&txid), record.encode());
        db.store().write_batch(batch, false).unwrap();

        assert!(db.needs_upgrade().unwrap());
        assert!(matches!(
            db.check_format(),
            Err(ChainStateError::UpgradeRequired)
        ));
        db.upgrade(&InterruptToken::new(), None).unwrap();
        assert!(!db.needs_upgrade().unwrap());
        db.check_format().unwrap();

        assert!(db.have_coin(&OutPoint::new(txid, 0)).unwrap());
        assert!(!db.have_coin(&OutPoint::new(txid, 1)).unwrap());
        assert!(!db.have_coin(&OutPoint::new(txid, 2)).unwrap());
        let coin = db.get_coin(&OutPoint::new(txid, 3)).unwrap().unwrap();
        assert_eq!(coin.out.amount, 25);
        assert_eq!(coin.height, 5);
    }

    #[test]
    fn interrupted_upgrade_reports_and_resumes() {
        let tmp = TempDir::new().unwrap();
        let db = open_db(&tmp);

        let mut batch = WriteBatch::new();
        for n in 0..10u8 {
            let txid = Hash256::from_bytes([n; 32]);
            let record = LegacyCoinsRecord {
                height: 1,
                is_coinbase: false,
                outputs: vec![Some(TxOut::new(
                    1,
                    Script::pay_to_key_hash(&AddressKey::from_bytes([n; 20])),
                ))],
            };
            batch.put(keys::legacy_coin_key(&txid), record.encode());
        }
        db.store().write_batch(batch, false).unwrap();

        let interrupt = InterruptToken::new();
        interrupt.request();
        assert!(matches!(
            db.upgrade(&interrupt, None),
            Err(ChainStateError::Interrupted)
        ));

        // A second, uninterrupted run completes the pass.
        db.upgrade(&InterruptToken::new(), None).unwrap();
        assert!(!db.needs_upgrade().unwrap());
    }
}
