//! Layered views over the coin (UTXO) set.
//!
//! A view stack has the durable [`crate::CoinsViewDb`] at the bottom and
//! one or more [`CoinsViewCache`] layers above it. The top layer is a
//! transient per-block view used during validation; flushing pushes dirty
//! entries down one level at a time, terminating at the database.

use crate::ChainStateResult;
use magna_core::{Coin, Hash256, OutPoint};
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use tracing::trace;

/// A cached coin plus its layering flags.
#[derive(Clone, Debug)]
pub struct CacheEntry {
    /// The coin (a spent placeholder once spent).
    pub coin: Coin,
    /// Combination of [`CacheEntry::DIRTY`] and [`CacheEntry::FRESH`].
    pub flags: u8,
}

impl CacheEntry {
    /// The entry differs from the parent view; a write is owed downward.
    pub const DIRTY: u8 = 1 << 0;
    /// The entry is known absent from every lower view, so a spend can
    /// erase it outright instead of writing a tombstone.
    pub const FRESH: u8 = 1 << 1;

    /// A plain memoized entry.
    pub fn plain(coin: Coin) -> Self {
        Self { coin, flags: 0 }
    }

    /// Whether the DIRTY flag is set.
    pub fn is_dirty(&self) -> bool {
        self.flags & Self::DIRTY != 0
    }

    /// Whether the FRESH flag is set.
    pub fn is_fresh(&self) -> bool {
        self.flags & Self::FRESH != 0
    }
}

/// The dirty-entry map a flush hands down to the next view.
pub type CoinsMap = HashMap<OutPoint, CacheEntry>;

/// A view over the coin set.
///
/// Implementors are the durable database view, the in-memory cache layer
/// and transient per-block snapshots (which are cache layers over a cache).
pub trait CoinsView: Send + Sync {
    /// Look up a live coin. Spent and unknown outpoints are `None`.
    fn get_coin(&self, outpoint: &OutPoint) -> ChainStateResult<Option<Coin>>;

    /// Whether a live coin exists at `outpoint`.
    fn have_coin(&self, outpoint: &OutPoint) -> ChainStateResult<bool> {
        Ok(self.get_coin(outpoint)?.is_some())
    }

    /// The tip this view's contents are consistent with, if any.
    fn best_block(&self) -> ChainStateResult<Option<Hash256>>;

    /// The transitional `[target, previous]` marker if a commit was in
    /// progress, otherwise empty.
    fn head_blocks(&self) -> ChainStateResult<Vec<Hash256>> {
        Ok(Vec::new())
    }

    /// Consume `coins`' dirty entries and make this view consistent with
    /// `tip`. Entries are removed from the map as they are consumed.
    ///
    /// # Panics
    ///
    /// Panics if `tip` is the zero hash, or on flag combinations that
    /// indicate a caller bug (FRESH entry overwriting a live parent coin).
    fn batch_write(&self, coins: &mut CoinsMap, tip: Hash256) -> ChainStateResult<()>;

    /// Key-ordered iteration over every live coin, from a snapshot taken
    /// at creation. Views without durable backing yield nothing.
    fn cursor(
        &self,
    ) -> ChainStateResult<Box<dyn Iterator<Item = ChainStateResult<(OutPoint, Coin)>> + '_>> {
        Ok(Box::new(std::iter::empty()))
    }

    /// Approximate on-disk footprint of the coin namespace.
    fn estimate_size(&self) -> ChainStateResult<u64> {
        Ok(0)
    }
}

struct CacheInner {
    map: CoinsMap,
    best_block: Option<Hash256>,
    /// Running estimate of cached coin bytes, used for eviction decisions
    /// by the caller.
    usage: usize,
}

/// In-memory coin cache layered over a parent view.
pub struct CoinsViewCache<'a> {
    parent: &'a dyn CoinsView,
    inner: Mutex<CacheInner>,
}

impl<'a> CoinsViewCache<'a> {
    /// Create an empty cache over `parent`.
    pub fn new(parent: &'a dyn CoinsView) -> Self {
        Self {
            parent,
            inner: Mutex::new(CacheInner {
                map: CoinsMap::new(),
                best_block: None,
                usage: 0,
            }),
        }
    }

    /// Number of entries currently cached.
    pub fn cache_size(&self) -> usize {
        self.inner.lock().map.len()
    }

    /// Estimated bytes held by cached coins.
    pub fn memory_usage(&self) -> usize {
        self.inner.lock().usage
    }

    /// Whether `outpoint` has an entry in this layer (live or spent),
    /// without consulting the parent.
    pub fn have_coin_in_cache(&self, outpoint: &OutPoint) -> bool {
        self.inner.lock().map.contains_key(outpoint)
    }

    /// Record the tip this cache's contents correspond to.
    pub fn set_best_block(&self, hash: Hash256) {
        self.inner.lock().best_block = Some(hash);
    }

    /// Add a coin at `outpoint`.
    ///
    /// With `possible_overwrite` false (the normal case) the outpoint must
    /// not currently hold a live coin; the new entry is marked FRESH when
    /// the previous state owed no write to the parent.
    ///
    /// # Panics
    ///
    /// Panics when overwriting a live coin without `possible_overwrite` —
    /// the caller fed an already-created output.
    pub fn add_coin(&self, outpoint: OutPoint, coin: Coin, possible_overwrite: bool) {
        assert!(!coin.is_spent(), "adding a spent coin");
        let mut guard = self.inner.lock();
        let CacheInner { map, usage, .. } = &mut *guard;
        match map.entry(outpoint) {
            Entry::Vacant(vacant) => {
                let fresh = !possible_overwrite;
                *usage += coin.memory_usage();
                vacant.insert(CacheEntry {
                    coin,
                    flags: CacheEntry::DIRTY | if fresh { CacheEntry::FRESH } else { 0 },
                });
                trace!(%outpoint, fresh, "coin added to cache");
            }
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                let mut fresh = false;
                if !possible_overwrite {
                    assert!(
                        entry.coin.is_spent(),
                        "outpoint {outpoint} already holds a live coin"
                    );
                    fresh = !entry.is_dirty();
                }
                *usage = usage.saturating_sub(entry.coin.memory_usage());
                entry.coin = coin;
                entry.flags |= CacheEntry::DIRTY | if fresh { CacheEntry::FRESH } else { 0 };
                *usage += entry.coin.memory_usage();
                trace!(%outpoint, fresh, "coin added to cache");
            }
        }
    }

    /// Spend the coin at `outpoint`, returning it. A FRESH entry is
    /// erased outright; otherwise a DIRTY spent entry remains as the
    /// tombstone owed to the parent.
    pub fn spend_coin(&self, outpoint: &OutPoint) -> ChainStateResult<Option<Coin>> {
        self.fetch_coin(outpoint)?;
        let mut guard = self.inner.lock();
        let CacheInner { map, usage, .. } = &mut *guard;
        let Entry::Occupied(mut occupied) = map.entry(*outpoint) else {
            return Ok(None);
        };
        if occupied.get().coin.is_spent() {
            return Ok(None);
        }
        let taken = occupied.get().coin.clone();
        *usage = usage.saturating_sub(taken.memory_usage());
        if occupied.get().is_fresh() {
            occupied.remove();
        } else {
            let entry = occupied.get_mut();
            entry.flags |= CacheEntry::DIRTY;
            entry.coin.clear();
        }
        trace!(%outpoint, "coin spent");
        Ok(Some(taken))
    }

    /// Drain every entry for a caller-orchestrated commit, leaving the
    /// cache empty.
    pub fn take_coins(&self) -> CoinsMap {
        let mut inner = self.inner.lock();
        inner.usage = 0;
        std::mem::take(&mut inner.map)
    }

    /// Push all dirty entries to the parent and clear the cache.
    pub fn flush(&self) -> ChainStateResult<()> {
        let tip = self.best_block()?.expect("flush without a tip recorded");
        let mut map = std::mem::take(&mut self.inner.lock().map);
        self.parent.batch_write(&mut map, tip)?;
        self.inner.lock().usage = 0;
        Ok(())
    }

    /// Memoize `outpoint` from the parent if it is not already cached.
    fn fetch_coin(&self, outpoint: &OutPoint) -> ChainStateResult<()> {
        if self.inner.lock().map.contains_key(outpoint) {
            return Ok(());
        }
        if let Some(coin) = self.parent.get_coin(outpoint)? {
            let mut inner = self.inner.lock();
            inner.usage += coin.memory_usage();
            inner.map.insert(*outpoint, CacheEntry::plain(coin));
        }
        Ok(())
    }
}

impl CoinsView for CoinsViewCache<'_> {
    fn get_coin(&self, outpoint: &OutPoint) -> ChainStateResult<Option<Coin>> {
        {
            let inner = self.inner.lock();
            if let Some(entry) = inner.map.get(outpoint) {
                if entry.coin.is_spent() {
                    return Ok(None);
                }
                return Ok(Some(entry.coin.clone()));
            }
        }
        self.fetch_coin(outpoint)?;
        let inner = self.inner.lock();
        Ok(inner
            .map
            .get(outpoint)
            .filter(|e| !e.coin.is_spent())
            .map(|e| e.coin.clone()))
    }

    fn best_block(&self) -> ChainStateResult<Option<Hash256>> {
        if let Some(hash) = self.inner.lock().best_block {
            return Ok(Some(hash));
        }
        let parent_best = self.parent.best_block()?;
        self.inner.lock().best_block = parent_best;
        Ok(parent_best)
    }

    fn head_blocks(&self) -> ChainStateResult<Vec<Hash256>> {
        self.parent.head_blocks()
    }

    /// Merge a child layer's dirty entries into this cache.
    fn batch_write(&self, coins: &mut CoinsMap, tip: Hash256) -> ChainStateResult<()> {
        assert!(!tip.is_zero(), "batch write with null tip");
        let mut guard = self.inner.lock();
        let CacheInner {
            map,
            usage,
            best_block,
        } = &mut *guard;
        for (outpoint, child) in coins.drain() {
            if !child.is_dirty() {
                continue;
            }
            match map.entry(outpoint) {
                Entry::Vacant(vacant) => {
                    // A FRESH spent child entry never existed below this
                    // layer; nothing to record.
                    if !(child.is_fresh() && child.coin.is_spent()) {
                        let mut flags = CacheEntry::DIRTY;
                        if child.is_fresh() {
                            flags |= CacheEntry::FRESH;
                        }
                        *usage += child.coin.memory_usage();
                        vacant.insert(CacheEntry {
                            coin: child.coin,
                            flags,
                        });
                    }
                }
                Entry::Occupied(mut occupied) => {
                    assert!(
                        !(child.is_fresh() && !occupied.get().coin.is_spent()),
                        "FRESH child entry shadows a live coin at {outpoint}"
                    );
                    let freed = occupied.get().coin.memory_usage();
                    if occupied.get().is_fresh() && child.coin.is_spent() {
                        // The whole lifetime of the coin is contained in
                        // this layer; forget it entirely.
                        *usage = usage.saturating_sub(freed);
                        occupied.remove();
                    } else {
                        let ours = occupied.get_mut();
                        ours.coin = child.coin;
                        ours.flags |= CacheEntry::DIRTY;
                        *usage = usage.saturating_sub(freed) + ours.coin.memory_usage();
                    }
                }
            }
        }
        *best_block = Some(tip);
        Ok(())
    }

    fn cursor(
        &self,
    ) -> ChainStateResult<Box<dyn Iterator<Item = ChainStateResult<(OutPoint, Coin)>> + '_>> {
        self.parent.cursor()
    }

    fn estimate_size(&self) -> ChainStateResult<u64> {
        self.parent.estimate_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use magna_core::{AddressKey, Script, TxOut};
    use parking_lot::RwLock;

    fn coin(amount: i64, height: u32) -> Coin {
        let script = Script::pay_to_key_hash(&AddressKey::from_bytes([9; 20]));
        Coin::new(TxOut::new(amount, script), height, false)
    }

    fn outpoint(n: u8) -> OutPoint {
        OutPoint::new(Hash256::from_bytes([n; 32]), 0)
    }

    /// Trivial backing view for cache tests.
    #[derive(Default)]
    struct MapView {
        coins: RwLock<HashMap<OutPoint, Coin>>,
        best: RwLock<Option<Hash256>>,
    }

    impl CoinsView for MapView {
        fn get_coin(&self, out: &OutPoint) -> ChainStateResult<Option<Coin>> {
            Ok(self.coins.read().get(out).cloned())
        }

        fn best_block(&self) -> ChainStateResult<Option<Hash256>> {
            Ok(*self.best.read())
        }

        fn batch_write(&self, coins: &mut CoinsMap, tip: Hash256) -> ChainStateResult<()> {
            assert!(!tip.is_zero());
            let mut map = self.coins.write();
            for (out, entry) in coins.drain() {
                if !entry.is_dirty() {
                    continue;
                }
                if entry.coin.is_spent() {
                    map.remove(&out);
                } else {
                    map.insert(out, entry.coin);
                }
            }
            *self.best.write() = Some(tip);
            Ok(())
        }
    }

    #[test]
    fn read_memoizes_without_dirty() {
        let backing = MapView::default();
        backing.coins.write().insert(outpoint(1), coin(10, 1));

        let cache = CoinsViewCache::new(&backing);
        assert!(cache.get_coin(&outpoint(1)).unwrap().is_some());
        assert!(cache.have_coin_in_cache(&outpoint(1)));
        assert_eq!(cache.inner.lock().map[&outpoint(1)].flags, 0);
    }

    #[test]
    fn fresh_add_then_spend_leaves_no_trace() {
        let backing = MapView::default();
        let cache = CoinsViewCache::new(&backing);

        cache.add_coin(outpoint(2), coin(5, 1), false);
        assert!(cache.inner.lock().map[&outpoint(2)].is_fresh());

        let spent = cache.spend_coin(&outpoint(2)).unwrap();
        assert!(spent.is_some());
        assert!(!cache.have_coin_in_cache(&outpoint(2)));
        assert_eq!(cache.memory_usage(), 0);
    }

    #[test]
    fn spend_of_parent_coin_leaves_dirty_tombstone() {
        let backing = MapView::default();
        backing.coins.write().insert(outpoint(3), coin(7, 2));

        let cache = CoinsViewCache::new(&backing);
        cache.spend_coin(&outpoint(3)).unwrap();

        let inner = cache.inner.lock();
        let entry = &inner.map[&outpoint(3)];
        assert!(entry.is_dirty());
        assert!(entry.coin.is_spent());
    }

    #[test]
    #[should_panic(expected = "already holds a live coin")]
    fn double_add_panics() {
        let backing = MapView::default();
        let cache = CoinsViewCache::new(&backing);
        cache.add_coin(outpoint(4), coin(1, 1), false);
        cache.add_coin(outpoint(4), coin(2, 1), false);
    }

    #[test]
    fn flush_pushes_down_and_clears() {
        let backing = MapView::default();
        let cache = CoinsViewCache::new(&backing);

        cache.add_coin(outpoint(5), coin(42, 3), false);
        cache.set_best_block(Hash256::from_bytes([0xAA; 32]));
        cache.flush().unwrap();

        assert_eq!(cache.cache_size(), 0);
        assert_eq!(cache.memory_usage(), 0);
        assert!(backing.coins.read().contains_key(&outpoint(5)));
        assert_eq!(
            backing.best.read().unwrap(),
            Hash256::from_bytes([0xAA; 32])
        );
    }

    #[test]
    fn two_layer_merge_erases_fresh_spent_pairs() {
        let backing = MapView::default();
        let lower = CoinsViewCache::new(&backing);
        let upper = CoinsViewCache::new(&lower);

        // Created and spent entirely in the upper layer.
        upper.add_coin(outpoint(6), coin(1, 1), false);
        upper.spend_coin(&outpoint(6)).unwrap();

        // Created in upper, survives the merge.
        upper.add_coin(outpoint(7), coin(2, 1), false);

        upper.set_best_block(Hash256::from_bytes([0xBB; 32]));
        upper.flush().unwrap();

        assert!(!lower.have_coin_in_cache(&outpoint(6)));
        let inner = lower.inner.lock();
        let entry = &inner.map[&outpoint(7)];
        assert!(entry.is_dirty() && entry.is_fresh());
    }

    #[test]
    fn merge_of_spend_into_fresh_parent_entry_cancels() {
        let backing = MapView::default();
        let lower = CoinsViewCache::new(&backing);

        lower.add_coin(outpoint(8), coin(3, 1), false);

        let upper = CoinsViewCache::new(&lower);
        upper.spend_coin(&outpoint(8)).unwrap();
        upper.set_best_block(Hash256::from_bytes([0xCC; 32]));
        upper.flush().unwrap();

        // The fresh creation and the spend annihilate.
        assert!(!lower.have_coin_in_cache(&outpoint(8)));
    }

    #[test]
    #[should_panic(expected = "null tip")]
    fn batch_write_rejects_null_tip() {
        let backing = MapView::default();
        let cache = CoinsViewCache::new(&backing);
        let mut map = CoinsMap::new();
        cache.batch_write(&mut map, Hash256::ZERO).unwrap();
    }
}
