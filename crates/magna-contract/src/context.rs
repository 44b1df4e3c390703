//! Per-execution staging for contract state.
//!
//! Three layers per contract during block execution: Durable (what the
//! store has on disk), Data (states committed by earlier transactions of
//! the block), and Cache (the currently executing transaction's working
//! set). A successful transaction commits Cache into Data; a failed one
//! discards Cache.

use crate::{ContractId, ContractInfo};
use magna_core::Amount;
use std::collections::{HashMap, HashSet};

/// Contract states keyed by contract id.
pub type ContractData = HashMap<ContractId, ContractInfo>;

/// Snapshot appended after each successful contract transaction.
#[derive(Debug, Clone, Default)]
pub struct ContractTxFinalData {
    /// Escrow balance per touched contract after the transaction.
    pub contract_coins: HashMap<ContractId, Amount>,
    /// Contract states after the transaction.
    pub data: ContractData,
}

/// The staging area one execution thread works in.
#[derive(Debug, Default)]
pub struct ContractContext {
    cache: ContractData,
    data: ContractData,
    touched: HashSet<ContractId>,
    /// Per-transaction final snapshots, in execution order.
    pub tx_final_data: Vec<ContractTxFinalData>,
}

impl ContractContext {
    /// Create an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage `info` as the working copy for the current transaction.
    pub fn set_cache(&mut self, id: ContractId, info: ContractInfo) {
        self.touched.insert(id);
        self.cache.insert(id, info);
    }

    /// Mutable access to the staged working copy.
    pub fn cache_mut(&mut self, id: &ContractId) -> Option<&mut ContractInfo> {
        self.cache.get_mut(id)
    }

    /// Record a committed state directly, bypassing the cache.
    pub fn set_data(&mut self, id: ContractId, info: ContractInfo) {
        self.touched.insert(id);
        self.data.insert(id, info);
    }

    /// The newest visible state for `id`: staged cache first, then
    /// committed data.
    pub fn get_data(&self, id: &ContractId) -> Option<&ContractInfo> {
        self.cache.get(id).or_else(|| self.data.get(id))
    }

    /// States committed by the block so far.
    pub fn data(&self) -> &ContractData {
        &self.data
    }

    /// Every contract this context touched, including by failed
    /// transactions.
    pub fn touched(&self) -> &HashSet<ContractId> {
        &self.touched
    }

    /// Commit the cache into data (transaction succeeded).
    pub fn commit(&mut self) {
        for (id, info) in self.cache.drain() {
            self.data.insert(id, info);
        }
    }

    /// Discard the cache (transaction failed).
    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }

    /// Discard committed data, keeping nothing.
    pub fn clear_all(&mut self) {
        self.cache.clear();
        self.data.clear();
        self.touched.clear();
        self.tx_final_data.clear();
    }

    /// Fold another context's committed results into this one. Used when
    /// merging per-group contexts; the groups are conflict-free so the
    /// data sets are disjoint.
    pub fn absorb(&mut self, other: ContractContext) {
        self.data.extend(other.data);
        self.touched.extend(other.touched);
        self.tx_final_data.extend(other.tx_final_data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use magna_core::AddressKey;

    fn id(n: u8) -> ContractId {
        AddressKey::from_bytes([n; 20])
    }

    fn info(code: &[u8]) -> ContractInfo {
        ContractInfo::with_code(code.to_vec())
    }

    #[test]
    fn commit_moves_cache_to_data() {
        let mut ctx = ContractContext::new();
        ctx.set_cache(id(1), info(b"a"));
        assert!(ctx.data().is_empty());

        ctx.commit();
        assert_eq!(ctx.data().len(), 1);
        assert!(ctx.get_data(&id(1)).is_some());
    }

    #[test]
    fn clear_cache_discards_staged_writes() {
        let mut ctx = ContractContext::new();
        ctx.set_data(id(1), info(b"committed"));
        ctx.set_cache(id(1), info(b"staged"));

        assert_eq!(ctx.get_data(&id(1)).unwrap().code, b"staged");
        ctx.clear_cache();
        assert_eq!(ctx.get_data(&id(1)).unwrap().code, b"committed");
    }

    #[test]
    fn touched_includes_failed_writes() {
        let mut ctx = ContractContext::new();
        ctx.set_cache(id(2), info(b"x"));
        ctx.clear_cache();
        assert!(ctx.touched().contains(&id(2)));
    }

    #[test]
    fn absorb_unions_disjoint_contexts() {
        let mut a = ContractContext::new();
        a.set_data(id(1), info(b"one"));
        a.tx_final_data.push(ContractTxFinalData::default());

        let mut b = ContractContext::new();
        b.set_data(id(2), info(b"two"));

        a.absorb(b);
        assert_eq!(a.data().len(), 2);
        assert_eq!(a.tx_final_data.len(), 1);
        assert!(a.touched().contains(&id(2)));
    }
}
