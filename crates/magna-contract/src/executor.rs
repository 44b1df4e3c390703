//! Grouped parallel execution of contract transactions.
//!
//! The block body carries a group-size vector partitioning its contract
//! transactions. Groups run in parallel on a fixed worker pool;
//! transactions within a group run sequentially in block order. Each
//! worker thread owns a private VM instance created once at pool startup,
//! so dispatch never takes a lock for VM access. The caller's partition
//! must be conflict-free: two groups touching the same contract are
//! rejected deterministically.

use crate::{
    ContractContext, ContractError, ContractId, ContractInfo, ContractResult, ContractStateDb,
    ContractTxFinalData,
};
use magna_core::{Amount, Hash256};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

/// A contract-invoking transaction as the validation layer hands it over.
#[derive(Debug, Clone)]
pub struct ContractTransaction {
    /// Transaction id.
    pub txid: Hash256,
    /// The invoked contract.
    pub contract_id: ContractId,
    /// Coins paid into the contract's escrow by this transaction.
    pub amount_in: Amount,
    /// Coins the contract pays out of escrow.
    pub amount_out: Amount,
    /// Opaque VM input.
    pub payload: Vec<u8>,
}

/// A scripting-VM instance. One per worker thread, owned exclusively.
pub trait ContractVm: Send {
    /// Run `tx` against the staged contract state. An error fails the
    /// transaction; its staged writes are discarded.
    fn execute(&mut self, tx: &ContractTransaction, contract: &mut ContractInfo)
        -> Result<(), String>;
}

/// Per-block escrow balances. Ensures a contract never pays out more than
/// it holds.
#[derive(Debug, Default)]
pub struct CoinAmountCache {
    balances: Mutex<HashMap<ContractId, Amount>>,
}

impl CoinAmountCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a contract's balance from the coin view.
    pub fn set_balance(&self, id: ContractId, amount: Amount) {
        self.balances.lock().insert(id, amount);
    }

    /// The current balance of `id`.
    pub fn balance(&self, id: &ContractId) -> Amount {
        self.balances.lock().get(id).copied().unwrap_or(0)
    }

    /// Credit escrow.
    pub fn credit(&self, id: ContractId, amount: Amount) {
        *self.balances.lock().entry(id).or_insert(0) += amount;
    }

    /// Debit escrow if the balance covers it. Returns whether the debit
    /// was applied; a refused debit leaves the balance untouched.
    pub fn try_debit(&self, id: ContractId, amount: Amount) -> bool {
        let mut balances = self.balances.lock();
        let balance = balances.entry(id).or_insert(0);
        if *balance < amount {
            return false;
        }
        *balance -= amount;
        true
    }
}

/// The outcome of executing one block's contract transactions.
#[derive(Debug, Default)]
pub struct BlockExecutionOutcome {
    /// Merged per-group contexts, in group order.
    pub context: ContractContext,
    /// Transactions that failed and contributed no writes.
    pub failed: Vec<Hash256>,
}

struct GroupTask {
    index: usize,
    txs: Vec<ContractTransaction>,
    db: Arc<ContractStateDb>,
    balances: Arc<CoinAmountCache>,
}

type GroupOutcome = (usize, ContractResult<(ContractContext, Vec<Hash256>)>);

/// Fixed pool of contract execution workers.
pub struct ContractExecutor {
    task_txs: Vec<mpsc::Sender<GroupTask>>,
    results_rx: Mutex<mpsc::Receiver<GroupOutcome>>,
    handles: Vec<JoinHandle<()>>,
}

impl ContractExecutor {
    /// Spawn `pool_size` workers. `vm_factory` is invoked once per worker
    /// at registration; the produced VM moves into the worker thread and
    /// is never shared.
    pub fn new(pool_size: usize, vm_factory: &dyn Fn(usize) -> Box<dyn ContractVm>) -> Self {
        let pool_size = pool_size.max(1);
        let (results_tx, results_rx) = mpsc::channel();
        let mut task_txs = Vec::with_capacity(pool_size);
        let mut handles = Vec::with_capacity(pool_size);

        for id in 0..pool_size {
            let (task_tx, task_rx) = mpsc::channel::<GroupTask>();
            let vm = vm_factory(id);
            let results = results_tx.clone();
            let handle = thread::Builder::new()
                .name(format!("contract-worker-{id}"))
                .spawn(move || worker_loop(id, vm, task_rx, results))
                .expect("failed to spawn contract worker thread");
            task_txs.push(task_tx);
            handles.push(handle);
        }
        debug!(pool_size, "contract worker pool started");

        Self {
            task_txs,
            results_rx: Mutex::new(results_rx),
            handles,
        }
    }

    /// Number of workers in the pool.
    pub fn pool_size(&self) -> usize {
        self.task_txs.len()
    }

    /// Execute one block's transactions in the caller-provided group
    /// partition. Blocks until every group has finished, then verifies
    /// the partition was conflict-free and merges the group contexts in
    /// group order.
    pub fn run_block(
        &self,
        db: &Arc<ContractStateDb>,
        groups: Vec<Vec<ContractTransaction>>,
        balances: &Arc<CoinAmountCache>,
    ) -> ContractResult<BlockExecutionOutcome> {
        if groups.is_empty() {
            return Ok(BlockExecutionOutcome::default());
        }

        let group_count = groups.len();
        for (index, txs) in groups.into_iter().enumerate() {
            let task = GroupTask {
                index,
                txs,
                db: Arc::clone(db),
                balances: Arc::clone(balances),
            };
            self.task_txs[index % self.task_txs.len()]
                .send(task)
                .map_err(|_| ContractError::PoolStopped)?;
        }

        // End-of-block barrier: wait for every group. Every result is
        // drained even on failure so a later block never sees this
        // block's leftovers.
        let mut slots: Vec<Option<(ContractContext, Vec<Hash256>)>> = Vec::new();
        slots.resize_with(group_count, || None);
        let mut first_error = None;
        {
            let results_rx = self.results_rx.lock();
            for _ in 0..group_count {
                let (index, outcome) =
                    results_rx.recv().map_err(|_| ContractError::PoolStopped)?;
                match outcome {
                    Ok(result) => slots[index] = Some(result),
                    Err(error) => first_error = first_error.or(Some(error)),
                }
            }
        }
        if let Some(error) = first_error {
            return Err(error);
        }

        // The partition must be conflict-free across groups. Touched sets
        // are scanned in contract order so the reported conflict is
        // deterministic.
        let mut owner: HashMap<ContractId, usize> = HashMap::new();
        for (index, slot) in slots.iter().enumerate() {
            let (context, _) = slot.as_ref().expect("every group reported");
            let mut touched: Vec<ContractId> = context.touched().iter().copied().collect();
            touched.sort_unstable();
            for contract in touched {
                if let Some(previous) = owner.insert(contract, index) {
                    if previous != index {
                        return Err(ContractError::GroupConflict { contract });
                    }
                }
            }
        }

        let mut outcome = BlockExecutionOutcome::default();
        for slot in slots {
            let (context, failed) = slot.expect("every group reported");
            outcome.context.absorb(context);
            outcome.failed.extend(failed);
        }
        Ok(outcome)
    }
}

impl Drop for ContractExecutor {
    fn drop(&mut self) {
        self.task_txs.clear();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(
    id: usize,
    mut vm: Box<dyn ContractVm>,
    tasks: mpsc::Receiver<GroupTask>,
    results: mpsc::Sender<GroupOutcome>,
) {
    debug!(worker = id, "contract worker registered");
    while let Ok(task) = tasks.recv() {
        let outcome = run_group(vm.as_mut(), &task);
        if results.send((task.index, outcome)).is_err() {
            break;
        }
    }
    debug!(worker = id, "contract worker stopped");
}

/// Execute one group sequentially into a fresh context.
fn run_group(
    vm: &mut dyn ContractVm,
    task: &GroupTask,
) -> ContractResult<(ContractContext, Vec<Hash256>)> {
    let mut context = ContractContext::new();
    let mut failed = Vec::new();
    for tx in &task.txs {
        if !execute_one(vm, tx, &mut context, &task.db, &task.balances)? {
            failed.push(tx.txid);
        }
    }
    Ok((context, failed))
}

/// Execute a single transaction. Returns whether it succeeded; staged
/// writes of a failed transaction are discarded.
fn execute_one(
    vm: &mut dyn ContractVm,
    tx: &ContractTransaction,
    context: &mut ContractContext,
    db: &ContractStateDb,
    balances: &CoinAmountCache,
) -> ContractResult<bool> {
    // Stage the newest visible state, or a fresh contract on first touch.
    let staged = match context.get_data(&tx.contract_id) {
        Some(info) => info.clone(),
        None => db
            .get_info(&tx.contract_id)?
            .unwrap_or_default(),
    };
    context.set_cache(tx.contract_id, staged);

    let contract = context
        .cache_mut(&tx.contract_id)
        .expect("cache entry just staged");
    if let Err(reason) = vm.execute(tx, contract) {
        debug!(txid = %tx.txid, contract = %tx.contract_id, reason, "contract transaction failed");
        context.clear_cache();
        return Ok(false);
    }

    // Settle escrow; an uncovered payout fails the transaction.
    if tx.amount_in > 0 {
        balances.credit(tx.contract_id, tx.amount_in);
    }
    if tx.amount_out > 0 && !balances.try_debit(tx.contract_id, tx.amount_out) {
        warn!(txid = %tx.txid, contract = %tx.contract_id, "contract payout exceeds escrow");
        if tx.amount_in > 0 {
            // Roll the credit back with the staged writes.
            balances.try_debit(tx.contract_id, tx.amount_in);
        }
        context.clear_cache();
        return Ok(false);
    }

    context.commit();
    let mut final_data = ContractTxFinalData {
        contract_coins: HashMap::new(),
        data: context.data().clone(),
    };
    final_data
        .contract_coins
        .insert(tx.contract_id, balances.balance(&tx.contract_id));
    context.tx_final_data.push(final_data);
    Ok(true)
}
