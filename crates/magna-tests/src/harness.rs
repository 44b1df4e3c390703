//! Test harness: temporary databases and a wired-up chain-state node.

use magna_chainstate::{
    BlockTreeDb, ChainStateConfig, ChainStateError, ChainStateResult, CoinListDb, CoinsView,
    CoinsViewCache, CoinsViewDb,
};
use magna_contract::ContractStateDb;
use magna_core::{AddressKey, Coin, Hash256, OutPoint, Script, TxOut};
use magna_storage::Database;
use std::collections::BTreeMap;
use std::sync::Arc;
use tempfile::TempDir;

/// A temporary on-disk database, removed on drop.
pub struct TestStore {
    store: Arc<Database>,
    _temp_dir: TempDir,
}

impl TestStore {
    /// Create a database in a fresh temporary directory.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp directory");
        let store = Arc::new(Database::open(temp_dir.path()).expect("failed to open database"));
        Self {
            store,
            _temp_dir: temp_dir,
        }
    }

    /// The shared database handle.
    pub fn store(&self) -> Arc<Database> {
        Arc::clone(&self.store)
    }
}

impl Default for TestStore {
    fn default() -> Self {
        Self::new()
    }
}

/// A wired chain-state instance: coin database with attached address
/// index, block tree, and contract store, each over its own database the
/// way the node lays them out on disk.
pub struct ChainHarness {
    /// The coin view with the address index attached.
    pub coins: CoinsViewDb,
    /// The address index (shares the chainstate database).
    pub addr_index: Arc<CoinListDb>,
    /// The block index database.
    pub block_tree: BlockTreeDb,
    /// The contract state store.
    pub contracts: Arc<ContractStateDb>,
    _chainstate_dir: TempDir,
    _blocks_dir: TempDir,
    _contract_dir: TempDir,
}

impl ChainHarness {
    /// Build a full chain-state stack over temporary directories.
    pub fn new() -> Self {
        Self::with_config(ChainStateConfig::default())
    }

    /// Build with explicit tuning.
    pub fn with_config(config: ChainStateConfig) -> Self {
        let chainstate_dir = TempDir::new().expect("chainstate dir");
        let blocks_dir = TempDir::new().expect("blocks dir");
        let contract_dir = TempDir::new().expect("contract dir");

        let chainstate = Arc::new(
            Database::open_with_cache(chainstate_dir.path(), config.db_cache_size)
                .expect("chainstate db"),
        );
        let addr_index = Arc::new(CoinListDb::new(
            Arc::clone(&chainstate),
            config.db_batch_size,
        ));
        let mut coins = CoinsViewDb::new(Arc::clone(&chainstate), &config);
        coins.attach_address_index(Arc::clone(&addr_index));

        let block_tree = BlockTreeDb::new(Arc::new(
            Database::open(blocks_dir.path()).expect("block index db"),
        ));
        let contracts = Arc::new(ContractStateDb::new(Arc::new(
            Database::open(contract_dir.path()).expect("contract db"),
        )));

        Self {
            coins,
            addr_index,
            block_tree,
            contracts,
            _chainstate_dir: chainstate_dir,
            _blocks_dir: blocks_dir,
            _contract_dir: contract_dir,
        }
    }

    /// Connect a block's coin changes through a fresh per-block cache and
    /// commit, with the contract writes riding inside the tip-transition
    /// window.
    pub fn connect_block(
        &self,
        tip: Hash256,
        height: u32,
        added: &[(OutPoint, Coin)],
        spent: &[OutPoint],
        contract_data: &magna_contract::ContractData,
    ) -> ChainStateResult<()> {
        let cache = CoinsViewCache::new(&self.coins);
        for (outpoint, coin) in added {
            cache.add_coin(*outpoint, coin.clone(), false);
        }
        for outpoint in spent {
            cache.spend_coin(outpoint)?;
        }
        cache.set_best_block(tip);

        // Drain the per-block cache for the durable commit.
        let mut map = cache.take_coins();
        self.coins.commit(&mut map, tip, || {
            self.contracts
                .write_block(height, tip, contract_data)
                .map_err(|e| ChainStateError::Corruption(e.to_string()))
        })
    }
}

impl Default for ChainHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Outpoint with `n` repeated in the txid.
pub fn outpoint(n: u8, index: u32) -> OutPoint {
    OutPoint::new(Hash256::from_bytes([n; 32]), index)
}

/// Block hash with `n` repeated.
pub fn block_hash(n: u8) -> Hash256 {
    Hash256::from_bytes([n; 32])
}

/// A 20-byte address key with `n` repeated.
pub fn addr(n: u8) -> AddressKey {
    AddressKey::from_bytes([n; 20])
}

/// A live pay-to-key-hash coin.
pub fn p2kh_coin(amount: i64, height: u32, owner: AddressKey, coinbase: bool) -> Coin {
    Coin::new(
        TxOut::new(amount, Script::pay_to_key_hash(&owner)),
        height,
        coinbase,
    )
}

/// Dump a coin view's durable contents into an ordered map for
/// comparison.
pub fn dump_coins(view: &dyn CoinsView) -> BTreeMap<OutPoint, Coin> {
    view.cursor()
        .expect("cursor")
        .map(|item| item.expect("cursor item"))
        .collect()
}
