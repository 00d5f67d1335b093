//! The chain orchestrator: owns the blocks, the mempool and the miner, and
//! enforces every integrity invariant.
//!
//! Appends and replacements both take the chain write lock, so a mined
//! block can never interleave with a chain swap. The nonce search itself
//! runs without any chain lock; a block whose parent is no longer the tip
//! when it is ready is rejected as stale.

use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::block::Block;
use crate::config::ChainConfig;
use crate::constants::GENESIS_PREVIOUS_HASH;
use crate::error::{LedgerError, Result};
use crate::mempool::TransactionPool;
use crate::merkle::{MerkleTree, ProofStep};
use crate::mine::{BlockTemplate, MineOutcome, Miner};
use crate::pow::meets_difficulty;
use crate::transaction::{total_fees, CoinbaseTransaction, DataRecord, Transaction, TxRecord};

/// Persistence backend the chain mirrors itself to.
/// This lives in `ledger-core` to avoid a circular dependency.
pub trait ChainStore: Send + Sync {
    fn save_block(&self, block: &Block) -> anyhow::Result<()>;
    /// All blocks, ordered by index.
    fn load_chain(&self) -> anyhow::Result<Vec<Block>>;
    fn get_block(&self, index: u64) -> anyhow::Result<Option<Block>>;
    fn clear_chain(&self) -> anyhow::Result<()>;
    /// Writes the whole chain to `path` as JSON.
    fn snapshot(&self, path: &Path) -> anyhow::Result<()>;

    /// Flushes pending writes.
    fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct ValidationReport {
    pub is_valid: bool,
    /// Offending block indices, ascending and deduplicated.
    pub invalid_blocks: Vec<u64>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ChainStats {
    pub block_count: usize,
    pub transaction_count: usize,
    pub is_valid: bool,
    pub invalid_blocks: Vec<u64>,
    pub difficulty: u32,
    pub block_reward: u64,
    pub total_supply: u64,
    pub max_supply: u64,
    pub mempool_size: usize,
    pub mempool_fees: u64,
    pub latest_hash: String,
    pub mining_jobs: usize,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct MerkleProofInfo {
    pub block_index: u64,
    pub tx_index: usize,
    pub tx_hash: String,
    pub merkle_root: String,
    pub proof: Vec<ProofStep>,
}

/// Checks a standalone block list.
///
/// Genesis must carry the zero parent and difficulty 0, a matching hash and
/// Merkle root. Every later block must sit at its position, match its
/// recomputed hash, link to its predecessor, meet its own recorded
/// difficulty and commit to its stored transactions.
pub fn validate_chain(blocks: &[Block]) -> ValidationReport {
    let Some(genesis) = blocks.first() else {
        return ValidationReport {
            is_valid: false,
            invalid_blocks: Vec::new(),
        };
    };

    let mut invalid = Vec::new();
    if genesis.index() != 0
        || genesis.previous_hash() != GENESIS_PREVIOUS_HASH
        || genesis.difficulty() != 0
        || !genesis.has_valid_hash()
        || !genesis.has_valid_merkle_root()
    {
        warn!("genesis block failed validation");
        invalid.push(0);
    }

    for (position, pair) in blocks.windows(2).enumerate() {
        let (previous, current) = (&pair[0], &pair[1]);
        let i = position as u64 + 1;
        let mut ok = true;

        if !current.has_valid_hash() {
            warn!(index = i, "hash mismatch");
            ok = false;
        }
        if current.index() != i || current.previous_hash() != previous.hash {
            warn!(index = i, "broken link to previous block");
            ok = false;
        }
        if !meets_difficulty(&current.hash, current.difficulty()) {
            warn!(index = i, difficulty = current.difficulty(), "proof of work not satisfied");
            ok = false;
        }
        if !current.has_valid_merkle_root() {
            warn!(index = i, "merkle root mismatch");
            ok = false;
        }
        if !ok {
            invalid.push(i);
        }
    }

    ValidationReport {
        is_valid: invalid.is_empty(),
        invalid_blocks: invalid,
    }
}

fn minted(blocks: &[Block]) -> u64 {
    blocks
        .iter()
        .flat_map(|b| b.transactions())
        .map(TxRecord::reward)
        .sum()
}

fn transfer_ids(block: &Block) -> impl Iterator<Item = &str> {
    block
        .transactions()
        .iter()
        .filter_map(TxRecord::as_transfer)
        .map(|tx| tx.id.as_str())
}

#[derive(Debug)]
struct ChainState {
    blocks: Vec<Block>,
    total_supply: u64,
}

impl ChainState {
    fn tip(&self) -> &Block {
        // never empty: genesis is installed at construction
        &self.blocks[self.blocks.len() - 1]
    }
}

/// A block template plus the bookkeeping needed to append its result.
struct PreparedBlock {
    template: BlockTemplate,
    reward: u64,
}

pub struct Blockchain {
    config: ChainConfig,
    state: RwLock<ChainState>,
    pool: TransactionPool,
    miner: Miner,
    store: Option<Arc<dyn ChainStore>>,
}

impl Blockchain {
    /// In-memory chain holding only the genesis block.
    pub fn new(config: ChainConfig) -> Self {
        let miner = Miner::new(config.mining_difficulty).with_parallel(config.parallel_mining);
        info!(difficulty = config.mining_difficulty, "blockchain initialized");
        Self {
            state: RwLock::new(ChainState {
                blocks: vec![Self::create_genesis_block()],
                total_supply: 0,
            }),
            pool: TransactionPool::new(),
            miner,
            store: None,
            config,
        }
    }

    /// Chain mirrored to `store`. A persisted chain is adopted as-is (invalid
    /// blocks are reported, never repaired); an empty store gets genesis.
    pub fn with_store(config: ChainConfig, store: Arc<dyn ChainStore>) -> Self {
        let mut chain = Self::new(config);
        if !chain.config.enable_persistence {
            return chain;
        }

        match store.load_chain() {
            Ok(blocks) if !blocks.is_empty() => {
                let report = validate_chain(&blocks);
                if !report.is_valid {
                    error!(invalid = ?report.invalid_blocks, "persisted chain failed validation");
                }
                info!(blocks = blocks.len(), "loaded chain from store");
                let state = chain.state.get_mut();
                state.total_supply = minted(&blocks);
                state.blocks = blocks;
            }
            Ok(_) => {
                if let Err(e) = store.save_block(&chain.state.get_mut().blocks[0]) {
                    error!(error = %e, "failed to persist genesis block");
                }
            }
            Err(e) => error!(error = %e, "failed to load chain from store, starting from genesis"),
        }
        chain.store = Some(store);
        chain
    }

    pub fn create_genesis_block() -> Block {
        Block::genesis()
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    pub fn miner(&self) -> &Miner {
        &self.miner
    }

    pub fn pool(&self) -> &TransactionPool {
        &self.pool
    }

    pub fn set_difficulty(&self, difficulty: u32) {
        self.miner.set_difficulty(difficulty);
    }

    pub fn len(&self) -> usize {
        self.state.read().blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().blocks.is_empty()
    }

    pub fn chain(&self) -> Vec<Block> {
        self.state.read().blocks.clone()
    }

    pub fn get_block(&self, index: u64) -> Option<Block> {
        let index = usize::try_from(index).ok()?;
        self.state.read().blocks.get(index).cloned()
    }

    pub fn last_block(&self) -> Block {
        self.state.read().tip().clone()
    }

    pub fn total_supply(&self) -> u64 {
        self.state.read().total_supply
    }

    /// Validates and pools a client transaction. `Ok(false)` on a duplicate id.
    pub fn submit_transaction(&self, transaction: Transaction) -> Result<bool> {
        transaction.validate()?;
        Ok(self.pool.add_transaction(transaction))
    }

    /// Mines `transactions` (plus a coinbase while supply remains) on top
    /// of the current tip and appends the result.
    pub fn mine_block(&self, transactions: Vec<Transaction>, miner_address: &str) -> Result<Block> {
        let prepared = self.prepare(transactions, miner_address)?;
        match self.miner.mine_block(prepared.template, None, None)? {
            MineOutcome::Mined(block) => {
                self.append(&block, prepared.reward)?;
                Ok(block)
            }
            MineOutcome::Cancelled { job_id, .. } => Err(LedgerError::Worker(format!(
                "untracked search reported cancellation of {job_id}"
            ))),
        }
    }

    /// Mines up to `max_block_transactions` pending mempool entries.
    pub fn mine_pending(&self, miner_address: &str) -> Result<Block> {
        let transactions = self
            .pool
            .get_transactions(Some(self.config.max_block_transactions));
        self.mine_block(transactions, miner_address)
    }

    /// Starts a tracked search on a background worker and returns its job
    /// id. The block is appended when the search succeeds; a cancelled job
    /// leaves the chain untouched. Without explicit `transactions` the
    /// oldest mempool entries are used.
    pub fn start_mining(self: &Arc<Self>, miner_address: &str, transactions: Option<Vec<Transaction>>) -> Result<String> {
        self.start_mining_with(miner_address, transactions, |_| {})
    }

    /// Like [`Blockchain::start_mining`], calling `on_appended` on the worker
    /// once the mined block is on the chain.
    pub fn start_mining_with<F>(
        self: &Arc<Self>,
        miner_address: &str,
        transactions: Option<Vec<Transaction>>,
        on_appended: F,
    ) -> Result<String>
    where
        F: FnOnce(Block) + Send + 'static,
    {
        let transactions = transactions.unwrap_or_else(|| {
            self.pool
                .get_transactions(Some(self.config.max_block_transactions))
        });
        let prepared = self.prepare(transactions, miner_address)?;
        let job_id = Uuid::new_v4().to_string();

        let chain = Arc::clone(self);
        let reward = prepared.reward;
        let callback_job = job_id.clone();
        self.miner
            .mine_block_async(prepared.template, &job_id, move |outcome| match outcome {
                Ok(MineOutcome::Mined(block)) => match chain.append(&block, reward) {
                    Ok(()) => on_appended(block),
                    Err(e) => warn!(job_id = %callback_job, error = %e, "mined block was not appended"),
                },
                Ok(MineOutcome::Cancelled { attempts, .. }) => {
                    info!(job_id = %callback_job, attempts, "mining job ended by cancellation");
                }
                Err(e) => error!(job_id = %callback_job, error = %e, "mining job failed"),
            })?;
        Ok(job_id)
    }

    /// Mines a single free-text record, without a block reward.
    pub fn add_block(&self, data: &str) -> Result<Block> {
        if data.trim().is_empty() {
            return Err(LedgerError::validation("block data must not be blank"));
        }
        let template = {
            let state = self.state.read();
            BlockTemplate::new(
                state.blocks.len() as u64,
                state.tip().hash.clone(),
                vec![DataRecord::new(data).into()],
            )
            .with_difficulty(self.miner.difficulty())
        };
        match self.miner.mine_block(template, None, None)? {
            MineOutcome::Mined(block) => {
                self.append(&block, 0)?;
                Ok(block)
            }
            MineOutcome::Cancelled { job_id, .. } => Err(LedgerError::Worker(format!(
                "untracked search reported cancellation of {job_id}"
            ))),
        }
    }

    /// Receive side of a peer broadcast: the block must extend our tip and
    /// carry a matching hash, valid proof of work and Merkle root.
    pub fn accept_block(&self, block: Block) -> Result<()> {
        let mut state = self.state.write();
        let tip = state.tip();
        if block.index() != state.blocks.len() as u64 || block.previous_hash() != tip.hash {
            return Err(LedgerError::StaleTip {
                index: block.index(),
                expected: block.previous_hash().to_string(),
                found: tip.hash.clone(),
            });
        }
        if !crate::pow::verify_proof_of_work(&block) {
            return Err(LedgerError::validation(format!(
                "block {} fails proof of work",
                block.index()
            )));
        }
        if !block.has_valid_merkle_root() {
            return Err(LedgerError::validation(format!(
                "block {} merkle root does not match its transactions",
                block.index()
            )));
        }

        let reward = minted(std::slice::from_ref(&block));
        self.install(&mut state, &block, reward);
        drop(state);
        self.pool.remove_many(transfer_ids(&block));
        info!(index = block.index(), "accepted block from peer");
        Ok(())
    }

    pub fn is_chain_valid(&self) -> ValidationReport {
        validate_chain(&self.state.read().blocks)
    }

    /// Longest-valid-chain rule: adopts `candidate` only when it is strictly
    /// longer than the current chain and valid in full. Length alone decides
    /// between valid chains; accumulated work is not compared. Otherwise the
    /// current chain is left untouched.
    pub fn replace_chain(&self, candidate: Vec<Block>) -> bool {
        // the candidate is judged on its own, so validation can run unlocked
        let report = validate_chain(&candidate);

        let mut state = self.state.write();
        if candidate.len() <= state.blocks.len() {
            info!(
                candidate = candidate.len(),
                current = state.blocks.len(),
                "candidate chain is not longer, keeping current chain"
            );
            return false;
        }
        if !report.is_valid {
            warn!(invalid = ?report.invalid_blocks, "candidate chain failed validation, keeping current chain");
            return false;
        }

        state.total_supply = minted(&candidate);
        state.blocks = candidate;
        self.persist_all(&state.blocks);
        let included: Vec<String> = state
            .blocks
            .iter()
            .flat_map(transfer_ids)
            .map(str::to_string)
            .collect();
        let length = state.blocks.len();
        drop(state);

        self.pool.remove_many(included.iter().map(String::as_str));
        info!(length, "chain replaced");
        true
    }

    pub fn merkle_proof(&self, block_index: u64, tx_index: usize) -> Option<MerkleProofInfo> {
        let block = self.get_block(block_index)?;
        let tree = MerkleTree::new(block.transactions());
        let proof = tree.get_proof(tx_index)?;
        Some(MerkleProofInfo {
            block_index,
            tx_index,
            tx_hash: tree.get_transaction_hash(tx_index)?.to_string(),
            merkle_root: tree.root().to_string(),
            proof,
        })
    }

    /// Read-only aggregate figures; runs a full validation pass.
    pub fn get_stats(&self) -> ChainStats {
        let state = self.state.read();
        let report = validate_chain(&state.blocks);
        ChainStats {
            block_count: state.blocks.len(),
            transaction_count: state.blocks.iter().map(|b| b.transactions().len()).sum(),
            is_valid: report.is_valid,
            invalid_blocks: report.invalid_blocks,
            difficulty: self.miner.difficulty(),
            block_reward: self.config.block_reward,
            total_supply: state.total_supply,
            max_supply: self.config.max_supply,
            mempool_size: self.pool.size(),
            mempool_fees: self.pool.get_total_fees(None),
            latest_hash: state.tip().hash.clone(),
            mining_jobs: self.miner.get_all_jobs().len(),
        }
    }

    pub fn snapshot(&self, path: &Path) -> Result<()> {
        let store = self
            .store
            .as_ref()
            .ok_or_else(|| LedgerError::Storage("no store attached".to_string()))?;
        store
            .snapshot(path)
            .map_err(|e| LedgerError::Storage(e.to_string()))
    }

    /// Flushes the attached store, if any.
    pub fn close(&self) -> Result<()> {
        match &self.store {
            Some(store) => store
                .close()
                .map_err(|e| LedgerError::Storage(e.to_string())),
            None => Ok(()),
        }
    }

    fn prepare(&self, transactions: Vec<Transaction>, miner_address: &str) -> Result<PreparedBlock> {
        if transactions.is_empty() {
            return Err(LedgerError::validation("no transactions to mine"));
        }
        if miner_address.trim().is_empty() {
            return Err(LedgerError::validation("miner address must not be blank"));
        }
        for tx in &transactions {
            tx.validate()?;
        }

        let fees = total_fees(&transactions)?;
        let state = self.state.read();
        let reward = self.config.block_reward;

        let mut records: Vec<TxRecord> = Vec::with_capacity(transactions.len() + 1);
        let reward = if state.total_supply.saturating_add(reward) <= self.config.max_supply {
            records.push(CoinbaseTransaction::new(miner_address, reward, fees)?.into());
            reward
        } else {
            warn!(
                total_supply = state.total_supply,
                max_supply = self.config.max_supply,
                "max supply reached, mining without block reward"
            );
            0
        };
        records.extend(transactions.into_iter().map(TxRecord::from));

        let template = BlockTemplate::new(state.blocks.len() as u64, state.tip().hash.clone(), records)
            .with_difficulty(self.miner.difficulty());
        Ok(PreparedBlock { template, reward })
    }

    /// Appends a block produced by our own miner, provided it still
    /// extends the tip, then evicts its transactions from the mempool.
    fn append(&self, block: &Block, reward: u64) -> Result<()> {
        let mut state = self.state.write();
        let tip = state.tip();
        if block.index() != state.blocks.len() as u64 || block.previous_hash() != tip.hash {
            warn!(index = block.index(), "chain moved while mining, dropping block");
            return Err(LedgerError::StaleTip {
                index: block.index(),
                expected: block.previous_hash().to_string(),
                found: tip.hash.clone(),
            });
        }
        self.install(&mut state, block, reward);
        drop(state);

        let evicted = self.pool.remove_many(transfer_ids(block));
        info!(index = block.index(), evicted, "block appended");
        Ok(())
    }

    fn install(&self, state: &mut ChainState, block: &Block, reward: u64) {
        state.blocks.push(block.clone());
        state.total_supply += reward;
        self.persist(block);
    }

    fn persist(&self, block: &Block) {
        if let Some(store) = self.persistent_store() {
            if let Err(e) = store.save_block(block) {
                error!(index = block.index(), error = %e, "failed to persist block");
            }
        }
    }

    fn persist_all(&self, blocks: &[Block]) {
        let Some(store) = self.persistent_store() else {
            return;
        };
        if let Err(e) = store.clear_chain() {
            error!(error = %e, "failed to clear store before rewriting chain");
            return;
        }
        for block in blocks {
            if let Err(e) = store.save_block(block) {
                error!(index = block.index(), error = %e, "failed to persist block");
                return;
            }
        }
    }

    fn persistent_store(&self) -> Option<&Arc<dyn ChainStore>> {
        self.store
            .as_ref()
            .filter(|_| self.config.enable_persistence)
    }
}
