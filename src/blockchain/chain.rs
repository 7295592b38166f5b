use chrono::Utc;
use log::{debug, info, warn};
use parking_lot::RwLock;
use thiserror::Error;

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use super::block::Block;
use super::contract::{Contract, ContractError, ContractStore};
use super::crypto::{Address, KeyPair};
use super::mempool::{Admission, Mempool, MempoolError, MempoolStats};
use super::storage::{BlockStore, StorageError};
use super::transaction::{
    Transaction, TransactionError, TransactionInput, TransactionKind, TransactionOutput, CONTRACT_ADDRESS,
};
use super::utxo::{Utxo, UtxoKey, UtxoSet, UtxoView};
use crate::config::{LedgerConfig, MempoolConfig};
use crate::vm::{ExecutionContext, Value};

/// The ledger behind the single coarse lock shared by the node's tasks
pub type SharedBlockchain = Arc<RwLock<Blockchain>>;

/// Errors that can occur during blockchain operations
#[derive(Debug, Error)]
pub enum BlockchainError {
    #[error("Transaction error: {0}")]
    TransactionError(#[from] TransactionError),

    #[error("Mempool error: {0}")]
    MempoolError(#[from] MempoolError),

    #[error("Contract error: {0}")]
    ContractError(#[from] ContractError),

    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),

    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: f64, available: f64 },

    #[error("UTXO not found: {0}")]
    UnknownUtxo(UtxoKey),

    #[error("UTXO spent twice in one transaction: {0}")]
    DuplicateInput(UtxoKey),

    #[error("Input {0} carries no public key")]
    MissingPublicKey(usize),

    #[error("Invalid signature on input {0}")]
    InvalidSignature(usize),

    #[error("Input {0} spends an output the signer does not own")]
    OwnerMismatch(usize),

    #[error("Gas limit {requested} exceeds the per-call maximum {max}")]
    GasLimitExceeded { requested: u64, max: u64 },

    #[error("Coinbase transactions are created by miners only")]
    UnexpectedCoinbase,

    #[error("Invalid block: {0}")]
    InvalidBlock(String),

    #[error("Invalid chain: {0}")]
    InvalidChain(String),

    #[error("Received chain is not longer: local {local}, received {received}")]
    ChainNotLonger { local: usize, received: usize },
}

/// An unmined block assembled from the mempool
#[derive(Debug, Clone)]
pub struct BlockTemplate {
    pub block: Block,
    pub difficulty: u32,
}

/// The ledger: chain, UTXO index, contract store and mempool
///
/// All mutation goes through `&mut self`; concurrent users share it as a
/// [`SharedBlockchain`].
#[derive(Debug)]
pub struct Blockchain {
    /// The chain of blocks; never empty, genesis first
    chain: Vec<Block>,

    utxos: UtxoSet,

    contracts: ContractStore,

    /// Pending transactions to be included in the next blocks
    mempool: Mempool,

    /// Number of leading zeros required of the next block's hash
    difficulty: u32,

    config: LedgerConfig,

    storage: Option<BlockStore>,
}

impl Blockchain {
    /// Creates a new blockchain holding only the genesis block
    ///
    /// # Arguments
    ///
    /// * `config` - Consensus and economic parameters
    /// * `mempool_config` - Admission limits of the mempool
    pub fn new(config: LedgerConfig, mempool_config: MempoolConfig) -> Self {
        let genesis = genesis_block(&config);

        let mut utxos = UtxoSet::new();
        for transaction in &genesis.transactions {
            insert_outputs(&mut utxos, transaction);
        }

        Blockchain {
            chain: vec![genesis],
            utxos,
            contracts: ContractStore::new(),
            mempool: Mempool::new(mempool_config),
            difficulty: config.initial_difficulty,
            config,
            storage: None,
        }
    }

    /// Rebuilds a ledger from a stored chain by replaying every block
    ///
    /// The chain must start with this configuration's genesis block and pass
    /// full validation.
    pub fn from_blocks(
        config: LedgerConfig,
        mempool_config: MempoolConfig,
        blocks: Vec<Block>,
    ) -> Result<Self, BlockchainError> {
        let genesis = genesis_block(&config);
        if blocks.first() != Some(&genesis) {
            return Err(BlockchainError::InvalidChain("genesis block mismatch".to_string()));
        }
        if !Self::is_valid_chain(&blocks) {
            return Err(BlockchainError::InvalidChain("chain failed validation".to_string()));
        }

        let replayed = replay(&blocks, &config)?;

        Ok(Blockchain {
            chain: blocks,
            utxos: replayed.utxos,
            contracts: replayed.contracts,
            mempool: Mempool::new(mempool_config),
            difficulty: replayed.difficulty,
            config,
            storage: None,
        })
    }

    /// Creates a blockchain backed by a block store
    ///
    /// Loads and replays the stored chain when there is one; otherwise starts
    /// from genesis and stores it.
    pub fn with_storage(
        config: LedgerConfig,
        mempool_config: MempoolConfig,
        store: BlockStore,
    ) -> Result<Self, BlockchainError> {
        let blocks = store.load_blocks()?;

        let mut blockchain = if blocks.is_empty() {
            info!("No existing blockchain found in storage, creating genesis block");
            Self::new(config, mempool_config)
        } else {
            let count = blocks.len();
            let blockchain = Self::from_blocks(config, mempool_config, blocks)?;
            info!("Loaded {} blocks from storage", count);
            blockchain
        };

        blockchain.storage = Some(store);
        if blockchain.chain.len() == 1 {
            blockchain.persist(&blockchain.chain)?;
        }

        Ok(blockchain)
    }

    pub fn latest_block(&self) -> &Block {
        // The chain always holds at least the genesis block.
        &self.chain[self.chain.len() - 1]
    }

    pub fn chain(&self) -> &[Block] {
        &self.chain
    }

    /// Chain height, counting genesis
    pub fn len(&self) -> usize {
        self.chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    pub fn difficulty(&self) -> u32 {
        self.difficulty
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn utxos(&self) -> &UtxoSet {
        &self.utxos
    }

    pub fn mempool(&self) -> &Mempool {
        &self.mempool
    }

    pub fn mempool_stats(&self) -> MempoolStats {
        self.mempool.stats()
    }

    /// Pending transactions in mining order
    pub fn pending_transactions(&self) -> Vec<Transaction> {
        self.mempool.transactions_by_priority(None)
    }

    pub fn contract(&self, address: &str) -> Option<&Contract> {
        self.contracts.get(address)
    }

    pub fn contracts(&self) -> &ContractStore {
        &self.contracts
    }

    /// Spendable balance: owned outputs not reserved by a pending transaction
    pub fn get_balance(&self, address: &Address) -> f64 {
        self.spendable_utxos(address).iter().map(|utxo| utxo.amount).sum()
    }

    /// Every output owned by an address, reserved or not
    pub fn get_utxos_for_address(&self, address: &Address) -> Vec<Utxo> {
        self.utxos.for_address(address)
    }

    fn spendable_utxos(&self, address: &Address) -> Vec<Utxo> {
        self.utxos
            .for_address(address)
            .into_iter()
            .filter(|utxo| !self.mempool.is_reserved(&utxo.key()))
            .collect()
    }

    pub fn is_valid_transaction(&self, transaction: &Transaction) -> bool {
        self.validate_transaction(transaction).is_ok()
    }

    /// Checks a transaction against the current UTXO index and mempool
    ///
    /// Coinbase and contract transactions only need an intact hash, sane
    /// outputs and a gas limit within bounds; their effects are checked when
    /// a block applies them. A transaction already held by the mempool does
    /// not conflict with its own reservations.
    pub fn validate_transaction(&self, transaction: &Transaction) -> Result<(), BlockchainError> {
        check_structure(transaction, &self.config)?;
        if transaction.is_special() {
            return Ok(());
        }

        check_transfer(transaction, &self.utxos, self.config.transaction_fee)?;

        if self.mempool.contains(transaction.hash()) {
            return Ok(());
        }
        for input in transaction.inputs() {
            let key = input.utxo_key();
            if self.mempool.is_reserved(&key) {
                return Err(MempoolError::DoubleSpend(key).into());
            }
        }
        Ok(())
    }

    /// Validates a transaction and admits it to the mempool
    ///
    /// # Returns
    ///
    /// The transaction's priority, fee rate and position in mining order
    pub fn add_transaction(&mut self, transaction: Transaction) -> Result<Admission, BlockchainError> {
        if self.mempool.contains(transaction.hash()) {
            return Err(MempoolError::AlreadyPresent(transaction.hash().to_string()).into());
        }
        if transaction.is_coinbase() {
            return Err(BlockchainError::UnexpectedCoinbase);
        }

        self.validate_transaction(&transaction)?;

        let hash = transaction.hash().to_string();
        let admission = self.mempool.add(transaction, &self.utxos)?;
        debug!("Transaction {} added at position {}", hash, admission.position);
        Ok(admission)
    }

    /// Replace-by-fee for a pending transaction
    pub fn replace_transaction(
        &mut self,
        old_hash: &str,
        transaction: Transaction,
    ) -> Result<Admission, BlockchainError> {
        if transaction.is_coinbase() {
            return Err(BlockchainError::UnexpectedCoinbase);
        }
        check_structure(&transaction, &self.config)?;
        if !transaction.is_special() {
            check_transfer(&transaction, &self.utxos, self.config.transaction_fee)?;
        }

        Ok(self.mempool.replace(old_hash, transaction, &self.utxos)?)
    }

    /// Builds and signs a transfer from the key pair's spendable outputs
    ///
    /// Outputs are taken in key order until `amount + fee` is covered; any
    /// surplus comes back to the sender as change.
    pub fn create_transaction(
        &self,
        keypair: &KeyPair,
        to: &Address,
        amount: f64,
        fee: f64,
    ) -> Result<Transaction, BlockchainError> {
        let sender = keypair.address();
        let required = amount + fee;

        let mut selected = Vec::new();
        let mut total = 0.0;
        for utxo in self.spendable_utxos(sender) {
            if total >= required {
                break;
            }
            total += utxo.amount;
            selected.push(utxo);
        }

        if total < required {
            return Err(BlockchainError::InsufficientFunds {
                required,
                available: total,
            });
        }

        let inputs = selected
            .iter()
            .map(|utxo| TransactionInput::new(utxo.tx_hash.clone(), utxo.output_index))
            .collect();

        let mut outputs = vec![TransactionOutput::new(to.clone(), amount)];
        let change = total - required;
        if change > 0.0 {
            outputs.push(TransactionOutput::new(sender.clone(), change));
        }

        let mut transaction = Transaction::new(inputs, outputs);
        transaction.sign_all(keypair)?;
        Ok(transaction)
    }

    /// Assembles the next block from the mempool without mining it
    ///
    /// Transactions are staged in priority order against a copy of the
    /// ledger state; any that fail are left out and evicted from the mempool.
    /// The coinbase pays the mining reward plus the fees of what was kept.
    pub fn prepare_block(&mut self, miner_address: &Address) -> Result<BlockTemplate, BlockchainError> {
        let tip = self.latest_block();
        let index = tip.index + 1;
        let timestamp = Utc::now().timestamp_millis().max(tip.timestamp);
        let previous_hash = tip.hash.clone();

        let candidates = self
            .mempool
            .get_for_mining(self.config.max_block_transactions, self.config.max_block_bytes);

        let mut utxos = self.utxos.clone();
        let mut contracts = self.contracts.clone();
        let mut included = Vec::new();
        let mut rejected = Vec::new();
        let mut fees = 0.0;

        for transaction in candidates {
            match apply_transaction(&transaction, &mut utxos, &mut contracts, index, timestamp, &self.config) {
                Ok(fee) => {
                    fees += fee;
                    included.push(transaction);
                }
                Err(err) => {
                    warn!("Dropping transaction {} from block {}: {}", transaction.hash(), index, err);
                    rejected.push(transaction.hash().to_string());
                }
            }
        }

        for hash in &rejected {
            self.mempool.remove(hash);
        }

        let mut transactions = Vec::with_capacity(included.len() + 1);
        transactions.push(Transaction::coinbase(
            miner_address.clone(),
            index,
            self.config.mining_reward + fees,
        ));
        transactions.extend(included);

        Ok(BlockTemplate {
            block: Block::new(index, transactions, previous_hash, timestamp),
            difficulty: self.difficulty,
        })
    }

    /// Mines the pending transactions into a new block and appends it
    ///
    /// # Arguments
    ///
    /// * `miner_address` - The address receiving the reward and fees
    ///
    /// # Returns
    ///
    /// The newly mined block
    pub fn mine_pending_transactions(&mut self, miner_address: &Address) -> Result<Block, BlockchainError> {
        let BlockTemplate { mut block, difficulty } = self.prepare_block(miner_address)?;
        block.mine(difficulty);
        self.append_block(block.clone())?;
        Ok(block)
    }

    /// Validates a block extending the tip and applies it
    ///
    /// Either the whole block is applied or the ledger is left untouched.
    /// Mined transactions leave the mempool, stale reservations are cleared
    /// and difficulty is adjusted.
    pub fn append_block(&mut self, block: Block) -> Result<(), BlockchainError> {
        let tip = self.latest_block();
        if block.previous_hash != tip.hash || block.index != tip.index + 1 {
            return Err(BlockchainError::InvalidBlock(format!(
                "block {} does not extend tip {}",
                block.index, tip.index
            )));
        }
        check_block_header(&block).map_err(BlockchainError::InvalidBlock)?;
        if block.difficulty < self.difficulty {
            return Err(BlockchainError::InvalidBlock(format!(
                "difficulty {} is below the required {}",
                block.difficulty, self.difficulty
            )));
        }

        let (utxos, contracts) = self.stage_block(&block)?;
        self.persist(std::slice::from_ref(&block))?;

        self.utxos = utxos;
        self.contracts = contracts;
        for transaction in &block.transactions {
            self.mempool.remove(transaction.hash());
        }
        self.mempool.cleanup_invalid(&self.utxos);

        info!(
            "Block {} appended with {} transactions",
            block.index,
            block.transactions.len()
        );
        self.chain.push(block);
        self.adjust_difficulty();

        Ok(())
    }

    /// Applies a block's transactions to the UTXO index and contract store
    ///
    /// Consumed outputs are deleted, produced outputs inserted (except those
    /// addressed to the contract sentinel), and contract transactions run.
    /// Nothing changes unless every transaction applies.
    pub fn apply_block(&mut self, block: &Block) -> Result<(), BlockchainError> {
        let (utxos, contracts) = self.stage_block(block)?;
        self.utxos = utxos;
        self.contracts = contracts;
        Ok(())
    }

    fn stage_block(&self, block: &Block) -> Result<(UtxoSet, ContractStore), BlockchainError> {
        let mut utxos = self.utxos.clone();
        let mut contracts = self.contracts.clone();
        apply_block_to(block, &mut utxos, &mut contracts, &self.config)?;
        Ok((utxos, contracts))
    }

    fn adjust_difficulty(&mut self) {
        let next = next_difficulty(self.difficulty, &self.chain, &self.config);
        if next != self.difficulty {
            info!("Difficulty adjusted from {} to {}", self.difficulty, next);
            self.difficulty = next;
        }
    }

    /// Validates this ledger's own chain
    pub fn is_chain_valid(&self) -> bool {
        Self::is_valid_chain(&self.chain)
    }

    /// Validates a chain's integrity
    ///
    /// Every block after the first must hash to its stored hash, link to
    /// its predecessor, and satisfy its own recorded difficulty. Merkle roots
    /// and transaction hashes are recomputed as well, so altering any
    /// historical field is detected.
    pub fn is_valid_chain(chain: &[Block]) -> bool {
        if chain.is_empty() {
            return false;
        }

        for pair in chain.windows(2) {
            let (previous, current) = (&pair[0], &pair[1]);

            if current.previous_hash != previous.hash || current.index != previous.index + 1 {
                debug!("Block {} is not linked to block {}", current.index, previous.index);
                return false;
            }

            if let Err(reason) = check_block_header(current) {
                debug!("Block {} is invalid: {}", current.index, reason);
                return false;
            }
        }

        true
    }

    /// Replaces the chain with a strictly longer valid one
    ///
    /// The candidate must share our genesis block and replay cleanly; the
    /// UTXO index and contract store are rebuilt from it. Pending
    /// transactions the new chain invalidates are dropped.
    pub fn replace_chain(&mut self, blocks: Vec<Block>) -> Result<(), BlockchainError> {
        if blocks.len() <= self.chain.len() {
            return Err(BlockchainError::ChainNotLonger {
                local: self.chain.len(),
                received: blocks.len(),
            });
        }
        if blocks.first() != self.chain.first() {
            return Err(BlockchainError::InvalidChain("genesis block mismatch".to_string()));
        }
        if !Self::is_valid_chain(&blocks) {
            return Err(BlockchainError::InvalidChain("chain failed validation".to_string()));
        }

        let replayed = replay(&blocks, &self.config)?;
        self.persist(&blocks)?;

        info!(
            "Replacing chain of {} blocks with received chain of {} blocks",
            self.chain.len(),
            blocks.len()
        );

        for transaction in blocks.iter().flat_map(|block| block.transactions.iter()) {
            self.mempool.remove(transaction.hash());
        }
        self.chain = blocks;
        self.utxos = replayed.utxos;
        self.contracts = replayed.contracts;
        self.difficulty = replayed.difficulty;
        self.mempool.cleanup_invalid(&self.utxos);

        Ok(())
    }

    /// Gas estimate for calling a deployed contract at the next height
    pub fn estimate_gas(
        &self,
        contract_address: &str,
        method: &str,
        params: &BTreeMap<String, Value>,
        caller: &Address,
    ) -> Result<u64, BlockchainError> {
        let context = ExecutionContext {
            caller: caller.clone(),
            value: 0.0,
            block_number: self.latest_block().index + 1,
            timestamp: Utc::now().timestamp_millis(),
        };
        Ok(self
            .contracts
            .estimate_gas(contract_address, method, params, &context)?)
    }

    fn persist(&self, blocks: &[Block]) -> Result<(), BlockchainError> {
        let Some(store) = &self.storage else {
            return Ok(());
        };

        for block in blocks {
            store.save_block(block, self.config.mining_reward)?;
        }
        store.flush()?;
        Ok(())
    }
}

/// The genesis block every node with this configuration derives
pub fn genesis_block(config: &LedgerConfig) -> Block {
    Block::genesis(
        Address(config.genesis_address.clone()),
        config.genesis_amount,
        config.genesis_timestamp,
    )
}

/// Difficulty after `chain` grew to its current length
///
/// Only every `difficulty_adjustment_interval` blocks: one harder if the
/// last interval took less than half the expected time, one easier (never
/// below 1) if it took more than double.
pub fn next_difficulty(current: u32, chain: &[Block], config: &LedgerConfig) -> u32 {
    let interval = config.difficulty_adjustment_interval as usize;
    if interval == 0 || chain.len() < interval || chain.len() % interval != 0 {
        return current;
    }

    let latest = &chain[chain.len() - 1];
    let first = &chain[chain.len() - interval];
    let expected = config.target_block_time_ms * interval as i64;
    let taken = latest.timestamp - first.timestamp;

    if taken * 2 < expected {
        current + 1
    } else if taken > expected * 2 {
        current.saturating_sub(1).max(1)
    } else {
        current
    }
}

/// Self-consistency of a single block: hashes, Merkle root and proof of work
fn check_block_header(block: &Block) -> Result<(), String> {
    if block.hash != block.calculate_hash() {
        return Err("hash does not match contents".to_string());
    }
    if block.merkle_root != block.calculate_merkle_root() {
        return Err("merkle root does not match transactions".to_string());
    }
    if !block.meets_own_difficulty() {
        return Err(format!("hash does not meet difficulty {}", block.difficulty));
    }
    if let Some(transaction) = block.transactions.iter().find(|tx| !tx.has_valid_hash()) {
        return Err(format!("transaction {} hash does not match contents", transaction.hash()));
    }
    Ok(())
}

struct Replayed {
    utxos: UtxoSet,
    contracts: ContractStore,
    difficulty: u32,
}

/// Rebuilds ledger state by applying every block from genesis
///
/// Each mined block must meet the difficulty the chain itself implies at
/// that height.
fn replay(blocks: &[Block], config: &LedgerConfig) -> Result<Replayed, BlockchainError> {
    let mut utxos = UtxoSet::new();
    let mut contracts = ContractStore::new();
    let mut difficulty = config.initial_difficulty;

    for (position, block) in blocks.iter().enumerate() {
        if position > 0 && block.difficulty < difficulty {
            return Err(BlockchainError::InvalidChain(format!(
                "block {} has difficulty {}, expected at least {}",
                block.index, block.difficulty, difficulty
            )));
        }

        apply_block_to(block, &mut utxos, &mut contracts, config)
            .map_err(|err| BlockchainError::InvalidChain(format!("block {}: {}", block.index, err)))?;

        if position > 0 {
            difficulty = next_difficulty(difficulty, &blocks[..=position], config);
        }
    }

    Ok(Replayed {
        utxos,
        contracts,
        difficulty,
    })
}

/// Applies a block in transaction order
///
/// Leaves partial changes behind on failure; callers work on copies.
fn apply_block_to(
    block: &Block,
    utxos: &mut UtxoSet,
    contracts: &mut ContractStore,
    config: &LedgerConfig,
) -> Result<(), BlockchainError> {
    let mut fees = 0.0;

    for (position, transaction) in block.transactions.iter().enumerate() {
        if transaction.is_coinbase() && position != 0 {
            return Err(BlockchainError::InvalidBlock(format!(
                "coinbase at position {}",
                position
            )));
        }
        fees += apply_transaction(transaction, utxos, contracts, block.index, block.timestamp, config)?;
    }

    // Genesis issuance is exempt from the reward rule.
    if block.index > 0 {
        let coinbase = block
            .coinbase()
            .ok_or_else(|| BlockchainError::InvalidBlock("missing coinbase".to_string()))?;
        let allowed = config.mining_reward + fees;
        if coinbase.outputs().len() != 1 || coinbase.output_sum() > allowed {
            return Err(BlockchainError::InvalidBlock(format!(
                "coinbase pays {} but at most {} is allowed",
                coinbase.output_sum(),
                allowed
            )));
        }
    }

    Ok(())
}

/// Applies one transaction, returning the fee it pays
///
/// Either succeeds completely or leaves `utxos` and `contracts` unchanged.
fn apply_transaction(
    transaction: &Transaction,
    utxos: &mut UtxoSet,
    contracts: &mut ContractStore,
    height: u64,
    timestamp: i64,
    config: &LedgerConfig,
) -> Result<f64, BlockchainError> {
    check_structure(transaction, config)?;

    let fee = match transaction.kind() {
        TransactionKind::Transfer => {
            let fee = check_transfer(transaction, utxos, config.transaction_fee)?;
            for input in transaction.inputs() {
                utxos.remove(&input.utxo_key());
            }
            fee
        }
        TransactionKind::Coinbase { .. } => 0.0,
        TransactionKind::ContractDeploy(deploy) => {
            contracts.deploy(deploy, transaction.timestamp())?;
            0.0
        }
        TransactionKind::ContractCall(call) => {
            contracts.call(call, height, timestamp)?;
            0.0
        }
    };

    insert_outputs(utxos, transaction);
    Ok(fee)
}

/// Context-free checks: intact hash, well-formed outputs, bounded gas
fn check_structure(transaction: &Transaction, config: &LedgerConfig) -> Result<(), BlockchainError> {
    if !transaction.has_valid_hash() {
        return Err(TransactionError::HashMismatch.into());
    }
    transaction.check_outputs()?;

    if let Some(requested) = transaction.gas_limit() {
        if requested > config.max_gas_per_call {
            return Err(BlockchainError::GasLimitExceeded {
                requested,
                max: config.max_gas_per_call,
            });
        }
    }
    Ok(())
}

/// Checks a value transfer against `utxos`, returning its fee
///
/// Every input must reference an existing output, carry the public key of
/// that output's owner and a valid signature. Inputs must cover outputs
/// plus `minimum_fee`.
fn check_transfer(transaction: &Transaction, utxos: &UtxoSet, minimum_fee: f64) -> Result<f64, BlockchainError> {
    let mut seen = HashSet::new();
    let mut input_sum = 0.0;

    for (index, input) in transaction.inputs().iter().enumerate() {
        let key = input.utxo_key();
        let utxo = utxos
            .utxo(&key)
            .ok_or_else(|| BlockchainError::UnknownUtxo(key.clone()))?;
        if !seen.insert(key.clone()) {
            return Err(BlockchainError::DuplicateInput(key));
        }

        let public_key = input
            .public_key
            .as_deref()
            .ok_or(BlockchainError::MissingPublicKey(index))?;
        if Address::from_public_key_hex(public_key) != utxo.address {
            return Err(BlockchainError::OwnerMismatch(index));
        }
        if !transaction.verify(index, public_key) {
            return Err(BlockchainError::InvalidSignature(index));
        }

        input_sum += utxo.amount;
    }

    let output_sum = transaction.output_sum();
    let required = output_sum + minimum_fee;
    if input_sum < required {
        return Err(BlockchainError::InsufficientFunds {
            required,
            available: input_sum,
        });
    }

    Ok(input_sum - output_sum)
}

fn insert_outputs(utxos: &mut UtxoSet, transaction: &Transaction) {
    for (index, output) in transaction.outputs().iter().enumerate() {
        if output.address.as_str() == CONTRACT_ADDRESS {
            continue;
        }
        utxos.insert(Utxo {
            tx_hash: transaction.hash().to_string(),
            output_index: index as u32,
            address: output.address.clone(),
            amount: output.amount,
        });
    }
}
