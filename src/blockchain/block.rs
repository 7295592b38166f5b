use chrono::Utc;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use super::chain::Blockchain;
use super::crypto::{hash_value, Address};
use super::transaction::Transaction;

/// How many nonces are tried between cancellation checks
const CANCEL_CHECK_INTERVAL: u64 = 10_000;

/// Represents a block in the blockchain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    /// Height of the block in the chain
    pub index: u64,

    /// Creation time in milliseconds since the Unix epoch
    pub timestamp: i64,

    /// Transactions in block order; the coinbase comes first
    pub transactions: Vec<Transaction>,

    /// Hash of the previous block
    pub previous_hash: String,

    /// Proof of work
    pub nonce: u64,

    /// Number of leading zero hex digits the hash must have
    pub difficulty: u32,

    /// Root of the binary hash tree over transaction hashes
    pub merkle_root: String,

    pub hash: String,
}

impl Block {
    /// Creates an unmined block
    ///
    /// The Merkle root and hash are computed immediately; the hash only
    /// becomes valid once [`Block::mine`] finds a suitable nonce.
    pub fn new(index: u64, transactions: Vec<Transaction>, previous_hash: String, timestamp: i64) -> Self {
        let merkle_root = merkle_root(&transactions);
        let mut block = Block {
            index,
            timestamp,
            transactions,
            previous_hash,
            nonce: 0,
            difficulty: 0,
            merkle_root,
            hash: String::new(),
        };
        block.hash = block.calculate_hash();
        block
    }

    /// Creates the genesis block issuing `amount` to `address`
    pub fn genesis(address: Address, amount: f64, timestamp: i64) -> Self {
        let issuance = Transaction::coinbase_at(address, 0, amount, timestamp);
        Block::new(0, vec![issuance], "0".to_string(), timestamp)
    }

    /// Creates the next unmined block on top of `previous`, stamped now
    pub fn next(previous: &Block, transactions: Vec<Transaction>) -> Self {
        let timestamp = Utc::now().timestamp_millis().max(previous.timestamp);
        Block::new(previous.index + 1, transactions, previous.hash.clone(), timestamp)
    }

    /// Calculates the hash of the block header
    pub fn calculate_hash(&self) -> String {
        let transaction_hashes: Vec<&str> = self.transactions.iter().map(Transaction::hash).collect();

        hash_value(&json!({
            "index": self.index,
            "timestamp": self.timestamp,
            "transactions": transaction_hashes,
            "previousHash": self.previous_hash,
            "nonce": self.nonce,
            "merkleRoot": self.merkle_root,
        }))
    }

    pub fn calculate_merkle_root(&self) -> String {
        merkle_root(&self.transactions)
    }

    /// Searches for a nonce whose hash has `difficulty` leading zeros
    pub fn mine(&mut self, difficulty: u32) {
        let never = AtomicBool::new(false);
        self.mine_cancellable(difficulty, &never);
    }

    /// Proof-of-work search that gives up when `cancel` is raised
    ///
    /// Returns `true` when a valid nonce was found, `false` when cancelled.
    pub fn mine_cancellable(&mut self, difficulty: u32, cancel: &AtomicBool) -> bool {
        self.difficulty = difficulty;
        self.nonce = 0;
        let started = Instant::now();

        debug!("Mining block {} with difficulty {}", self.index, difficulty);

        loop {
            self.hash = self.calculate_hash();
            if meets_difficulty(&self.hash, difficulty) {
                break;
            }

            self.nonce += 1;
            if self.nonce % CANCEL_CHECK_INTERVAL == 0 {
                if cancel.load(Ordering::Relaxed) {
                    debug!("Mining of block {} cancelled at nonce {}", self.index, self.nonce);
                    return false;
                }
                std::thread::yield_now();
            }
        }

        info!(
            "Block {} mined: nonce {}, hash {}, {:.2}s",
            self.index,
            self.nonce,
            self.hash,
            started.elapsed().as_secs_f64()
        );
        true
    }

    /// Whether the stored hash satisfies the recorded difficulty
    pub fn meets_own_difficulty(&self) -> bool {
        meets_difficulty(&self.hash, self.difficulty)
    }

    /// Every non-coinbase transaction must pass the ledger's validity check
    pub fn has_valid_transactions(&self, ledger: &Blockchain) -> bool {
        self.transactions
            .iter()
            .filter(|transaction| !transaction.is_coinbase())
            .all(|transaction| ledger.is_valid_transaction(transaction))
    }

    /// The block's reward transaction, if it has one
    pub fn coinbase(&self) -> Option<&Transaction> {
        self.transactions.first().filter(|transaction| transaction.is_coinbase())
    }
}

/// Whether a hex hash starts with `difficulty` zero characters
pub fn meets_difficulty(hash: &str, difficulty: u32) -> bool {
    let difficulty = difficulty as usize;
    hash.len() >= difficulty && hash.bytes().take(difficulty).all(|b| b == b'0')
}

/// Root of the pairwise hash tree over transaction hashes
///
/// Odd levels duplicate their last hash. An empty list has an empty root and
/// a single transaction's root is its own hash.
pub fn merkle_root(transactions: &[Transaction]) -> String {
    let mut level: Vec<String> = transactions.iter().map(|tx| tx.hash().to_string()).collect();
    if level.is_empty() {
        return String::new();
    }

    while level.len() > 1 {
        if level.len() % 2 != 0 {
            if let Some(last) = level.last().cloned() {
                level.push(last);
            }
        }

        level = level
            .chunks(2)
            .map(|pair| hash_value(&Value::String(format!("{}{}", pair[0], pair[1]))))
            .collect();
    }

    level.swap_remove(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coinbase(name: &str, height: u64) -> Transaction {
        Transaction::coinbase_at(Address::from(name), height, 10.0, 1_000 + height as i64)
    }

    #[test]
    fn test_new_block() {
        let transactions = vec![coinbase("recipient1", 1), coinbase("recipient2", 2)];
        let block = Block::new(1, transactions, "previous_hash".to_string(), 5_000);

        assert_eq!(block.index, 1);
        assert_eq!(block.nonce, 0);
        assert_eq!(block.previous_hash, "previous_hash");
        assert_eq!(block.hash, block.calculate_hash());
        assert_eq!(block.hash.len(), 64);
    }

    #[test]
    fn test_hash_is_deterministic() {
        let a = Block::genesis(Address::from("GENESIS"), 1_000_000.0, 42);
        let b = Block::genesis(Address::from("GENESIS"), 1_000_000.0, 42);
        assert_eq!(a.hash, b.hash);
        assert_eq!(a.calculate_hash(), a.calculate_hash());
    }

    #[test]
    fn test_merkle_root_single_and_empty() {
        let tx = coinbase("solo", 1);
        assert_eq!(merkle_root(std::slice::from_ref(&tx)), tx.hash());
        assert_eq!(merkle_root(&[]), "");
    }

    #[test]
    fn test_merkle_root_tracks_order_and_membership() {
        let (a, b, c) = (coinbase("a", 1), coinbase("b", 2), coinbase("c", 3));

        let abc = merkle_root(&[a.clone(), b.clone(), c.clone()]);
        let bac = merkle_root(&[b.clone(), a.clone(), c.clone()]);
        let ab = merkle_root(&[a.clone(), b.clone()]);
        let abcc = merkle_root(&[a.clone(), b.clone(), c.clone(), c.clone()]);

        assert_ne!(abc, bac);
        assert_ne!(abc, ab);
        assert_eq!(abc, merkle_root(&[a, b, c]));
        // Odd levels duplicate their last hash.
        assert_eq!(abc, abcc);
    }

    #[test]
    fn test_mine_meets_difficulty() {
        let mut block = Block::new(1, vec![coinbase("miner", 1)], "0".repeat(64), 7_000);
        block.mine(3);

        assert!(block.hash.starts_with("000"));
        assert_eq!(block.difficulty, 3);
        assert_eq!(block.hash, block.calculate_hash());
        assert!(block.meets_own_difficulty());
    }

    #[test]
    fn test_higher_difficulty_needs_more_work_on_average() {
        let average_attempts = |difficulty: u32| -> f64 {
            let rounds = 32;
            let total: u64 = (0..rounds)
                .map(|round| {
                    let mut block = Block::new(round + 1, vec![coinbase("miner", round + 1)], "0".repeat(64), 7_000);
                    block.mine(difficulty);
                    block.nonce + 1
                })
                .sum();
            total as f64 / rounds as f64
        };

        // 16 expected attempts at difficulty 1, 256 at difficulty 2
        let easy = average_attempts(1);
        let hard = average_attempts(2);
        assert!(hard > easy * 2.0, "difficulty 2 averaged {} attempts, difficulty 1 {}", hard, easy);
    }

    #[test]
    fn test_mine_cancelled() {
        let mut block = Block::new(1, vec![coinbase("miner", 1)], "0".repeat(64), 7_000);
        let cancel = AtomicBool::new(true);

        // Difficulty 64 is unreachable; the raised flag must stop the search.
        assert!(!block.mine_cancellable(64, &cancel));
        assert_eq!(block.nonce, CANCEL_CHECK_INTERVAL);
    }

    #[test]
    fn test_meets_difficulty() {
        assert!(meets_difficulty("00ab", 2));
        assert!(!meets_difficulty("0a0b", 2));
        assert!(meets_difficulty("abcd", 0));
        assert!(!meets_difficulty("00", 3));
    }
}
