use std::path::Path;

use log::debug;
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use thiserror::Error;

use super::block::Block;
use super::crypto::Address;
use super::transaction::Transaction;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),
}

/// At-rest shape of a block
///
/// Carries every header field plus a summary of the coinbase payout so a
/// stored chain can be inspected without replaying it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockRecord {
    pub index: u64,
    pub timestamp: i64,
    pub transactions: Vec<Transaction>,
    pub previous_hash: String,
    pub hash: String,
    pub nonce: u64,
    pub difficulty: u32,
    pub merkle_root: String,
    pub miner: Option<Address>,
    pub reward: f64,
    pub total_fees: f64,
    pub transaction_count: usize,
}

impl BlockRecord {
    /// Builds the record of a block
    ///
    /// # Arguments
    ///
    /// * `block` - The block to record
    /// * `mining_reward` - The fixed block reward; anything the coinbase pays
    ///   beyond it is counted as fees. The genesis issuance is all reward.
    pub fn from_block(block: &Block, mining_reward: f64) -> Self {
        let coinbase = block.coinbase();
        let miner = coinbase
            .and_then(|tx| tx.outputs().first())
            .map(|output| output.address.clone());
        let payout = coinbase.map(Transaction::output_sum).unwrap_or(0.0);

        let reward = if block.index == 0 { payout } else { payout.min(mining_reward) };

        BlockRecord {
            index: block.index,
            timestamp: block.timestamp,
            transactions: block.transactions.clone(),
            previous_hash: block.previous_hash.clone(),
            hash: block.hash.clone(),
            nonce: block.nonce,
            difficulty: block.difficulty,
            merkle_root: block.merkle_root.clone(),
            miner,
            reward,
            total_fees: payout - reward,
            transaction_count: block.transactions.len(),
        }
    }

    pub fn into_block(self) -> Block {
        Block {
            index: self.index,
            timestamp: self.timestamp,
            transactions: self.transactions,
            previous_hash: self.previous_hash,
            nonce: self.nonce,
            difficulty: self.difficulty,
            merkle_root: self.merkle_root,
            hash: self.hash,
        }
    }
}

/// Durable block storage
///
/// Records are keyed by big-endian height so the tree iterates in chain
/// order. Records are JSON encoded, the height marker with bincode.
pub struct BlockStore {
    db: Db,
    blocks: Tree,
    metadata: Tree,
}

impl std::fmt::Debug for BlockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockStore")
            .field("blocks", &self.blocks.len())
            .finish()
    }
}

impl BlockStore {
    /// Opens (or creates) a block store at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    pub fn from_db(db: Db) -> Result<Self, StorageError> {
        let blocks = db.open_tree("blocks")?;
        let metadata = db.open_tree("metadata")?;

        Ok(Self { db, blocks, metadata })
    }

    /// Saves a block, overwriting any record at the same height
    ///
    /// # Arguments
    ///
    /// * `block` - The block to save
    /// * `mining_reward` - Block reward used to split the coinbase payout
    pub fn save_block(&self, block: &Block, mining_reward: f64) -> Result<(), StorageError> {
        let record = BlockRecord::from_block(block, mining_reward);
        let value = serde_json::to_vec(&record)
            .map_err(|e| StorageError::SerializationError(e.to_string()))?;

        self.blocks.insert(block.index.to_be_bytes(), value)?;

        let height = self.height()?.map_or(block.index, |stored| stored.max(block.index));
        let height_bytes = bincode::serialize(&height)
            .map_err(|e| StorageError::SerializationError(e.to_string()))?;
        self.metadata.insert("block_height", height_bytes)?;

        debug!("Stored block {} ({})", block.index, block.hash);
        Ok(())
    }

    /// Every stored record in height order
    pub fn load_records(&self) -> Result<Vec<BlockRecord>, StorageError> {
        let mut records = Vec::new();

        for result in self.blocks.iter() {
            let (_, value) = result?;
            let record: BlockRecord = serde_json::from_slice(&value)
                .map_err(|e| StorageError::DeserializationError(e.to_string()))?;
            records.push(record);
        }

        Ok(records)
    }

    /// Every stored block in height order
    pub fn load_blocks(&self) -> Result<Vec<Block>, StorageError> {
        Ok(self
            .load_records()?
            .into_iter()
            .map(BlockRecord::into_block)
            .collect())
    }

    /// Highest index saved so far
    pub fn height(&self) -> Result<Option<u64>, StorageError> {
        match self.metadata.get("block_height")? {
            Some(bytes) => {
                let height = bincode::deserialize(&bytes)
                    .map_err(|e| StorageError::DeserializationError(e.to_string()))?;
                Ok(Some(height))
            }
            None => Ok(None),
        }
    }

    /// Flushes pending writes to disk, returning the number of bytes flushed
    pub fn flush(&self) -> Result<usize, StorageError> {
        Ok(self.db.flush()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temporary_store() -> BlockStore {
        let db = sled::Config::new().temporary(true).open().unwrap();
        BlockStore::from_db(db).unwrap()
    }

    fn mined_block(previous: &Block, miner: &str, payout: f64) -> Block {
        let coinbase = Transaction::coinbase(Address::from(miner), previous.index + 1, payout);
        let mut block = Block::next(previous, vec![coinbase]);
        block.mine(1);
        block
    }

    #[test]
    fn test_save_and_load_blocks() {
        let store = temporary_store();
        let genesis = Block::genesis(Address::from("GENESIS"), 1_000.0, 1_000);
        let first = mined_block(&genesis, "miner", 50.0);

        // Saved out of order on purpose; loading follows height
        store.save_block(&first, 50.0).unwrap();
        store.save_block(&genesis, 50.0).unwrap();
        store.flush().unwrap();

        let blocks = store.load_blocks().unwrap();
        assert_eq!(blocks, vec![genesis, first]);
        // Saving a lower block never lowers the recorded height
        assert_eq!(store.height().unwrap(), Some(1));
    }

    #[test]
    fn test_record_splits_reward_and_fees() {
        let genesis = Block::genesis(Address::from("GENESIS"), 1_000.0, 1_000);
        let block = mined_block(&genesis, "miner", 53.5);

        let record = BlockRecord::from_block(&block, 50.0);
        assert_eq!(record.miner, Some(Address::from("miner")));
        assert_eq!(record.reward, 50.0);
        assert_eq!(record.total_fees, 3.5);
        assert_eq!(record.transaction_count, 1);

        let genesis_record = BlockRecord::from_block(&genesis, 50.0);
        assert_eq!(genesis_record.reward, 1_000.0);
        assert_eq!(genesis_record.total_fees, 0.0);
    }

    #[test]
    fn test_record_round_trip_is_lossless() {
        let genesis = Block::genesis(Address::from("GENESIS"), 1_000.0, 1_000);
        let block = mined_block(&genesis, "miner", 50.0);

        let json = serde_json::to_string(&BlockRecord::from_block(&block, 50.0)).unwrap();
        assert!(json.contains("\"previousHash\""));
        assert!(json.contains("\"transactionCount\""));

        let record: BlockRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(record.into_block(), block);
    }

    #[test]
    fn test_overwrite_same_height() {
        let store = temporary_store();
        let genesis = Block::genesis(Address::from("GENESIS"), 1_000.0, 1_000);
        let first = mined_block(&genesis, "alice", 50.0);
        let competing = mined_block(&genesis, "bob", 50.0);

        store.save_block(&genesis, 50.0).unwrap();
        store.save_block(&first, 50.0).unwrap();
        store.save_block(&competing, 50.0).unwrap();

        let blocks = store.load_blocks().unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[1], competing);
        assert_eq!(store.height().unwrap(), Some(1));
    }

    #[test]
    fn test_empty_store() {
        let store = temporary_store();
        assert!(store.load_blocks().unwrap().is_empty());
        assert_eq!(store.height().unwrap(), None);
    }
}
