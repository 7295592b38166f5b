use log::{error, info, warn};
use thiserror::Error;
use tokio::task::JoinError;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::blockchain::chain::BlockTemplate;
use crate::blockchain::{Address, Block, BlockchainError, SharedBlockchain};
use crate::p2p::GossipNode;

/// Pause after a failed mining round before trying again
const RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum MinerError {
    #[error("Blockchain error: {0}")]
    BlockchainError(#[from] BlockchainError),

    #[error("Mining task failed: {0}")]
    TaskError(#[from] JoinError),
}

/// Proof-of-work worker
///
/// The ledger lock is taken only to assemble a block template and to commit
/// the result. The nonce search runs on the blocking pool and stops early
/// when the cancel flag is raised.
pub struct Miner {
    ledger: SharedBlockchain,
    address: Address,
    cancel: Arc<AtomicBool>,
}

impl Miner {
    pub fn new(ledger: SharedBlockchain, address: Address, cancel: Arc<AtomicBool>) -> Self {
        Miner {
            ledger,
            address,
            cancel,
        }
    }

    /// Stops the search in progress, if any
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Mines and appends one block
    ///
    /// # Returns
    ///
    /// The appended block, or `None` when the search was cancelled or the
    /// chain moved on before the block could be committed
    pub async fn mine_block(&self) -> Result<Option<Block>, MinerError> {
        let BlockTemplate { mut block, difficulty } = self.ledger.write().prepare_block(&self.address)?;
        self.cancel.store(false, Ordering::SeqCst);

        let cancel = Arc::clone(&self.cancel);
        let (block, found) = tokio::task::spawn_blocking(move || {
            let found = block.mine_cancellable(difficulty, &cancel);
            (block, found)
        })
        .await?;

        if !found {
            info!("Mining of block {} cancelled", block.index);
            return Ok(None);
        }

        let result = self.ledger.write().append_block(block.clone());
        match result {
            Ok(()) => Ok(Some(block)),
            Err(BlockchainError::InvalidBlock(reason)) => {
                warn!("Discarding stale block {}: {}", block.index, reason);
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Mines forever, announcing every block to the node's peers
    pub async fn run(self, node: GossipNode) {
        info!("Mining to {}", self.address);

        loop {
            match self.mine_block().await {
                Ok(Some(block)) => node.broadcast_block(&block),
                Ok(None) => {}
                Err(err) => {
                    error!("Mining failed: {}", err);
                    tokio::time::sleep(RETRY_DELAY).await;
                }
            }
            tokio::task::yield_now().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::Blockchain;
    use crate::config::{LedgerConfig, MempoolConfig};
    use parking_lot::RwLock;

    fn shared_ledger(initial_difficulty: u32) -> SharedBlockchain {
        let config = LedgerConfig {
            initial_difficulty,
            ..LedgerConfig::default()
        };
        Arc::new(RwLock::new(Blockchain::new(config, MempoolConfig::default())))
    }

    #[tokio::test]
    async fn test_mine_block_appends() {
        let ledger = shared_ledger(1);
        let miner = Miner::new(ledger.clone(), Address::from("miner"), Arc::new(AtomicBool::new(false)));

        let block = miner.mine_block().await.unwrap().unwrap();

        let ledger = ledger.read();
        assert_eq!(ledger.latest_block(), &block);
        assert_eq!(ledger.get_balance(&Address::from("miner")), 50.0);
    }

    #[tokio::test]
    async fn test_cancelled_search_leaves_chain_untouched() {
        // Unreachable difficulty: the search only ends through cancellation
        let ledger = shared_ledger(64);
        let cancel = Arc::new(AtomicBool::new(false));
        let miner = Miner::new(ledger.clone(), Address::from("miner"), Arc::clone(&cancel));

        let handle = tokio::spawn(async move { miner.mine_block().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        // The search does not hold the ledger lock
        assert!(ledger.try_write().is_some());

        while !handle.is_finished() {
            cancel.store(true, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert!(handle.await.unwrap().unwrap().is_none());
        assert_eq!(ledger.read().len(), 1);
    }
}
