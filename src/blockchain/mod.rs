// Blockchain module
//
// This module contains the core ledger implementation including:
// - Block structure and Merkle commitments
// - Transactions over unspent outputs
// - Cryptography utilities
// - The UTXO index, mempool and contract store
// - Block storage

pub mod block;
pub mod chain;
pub mod contract;
pub mod crypto;
pub mod mempool;
pub mod storage;
pub mod transaction;
pub mod utxo;

// Re-export main components for easier access
pub use block::Block;
pub use chain::{Blockchain, BlockchainError, SharedBlockchain};
pub use contract::{Contract, ContractStore};
pub use crypto::{Address, KeyPair};
pub use mempool::{Mempool, MempoolError};
pub use storage::BlockStore;
pub use transaction::Transaction;
pub use utxo::{Utxo, UtxoKey, UtxoSet};
