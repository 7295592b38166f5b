use serde::{Deserialize, Serialize};

use crate::blockchain::{Block, Transaction};

/// Gossip envelope, encoded as `{"type": ..., "data": ...}` JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    QueryLatest,
    QueryAll,
    ResponseBlockchain(Vec<Block>),
    QueryTransactionPool,
    ResponseTransactionPool(Vec<Transaction>),
    NewTransaction(Transaction),
    NewBlock(Block),
}

impl Message {
    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            Message::QueryLatest => "QUERY_LATEST",
            Message::QueryAll => "QUERY_ALL",
            Message::ResponseBlockchain(_) => "RESPONSE_BLOCKCHAIN",
            Message::QueryTransactionPool => "QUERY_TRANSACTION_POOL",
            Message::ResponseTransactionPool(_) => "RESPONSE_TRANSACTION_POOL",
            Message::NewTransaction(_) => "NEW_TRANSACTION",
            Message::NewBlock(_) => "NEW_BLOCK",
        }
    }
}
