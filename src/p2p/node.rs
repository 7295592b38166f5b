use dashmap::DashMap;
use futures::future::join_all;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::Serialize;
use thiserror::Error;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, error::TrySendError, Receiver, Sender};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use uuid::Uuid;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::message::Message;
use crate::blockchain::mempool::Admission;
use crate::blockchain::{Block, BlockchainError, MempoolError, SharedBlockchain, Transaction};

/// Errors on a peer connection
#[derive(Debug, Error)]
pub enum P2pError {
    #[error("Network error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Encoding error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("Framing error: {0}")]
    Framing(#[from] LinesCodecError),
}

/// Longest message line accepted from a peer; longer lines drop the peer
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 32 * 1024 * 1024;

/// Outgoing messages queued per peer before further ones are dropped
const PEER_QUEUE_CAPACITY: usize = 1024;

/// A connected peer as reported by [`GossipNode::peers`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeerInfo {
    pub id: Uuid,
    pub addr: SocketAddr,
    pub inbound: bool,
}

struct Peer {
    addr: SocketAddr,
    inbound: bool,
    sender: Sender<Message>,
}

/// Gossip participant: peer registry plus chain and mempool reconciliation
///
/// Each connection runs a reader task and a writer task. Messages are
/// newline-delimited JSON envelopes. The node never touches ledger state
/// directly; everything goes through the ledger's public operations under
/// its lock, and no lock is held across an await point.
#[derive(Clone)]
pub struct GossipNode {
    ledger: SharedBlockchain,
    peers: Arc<DashMap<Uuid, Peer>>,
    mining_cancel: Arc<AtomicBool>,
    max_message_bytes: usize,
}

impl GossipNode {
    pub fn new(ledger: SharedBlockchain) -> Self {
        GossipNode {
            ledger,
            peers: Arc::new(DashMap::new()),
            mining_cancel: Arc::new(AtomicBool::new(false)),
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        }
    }

    /// Caps the length of a single incoming message line
    pub fn with_max_message_bytes(mut self, max_message_bytes: usize) -> Self {
        self.max_message_bytes = max_message_bytes;
        self
    }

    pub fn ledger(&self) -> &SharedBlockchain {
        &self.ledger
    }

    /// Flag raised whenever a peer block advances the chain
    pub fn mining_cancel(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.mining_cancel)
    }

    /// Binds the gossip listener and accepts peers in the background
    ///
    /// # Returns
    ///
    /// The bound address, useful when binding port 0
    pub async fn listen(&self, addr: &str) -> Result<SocketAddr, P2pError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("Listening for peers on {}", local_addr);

        let node = self.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        node.attach(stream, addr, true);
                    }
                    Err(err) => warn!("Failed to accept peer connection: {}", err),
                }
            }
        });

        Ok(local_addr)
    }

    /// Dials a peer at `host:port`
    pub async fn connect(&self, addr: &str) -> Result<Uuid, P2pError> {
        let stream = TcpStream::connect(addr).await?;
        let peer_addr = stream.peer_addr()?;
        Ok(self.attach(stream, peer_addr, false))
    }

    /// Dials every address concurrently, returning how many connected
    pub async fn connect_to_peers(&self, addrs: &[String]) -> usize {
        let results = join_all(addrs.iter().map(|addr| self.connect(addr))).await;

        let mut connected = 0;
        for (addr, result) in addrs.iter().zip(results) {
            match result {
                Ok(_) => connected += 1,
                Err(err) => warn!("Failed to connect to peer {}: {}", addr, err),
            }
        }
        connected
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.peers
            .iter()
            .map(|entry| PeerInfo {
                id: *entry.key(),
                addr: entry.addr,
                inbound: entry.inbound,
            })
            .collect()
    }

    fn attach(&self, stream: TcpStream, addr: SocketAddr, inbound: bool) -> Uuid {
        let id = Uuid::new_v4();
        let (reader, writer) = stream.into_split();
        let (sender, receiver) = mpsc::channel(PEER_QUEUE_CAPACITY);

        self.peers.insert(id, Peer { addr, inbound, sender });
        info!(
            "Peer {} connected from {} ({})",
            id,
            addr,
            if inbound { "inbound" } else { "outbound" }
        );

        tokio::spawn(write_loop(id, writer, receiver));

        let node = self.clone();
        tokio::spawn(async move {
            if let Err(err) = node.read_loop(id, reader).await {
                warn!("Connection to peer {} failed: {}", id, err);
            }
            node.peers.remove(&id);
            info!("Peer {} disconnected", id);
        });

        self.send(id, Message::QueryLatest);
        self.send(id, Message::QueryTransactionPool);
        id
    }

    async fn read_loop(&self, id: Uuid, reader: OwnedReadHalf) -> Result<(), P2pError> {
        let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(self.max_message_bytes));

        while let Some(line) = lines.next().await {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Message>(&line) {
                Ok(message) => self.handle_message(id, message),
                Err(err) => warn!("Discarding malformed message from peer {}: {}", id, err),
            }
        }

        Ok(())
    }

    fn send(&self, peer: Uuid, message: Message) {
        if let Some(entry) = self.peers.get(&peer) {
            enqueue(peer, &entry.sender, message);
        }
    }

    pub fn broadcast(&self, message: &Message) {
        self.broadcast_filtered(message, None);
    }

    fn broadcast_except(&self, origin: Uuid, message: &Message) {
        self.broadcast_filtered(message, Some(origin));
    }

    fn broadcast_filtered(&self, message: &Message, skip: Option<Uuid>) {
        for entry in self.peers.iter() {
            if Some(*entry.key()) == skip {
                continue;
            }
            enqueue(*entry.key(), &entry.sender, message.clone());
        }
    }

    /// Announces the local tip as a one-block chain response
    pub fn broadcast_latest(&self) {
        let tip = self.ledger.read().latest_block().clone();
        self.broadcast(&Message::ResponseBlockchain(vec![tip]));
    }

    pub fn broadcast_block(&self, block: &Block) {
        self.broadcast(&Message::NewBlock(block.clone()));
    }

    pub fn broadcast_transaction(&self, transaction: &Transaction) {
        self.broadcast(&Message::NewTransaction(transaction.clone()));
    }

    /// Admits a local transaction and gossips it
    pub fn submit_transaction(&self, transaction: Transaction) -> Result<Admission, BlockchainError> {
        let admission = self.ledger.write().add_transaction(transaction.clone())?;
        self.broadcast_transaction(&transaction);
        Ok(admission)
    }

    /// Processes one message from a peer
    ///
    /// Never fails: anything a peer sends that the ledger rejects is logged
    /// and discarded.
    pub fn handle_message(&self, peer: Uuid, message: Message) {
        debug!("Received {} from peer {}", message.kind(), peer);

        match message {
            Message::QueryLatest => {
                let tip = self.ledger.read().latest_block().clone();
                self.send(peer, Message::ResponseBlockchain(vec![tip]));
            }
            Message::QueryAll => {
                let chain = self.ledger.read().chain().to_vec();
                self.send(peer, Message::ResponseBlockchain(chain));
            }
            Message::ResponseBlockchain(blocks) => self.handle_blockchain_response(peer, blocks),
            Message::QueryTransactionPool => {
                let pending = self.ledger.read().pending_transactions();
                self.send(peer, Message::ResponseTransactionPool(pending));
            }
            Message::ResponseTransactionPool(transactions) => {
                for transaction in transactions {
                    self.accept_transaction(peer, transaction);
                }
            }
            Message::NewTransaction(transaction) => self.accept_transaction(peer, transaction),
            Message::NewBlock(block) => self.handle_new_block(peer, block),
        }
    }

    fn accept_transaction(&self, peer: Uuid, transaction: Transaction) {
        let hash = transaction.hash().to_string();
        let result = self.ledger.write().add_transaction(transaction.clone());

        match result {
            Ok(_) => {
                debug!("Accepted transaction {} from peer {}", hash, peer);
                self.broadcast_except(peer, &Message::NewTransaction(transaction));
            }
            Err(BlockchainError::MempoolError(MempoolError::AlreadyPresent(_))) => {
                debug!("Transaction {} from peer {} already known", hash, peer);
            }
            Err(err) => warn!("Discarding transaction {} from peer {}: {}", hash, peer, err),
        }
    }

    fn handle_new_block(&self, peer: Uuid, block: Block) {
        let (extends_tip, ahead) = {
            let ledger = self.ledger.read();
            let tip = ledger.latest_block();
            (
                block.previous_hash == tip.hash && block.index == tip.index + 1,
                block.index > tip.index,
            )
        };

        if extends_tip {
            let result = self.ledger.write().append_block(block.clone());
            match result {
                Ok(()) => {
                    info!("Appended block {} from peer {}", block.index, peer);
                    self.chain_advanced();
                    self.broadcast_except(peer, &Message::NewBlock(block));
                }
                Err(err) => warn!("Discarding block {} from peer {}: {}", block.index, peer, err),
            }
        } else if ahead {
            info!("Block {} from peer {} does not extend our tip, querying full chain", block.index, peer);
            self.send(peer, Message::QueryAll);
        } else {
            debug!("Ignoring stale block {} from peer {}", block.index, peer);
        }
    }

    /// Longest-valid-chain reconciliation
    fn handle_blockchain_response(&self, peer: Uuid, blocks: Vec<Block>) {
        let Some(received) = blocks.last() else {
            debug!("Peer {} sent an empty chain", peer);
            return;
        };

        let (tip_index, tip_hash) = {
            let ledger = self.ledger.read();
            let tip = ledger.latest_block();
            (tip.index, tip.hash.clone())
        };

        if received.index <= tip_index {
            debug!(
                "Peer {} is not ahead: received block {}, local tip {}",
                peer, received.index, tip_index
            );
            return;
        }

        if received.previous_hash == tip_hash {
            let block = received.clone();
            let index = block.index;
            let result = self.ledger.write().append_block(block);
            match result {
                Ok(()) => {
                    info!("Appended block {} from peer {}", index, peer);
                    self.chain_advanced();
                    self.broadcast_latest();
                }
                Err(err) => warn!("Discarding block {} from peer {}: {}", index, peer, err),
            }
        } else if blocks.len() == 1 {
            info!(
                "Peer {} is ahead at block {}, querying full chain",
                peer, received.index
            );
            self.send(peer, Message::QueryAll);
        } else {
            let received_len = blocks.len();
            let result = self.ledger.write().replace_chain(blocks);
            match result {
                Ok(()) => {
                    info!("Adopted chain of {} blocks from peer {}", received_len, peer);
                    self.chain_advanced();
                    self.broadcast_latest();
                }
                Err(err) => warn!("Discarding chain from peer {}: {}", peer, err),
            }
        }
    }

    fn chain_advanced(&self) {
        self.mining_cancel.store(true, Ordering::SeqCst);
    }
}

/// Queues a message without waiting; a peer that stops reading loses messages
fn enqueue(peer: Uuid, sender: &Sender<Message>, message: Message) {
    match sender.try_send(message) {
        Ok(()) => {}
        Err(TrySendError::Full(message)) => {
            warn!("Peer {} is not keeping up, {} dropped", peer, message.kind());
        }
        Err(TrySendError::Closed(message)) => {
            debug!("Peer {} is closing, {} dropped", peer, message.kind());
        }
    }
}

async fn write_loop(id: Uuid, writer: OwnedWriteHalf, mut receiver: Receiver<Message>) {
    let mut lines = FramedWrite::new(writer, LinesCodec::new());

    while let Some(message) = receiver.recv().await {
        if let Err(err) = write_message(&mut lines, &message).await {
            warn!("Failed to send {} to peer {}: {}", message.kind(), id, err);
            break;
        }
    }
}

async fn write_message(
    lines: &mut FramedWrite<OwnedWriteHalf, LinesCodec>,
    message: &Message,
) -> Result<(), P2pError> {
    let line = serde_json::to_string(message)?;
    lines.send(line).await?;
    Ok(())
}
