// Gossip networking
//
// Peers exchange newline-delimited JSON envelopes over TCP and converge on
// the longest valid chain.

pub mod message;
pub mod node;

pub use message::Message;
pub use node::{GossipNode, P2pError, PeerInfo};
