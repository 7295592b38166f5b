use anyhow::Context;
use log::info;
use parking_lot::RwLock;

use std::sync::Arc;

use strat_node::blockchain::{Address, BlockStore, Blockchain};
use strat_node::config::NodeConfig;
use strat_node::miner::Miner;
use strat_node::p2p::GossipNode;

// Initialize the blockchain, from storage when a data directory is configured
fn initialize_blockchain(config: &NodeConfig) -> anyhow::Result<Blockchain> {
    let Some(data_dir) = &config.data_dir else {
        info!("No data directory configured, keeping the chain in memory");
        return Ok(Blockchain::new(config.ledger.clone(), config.mempool.clone()));
    };

    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("creating data directory {}", data_dir))?;
    let store = BlockStore::open(data_dir)
        .with_context(|| format!("opening block store at {}", data_dir))?;

    let blockchain = Blockchain::with_storage(config.ledger.clone(), config.mempool.clone(), store)
        .with_context(|| format!("loading blockchain from {}", data_dir))?;
    info!("Loaded blockchain from storage at {}", data_dir);

    Ok(blockchain)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logger
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config = NodeConfig::from_env()?;
    let blockchain = initialize_blockchain(&config)?;
    info!(
        "Chain height {}, tip {}",
        blockchain.len(),
        blockchain.latest_block().hash
    );

    let node = GossipNode::new(Arc::new(RwLock::new(blockchain)));
    node.listen(&format!("0.0.0.0:{}", config.p2p_port)).await?;

    if !config.peers.is_empty() {
        let connected = node.connect_to_peers(&config.peers).await;
        info!("Connected to {} of {} peers", connected, config.peers.len());
    }

    if let Some(miner_address) = &config.miner_address {
        let miner = Miner::new(
            Arc::clone(node.ledger()),
            Address(miner_address.clone()),
            node.mining_cancel(),
        );
        tokio::spawn(miner.run(node.clone()));
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    Ok(())
}
