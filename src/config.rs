use config::builder::{ConfigBuilder, DefaultState};
use config::Environment;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::env;

/// Prefix of the nested overrides, e.g. `STRAT_LEDGER__MAX_BLOCK_BYTES`
const ENV_PREFIX: &str = "STRAT";

/// Short variable names and the configuration keys they override
const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("P2P_PORT", "p2p_port"),
    ("MINER_ADDRESS", "miner_address"),
    ("DATA_DIR", "data_dir"),
    ("DIFFICULTY", "ledger.initial_difficulty"),
    ("MINING_REWARD", "ledger.mining_reward"),
    ("MAX_GAS_PER_CALL", "ledger.max_gas_per_call"),
    ("MEMPOOL_MAX_SIZE", "mempool.max_size"),
    ("MIN_FEE_RATE", "mempool.min_fee_rate"),
];

/// Errors that can occur while loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Load(#[from] config::ConfigError),
}

/// Consensus and economic parameters of the ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Difficulty used for the first mined block
    pub initial_difficulty: u32,

    /// Reward paid to the miner of each block, before fees
    pub mining_reward: f64,

    /// Minimum surplus a transfer must leave between inputs and outputs
    pub transaction_fee: f64,

    /// Expected time between blocks in milliseconds
    pub target_block_time_ms: i64,

    /// Number of blocks between difficulty adjustments
    pub difficulty_adjustment_interval: u64,

    /// Owner of the genesis issuance
    pub genesis_address: String,

    /// Amount issued in the genesis block
    pub genesis_amount: f64,

    /// Timestamp of the genesis block. Fixed so that all nodes agree on genesis.
    pub genesis_timestamp: i64,

    /// Maximum transactions pulled from the mempool per block
    pub max_block_transactions: usize,

    /// Maximum serialized bytes pulled from the mempool per block
    pub max_block_bytes: usize,

    /// Highest gas limit a contract deployment or call may request
    pub max_gas_per_call: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        LedgerConfig {
            initial_difficulty: 4,
            mining_reward: 50.0,
            transaction_fee: 0.01,
            target_block_time_ms: 10_000,
            difficulty_adjustment_interval: 10,
            genesis_address: "GENESIS".to_string(),
            genesis_amount: 1_000_000.0,
            genesis_timestamp: 1_700_000_000_000,
            max_block_transactions: 100,
            max_block_bytes: 1_000_000,
            max_gas_per_call: 10_000_000,
        }
    }
}

/// Mempool admission limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MempoolConfig {
    /// Maximum number of pending transactions
    pub max_size: usize,

    /// Minimum fee per serialized byte
    pub min_fee_rate: f64,
}

impl Default for MempoolConfig {
    fn default() -> Self {
        MempoolConfig {
            max_size: 10_000,
            min_fee_rate: 0.001,
        }
    }
}

/// Top-level node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Port the gossip listener binds to
    pub p2p_port: u16,

    /// Peers dialed at startup, as `host:port`
    pub peers: Vec<String>,

    /// When set, the node mines continuously and pays rewards here
    pub miner_address: Option<String>,

    /// When set, mined blocks are persisted under this directory
    pub data_dir: Option<String>,

    pub ledger: LedgerConfig,

    pub mempool: MempoolConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            p2p_port: 6001,
            peers: Vec::new(),
            miner_address: None,
            data_dir: None,
            ledger: LedgerConfig::default(),
            mempool: MempoolConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Builds a configuration from defaults overridden by environment variables
    ///
    /// Recognized variables: `P2P_PORT`, `PEERS` (comma separated),
    /// `MINER_ADDRESS`, `DATA_DIR`, `DIFFICULTY`, `MINING_REWARD`,
    /// `MAX_GAS_PER_CALL`, `MEMPOOL_MAX_SIZE`, `MIN_FEE_RATE`. Any other key
    /// can be set as `STRAT_<SECTION>__<KEY>`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let builder = config::Config::builder().add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("peers")
                .try_parsing(true),
        );

        Self::build(builder, |key| env::var(key).ok())
    }

    /// Layers the short-name overrides found by `lookup` on top of `builder`
    fn build<F>(mut builder: ConfigBuilder<DefaultState>, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        for (var, key) in ENV_OVERRIDES {
            if let Some(value) = lookup(*var).filter(|value| !value.trim().is_empty()) {
                builder = builder.set_override(*key, value.trim().to_string())?;
            }
        }

        if let Some(peers) = lookup("PEERS") {
            let peers: Vec<String> = peers
                .split(',')
                .map(str::trim)
                .filter(|peer| !peer.is_empty())
                .map(String::from)
                .collect();
            builder = builder.set_override("peers", peers)?;
        }

        Ok(builder.build()?.try_deserialize()?)
    }
}
