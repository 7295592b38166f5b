pub mod blockchain;
pub mod config;
pub mod miner;
pub mod p2p;
pub mod vm;
