//! Ledger daemon: P2P protocol and node, mining orchestrator, control API.

pub mod config;
pub mod constants;
pub mod control;
pub mod miner;
pub mod p2p;

pub use config::{Args, NodeConfig, StorageConfig};
pub use control::{AppState, ControlRequest, ControlResponse};
pub use miner::{Miner, MiningError};
pub use p2p::P2pNode;
