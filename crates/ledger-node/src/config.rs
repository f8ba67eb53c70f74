use crate::constants::{
    DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_CONTROL_ADDR, DEFAULT_DATA_DIR, DEFAULT_DISCOVERY_SECS,
    DEFAULT_P2P_ADDR,
};
use crate::p2p::NetworkConfig;
use anyhow::{bail, Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(name = "ledger-node", version, about = "Peer-to-peer hash-chained ledger daemon")]
pub struct Args {
    /// Control API address, e.g. 127.0.0.1:8080
    #[arg(long, env = "LEDGER_CONTROL_ADDR", default_value = DEFAULT_CONTROL_ADDR)]
    pub listen: SocketAddr,

    /// P2P listen address
    #[arg(long, env = "LEDGER_P2P_ADDR", default_value = DEFAULT_P2P_ADDR)]
    pub p2p: SocketAddr,

    /// Data directory for sled
    #[arg(long, env = "LEDGER_DATA_DIR", default_value = DEFAULT_DATA_DIR)]
    pub data_dir: PathBuf,

    /// Keep everything in memory; nothing survives a restart
    #[arg(long, env = "LEDGER_EPHEMERAL")]
    pub ephemeral: bool,

    /// Seconds between discovery cycles
    #[arg(long, env = "LEDGER_DISCOVERY_SECS", default_value_t = DEFAULT_DISCOVERY_SECS)]
    pub discovery_secs: u64,

    /// Outbound connect timeout in milliseconds
    #[arg(long, env = "LEDGER_CONNECT_TIMEOUT_MS", default_value_t = DEFAULT_CONNECT_TIMEOUT_MS)]
    pub connect_timeout_ms: u64,

    /// Bootstrap peer as host:port; repeatable
    #[arg(long = "peer", env = "LEDGER_PEERS", value_delimiter = ',')]
    pub peers: Vec<String>,

    /// Reward address used by `mine` when the request names none
    #[arg(long, env = "LEDGER_REWARD_ADDRESS", default_value = "node")]
    pub reward_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageConfig {
    Sled(PathBuf),
    Memory,
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub control_addr: SocketAddr,
    pub p2p_addr: SocketAddr,
    pub storage: StorageConfig,
    pub discovery_interval: Duration,
    /// Bootstrap peers, already split into host and port.
    pub peers: Vec<(String, u16)>,
    pub reward_address: String,
    pub network: NetworkConfig,
}

impl TryFrom<Args> for NodeConfig {
    type Error = anyhow::Error;

    fn try_from(args: Args) -> Result<Self> {
        if args.discovery_secs == 0 {
            bail!("discovery interval must be at least one second");
        }
        let peers = args
            .peers
            .iter()
            .map(String::as_str)
            .map(split_host_port)
            .collect::<Result<Vec<_>>>()?;
        let storage = if args.ephemeral {
            StorageConfig::Memory
        } else {
            StorageConfig::Sled(args.data_dir)
        };
        Ok(Self {
            control_addr: args.listen,
            p2p_addr: args.p2p,
            storage,
            discovery_interval: Duration::from_secs(args.discovery_secs),
            peers,
            reward_address: args.reward_address,
            network: NetworkConfig {
                connect_timeout: Duration::from_millis(args.connect_timeout_ms),
                ..NetworkConfig::default()
            },
        })
    }
}

/// `host:port`, where host may be a name, an IPv4 address or a bracketed IPv6 address.
pub fn split_host_port(peer: &str) -> Result<(String, u16)> {
    let (host, port) = peer
        .rsplit_once(':')
        .with_context(|| format!("peer `{peer}` is not host:port"))?;
    let port = port
        .parse()
        .with_context(|| format!("peer `{peer}` has an invalid port"))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        bail!("peer `{peer}` has an empty host");
    }
    Ok((host.to_string(), port))
}
