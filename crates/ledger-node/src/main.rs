use anyhow::{Context, Result};
use clap::Parser;
use ledger_core::chain::Repository;
use ledger_node::control::{self, AppState};
use ledger_node::{Args, Miner, NodeConfig, P2pNode, StorageConfig};
use ledger_storage::{MemoryStore, SledStore};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = NodeConfig::try_from(Args::parse())?;
    let repo: Arc<dyn Repository> = match &config.storage {
        StorageConfig::Sled(dir) => Arc::new(
            SledStore::open(dir).with_context(|| format!("opening {}", dir.display()))?,
        ),
        StorageConfig::Memory => {
            warn!("running with in-memory storage");
            Arc::new(MemoryStore::new())
        }
    };

    let shutdown = CancellationToken::new();
    let node = P2pNode::new(repo.clone(), config.network.clone());
    let miner = Miner::new(repo.clone(), shutdown.child_token());

    // known before start, so the first discovery cycle dials them
    for (host, port) in &config.peers {
        if let Err(e) = node.add_known_peer(host, *port).await {
            warn!(%host, port, error = %e, "bootstrap peer not resolvable");
        }
    }
    node.start(config.p2p_addr, config.discovery_interval).await?;

    let state = AppState {
        repo,
        node: node.clone(),
        miner: miner.clone(),
        started_at: Instant::now(),
        shutdown: shutdown.clone(),
        reward_address: config.reward_address.clone(),
    };
    let app = control::router(state);

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("ctrl-c received");
                    shutdown.cancel();
                }
                Err(e) => warn!(error = %e, "cannot listen for ctrl-c"),
            }
        }
    });

    let listener = tokio::net::TcpListener::bind(config.control_addr).await?;
    info!("ledger-node control API on http://{}", config.control_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await?;

    info!("shutting down");
    miner.cancel();
    node.stop().await?;
    Ok(())
}
