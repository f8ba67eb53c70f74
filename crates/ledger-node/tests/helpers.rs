#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use ledger_core::chain::Repository;
use ledger_core::{Amount, Block, Blockchain, ChainId, Transaction};
use ledger_node::p2p::{NetworkConfig, P2pNode};
use ledger_storage::MemoryStore;
use tokio_util::sync::CancellationToken;

pub const DIFFICULTY: u32 = 1;
/// Long enough that discovery never fires on its own during a test.
pub const QUIET: Duration = Duration::from_secs(3600);

pub fn test_chain(name: &str, difficulty: u32) -> Blockchain {
    Blockchain::new(name, Amount::whole(10).unwrap(), difficulty)
}

pub fn payment(payer: &str, whole: i64) -> Transaction {
    Transaction::new(payer, Amount::whole(whole).unwrap())
}

/// Append `count` mined payment blocks to an existing chain.
pub fn extend(repo: &dyn Repository, chain: &Blockchain, count: usize) {
    for i in 0..count {
        let tip = repo.tail(chain.id, 1).unwrap().remove(0);
        let mut block = Block::new(chain.id, tip.hash, payment(&format!("payer-{i}"), 1));
        block
            .mine(chain.difficulty, &CancellationToken::new())
            .unwrap();
        repo.append_block(&block, true).unwrap();
    }
}

pub async fn running_node() -> (P2pNode, Arc<MemoryStore>, SocketAddr) {
    let repo = Arc::new(MemoryStore::new());
    let node = P2pNode::new(repo.clone(), NetworkConfig::default());
    let addr = node
        .start("127.0.0.1:0".parse().unwrap(), QUIET)
        .await
        .unwrap();
    (node, repo, addr)
}

/// Poll `check` until it holds or five seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

pub fn count(repo: &dyn Repository, chain_id: ChainId) -> usize {
    repo.count_blocks(chain_id).unwrap()
}
