#![allow(dead_code)]

use std::fs;

use ledger_core::chain::genesis_block;
use ledger_core::{Amount, Block, Blockchain, ChainId, Transaction};
use ledger_storage::sled_store::SledStore;
use tempfile::{tempdir, TempDir};
use tokio_util::sync::CancellationToken;

pub const DIFFICULTY: u32 = 1;

pub fn create_temp_store() -> (TempDir, SledStore) {
    // Create a temporary directory for the sled database
    let temp_dir = tempdir().expect("Failed to create temp dir");
    let db_path = temp_dir.path().to_path_buf();
    (
        temp_dir,
        SledStore::open(&db_path).expect("Failed to open SledStore"),
    )
}

pub fn teardown_store(temp_dir: TempDir, store: SledStore) {
    let db_path = temp_dir.path().to_path_buf();
    store.clear().expect("Failed to clear the store");
    drop(store);
    temp_dir.close().expect("Failed to delete temp dir");
    let _ = fs::remove_dir_all(&db_path);
    assert!(!db_path.exists(), "Database directory should be removed");
}

pub fn test_chain(name: &str) -> Blockchain {
    Blockchain::new(name, Amount::whole(10).unwrap(), DIFFICULTY)
}

pub fn payment(payer: &str, whole: i64) -> Transaction {
    Transaction::new(payer, Amount::whole(whole).unwrap())
}

/// Block mined on top of `previous` at [`DIFFICULTY`].
pub fn mined(chain_id: ChainId, previous: &str, payload: Transaction) -> Block {
    let mut block = Block::new(chain_id, previous, payload);
    block
        .mine(DIFFICULTY, &CancellationToken::new())
        .expect("mining at difficulty 1 cannot fail");
    block
}

/// A valid chain of `len` blocks (genesis included), newest first.
pub fn offered_blocks(chain_id: ChainId, len: usize) -> Vec<Block> {
    let mut blocks = vec![genesis_block(chain_id)];
    for i in 1..len {
        let previous = blocks[i - 1].hash.clone();
        blocks.push(mined(chain_id, &previous, payment(&format!("remote-{i}"), 1)));
    }
    blocks.reverse();
    blocks
}
