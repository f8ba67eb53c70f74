use crate::constants::GENESIS_PAYER;
use crate::{validate, Amount, Block, Blockchain, ChainId, Transaction};
use anyhow::Result;
use thiserror::Error;
use uuid::Uuid;

/// Distinct outcomes of [`Repository::append_block`]. Callers react to each
/// one differently: a stale tip is retried, a duplicate is dropped.
#[derive(Debug, Error)]
pub enum AppendError {
    #[error("blockchain is not defined")]
    BlockchainUndefined,
    #[error("previous hash does not match the chain tip")]
    PrevHashMismatch,
    #[error("block hash does not match its digest or difficulty")]
    DigestMismatch,
    #[error("transaction is already in the chain")]
    AlreadyIn,
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Trait the storage backends implement for the node to operate.
/// This lives in `ledger-core` to avoid a circular dependency.
///
/// Block lists are newest-first everywhere.
pub trait Repository: Send + Sync {
    /// Create a chain together with its genesis block. Fails if `chain.id`
    /// is already taken.
    fn store(&self, chain: &Blockchain) -> Result<()>;
    fn get_blockchain(&self, id: ChainId) -> Result<Option<Blockchain>>;
    /// Drop a chain, its blocks and its pending pool. `false` if unknown.
    fn remove_chain(&self, id: ChainId) -> Result<bool>;
    fn list_chains(&self) -> Result<Vec<Blockchain>>;

    fn enqueue_transaction(&self, chain_id: ChainId, tx: &Transaction) -> Result<()>;
    /// Oldest pending transaction, left in the pool.
    fn fetch_oldest_pending(&self, chain_id: ChainId) -> Result<Option<Transaction>>;
    fn discard_pending(&self, chain_id: ChainId, tx_id: Uuid) -> Result<bool>;

    /// Up to `n` blocks from the tip.
    fn tail(&self, chain_id: ChainId, n: usize) -> Result<Vec<Block>>;
    fn fetch(&self, chain_id: ChainId) -> Result<Vec<Block>>;
    fn count_blocks(&self, chain_id: ChainId) -> Result<usize>;

    /// Guarded append: see [`validate::check_append`] plus the duplicate
    /// transaction check. Non-reward blocks also leave the pending pool.
    fn append_block(&self, block: &Block, is_reward: bool) -> Result<(), AppendError>;

    /// Swap the chain's blocks for `blocks`, keeping pending transactions.
    /// Re-checks that `blocks` is strictly longer while holding the write
    /// lock and returns `false` without touching anything otherwise.
    fn replace_chain_blocks(&self, chain_id: ChainId, blocks: &[Block]) -> Result<bool>;

    fn gather_by_payer(&self, chain_id: ChainId, payer_id: &str) -> Result<Vec<Transaction>> {
        Ok(self
            .fetch(chain_id)?
            .into_iter()
            .map(|b| b.payload)
            .filter(|tx| tx.payer_id == payer_id)
            .collect())
    }

    /// Walk the whole chain re-checking digests, difficulty and links.
    fn verify(&self, chain_id: ChainId) -> Result<bool> {
        let Some(chain) = self.get_blockchain(chain_id)? else {
            return Ok(false);
        };
        let blocks = self.fetch(chain_id)?;
        Ok(validate::verify_chain(&blocks, chain.difficulty).is_ok())
    }
}

/// Zero-amount genesis block with an empty previous hash. It is not mined:
/// the genesis block is exempt from the difficulty check.
pub fn genesis_block(chain_id: ChainId) -> Block {
    let payload = Transaction {
        id: Uuid::nil(),
        payer_id: GENESIS_PAYER.to_string(),
        amount: Amount::ZERO,
        tax: None,
    };
    Block::new(chain_id, "", payload)
}
