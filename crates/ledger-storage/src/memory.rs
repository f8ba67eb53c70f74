use anyhow::{bail, Result};
use ledger_core::chain::{genesis_block, AppendError, Repository};
use ledger_core::validate::check_append;
use ledger_core::{Block, Blockchain, ChainId, Transaction};
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use uuid::Uuid;

struct ChainState {
    blockchain: Blockchain,
    /// Oldest first; the tip is the last element.
    blocks: Vec<Block>,
    pending: VecDeque<Transaction>,
}

impl ChainState {
    fn tip_hash(&self) -> &str {
        self.blocks.last().map(|b| b.hash.as_str()).unwrap_or_default()
    }

    fn newest_first(&self, n: usize) -> Vec<Block> {
        self.blocks.iter().rev().take(n).cloned().collect()
    }
}

/// In-process repository for `--ephemeral` daemons and tests. Same semantics
/// as [`crate::sled_store::SledStore`]; nothing survives the process.
#[derive(Default)]
pub struct MemoryStore {
    chains: RwLock<HashMap<ChainId, ChainState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Repository for MemoryStore {
    fn store(&self, chain: &Blockchain) -> Result<()> {
        let mut chains = self.chains.write();
        if chains.contains_key(&chain.id) {
            bail!("blockchain {} already exists", chain.id);
        }
        chains.insert(
            chain.id,
            ChainState {
                blockchain: chain.clone(),
                blocks: vec![genesis_block(chain.id)],
                pending: VecDeque::new(),
            },
        );
        Ok(())
    }

    fn get_blockchain(&self, id: ChainId) -> Result<Option<Blockchain>> {
        Ok(self.chains.read().get(&id).map(|s| s.blockchain.clone()))
    }

    fn remove_chain(&self, id: ChainId) -> Result<bool> {
        Ok(self.chains.write().remove(&id).is_some())
    }

    fn list_chains(&self) -> Result<Vec<Blockchain>> {
        let mut chains: Vec<_> = self
            .chains
            .read()
            .values()
            .map(|s| s.blockchain.clone())
            .collect();
        chains.sort_by_key(|c| c.id);
        Ok(chains)
    }

    fn enqueue_transaction(&self, chain_id: ChainId, tx: &Transaction) -> Result<()> {
        let mut chains = self.chains.write();
        let Some(state) = chains.get_mut(&chain_id) else {
            bail!("blockchain {chain_id} is not defined");
        };
        if state.pending.iter().any(|p| p.id == tx.id) {
            bail!("transaction {} is already pending", tx.id);
        }
        state.pending.push_back(tx.clone());
        Ok(())
    }

    fn fetch_oldest_pending(&self, chain_id: ChainId) -> Result<Option<Transaction>> {
        Ok(self
            .chains
            .read()
            .get(&chain_id)
            .and_then(|s| s.pending.front().cloned()))
    }

    fn discard_pending(&self, chain_id: ChainId, tx_id: Uuid) -> Result<bool> {
        let mut chains = self.chains.write();
        let Some(state) = chains.get_mut(&chain_id) else {
            return Ok(false);
        };
        let before = state.pending.len();
        state.pending.retain(|p| p.id != tx_id);
        Ok(state.pending.len() != before)
    }

    fn tail(&self, chain_id: ChainId, n: usize) -> Result<Vec<Block>> {
        Ok(self
            .chains
            .read()
            .get(&chain_id)
            .map(|s| s.newest_first(n))
            .unwrap_or_default())
    }

    fn fetch(&self, chain_id: ChainId) -> Result<Vec<Block>> {
        self.tail(chain_id, usize::MAX)
    }

    fn count_blocks(&self, chain_id: ChainId) -> Result<usize> {
        Ok(self.chains.read().get(&chain_id).map_or(0, |s| s.blocks.len()))
    }

    fn append_block(&self, block: &Block, is_reward: bool) -> Result<(), AppendError> {
        let mut chains = self.chains.write();
        let Some(state) = chains.get_mut(&block.chain_id) else {
            return Err(AppendError::BlockchainUndefined);
        };
        check_append(block, &state.blockchain, state.tip_hash())?;
        if state.blocks.iter().any(|b| b.payload.id == block.payload.id) {
            return Err(AppendError::AlreadyIn);
        }
        if !is_reward {
            state.pending.retain(|p| p.id != block.payload.id);
        }
        state.blocks.push(block.clone());
        Ok(())
    }

    fn replace_chain_blocks(&self, chain_id: ChainId, blocks: &[Block]) -> Result<bool> {
        let mut chains = self.chains.write();
        let Some(state) = chains.get_mut(&chain_id) else {
            bail!("blockchain {chain_id} is not defined");
        };
        if blocks.len() <= state.blocks.len() {
            return Ok(false);
        }
        state.blocks = blocks.iter().rev().cloned().collect();
        Ok(true)
    }
}
