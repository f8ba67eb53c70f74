use anyhow::{bail, Context, Result};
use ledger_core::chain::{genesis_block, AppendError, Repository};
use ledger_core::validate::check_append;
use ledger_core::{Block, Blockchain, ChainId, Transaction};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionalTree};
use sled::{Db, IVec, Transactional, Tree};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

const TREE_CHAINS: &str = "chains";
const TREE_BLOCKS: &str = "blocks";
const TREE_TX_INDEX: &str = "tx_index";
const TREE_PENDING: &str = "pending";
const TREE_PENDING_IDS: &str = "pending_ids";

type TxResult = Result<(), ConflictableTransactionError<sled::Error>>;

/// Per-chain metadata plus the tip pointer. `height` counts the genesis block.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct ChainRecord {
  blockchain: Blockchain,
  tip: String,
  height: u64,
}

/// Durable repository on sled. Keys are prefixed with the 16 chain id bytes:
///
/// - `chains`: chain → [`ChainRecord`]
/// - `blocks`: chain ++ hash → block
/// - `tx_index`: chain ++ tx id → block hash
/// - `pending`: chain ++ sequence (BE) → transaction, so a prefix scan is FIFO
/// - `pending_ids`: chain ++ tx id → sequence
///
/// Reads are lock-free; writers are serialised by `write` so the checks made
/// before a transaction still hold when it commits.
#[derive(Clone)]
pub struct SledStore {
  db: Db,
  chains: Tree,
  blocks: Tree,
  tx_index: Tree,
  pending: Tree,
  pending_ids: Tree,
  write: Arc<Mutex<()>>,
}

impl SledStore {
  pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
    let path = path.as_ref();
    let db = sled::open(path).with_context(|| format!("opening sled at {}", path.display()))?;
    let store = Self::from_db(db)?;
    info!(path = %path.display(), "sled store opened");
    Ok(store)
  }

  /// Store backed by a temporary sled directory, removed on drop.
  pub fn temporary() -> Result<Self> {
    let db = sled::Config::new().temporary(true).open()?;
    Self::from_db(db)
  }

  fn from_db(db: Db) -> Result<Self> {
    Ok(Self {
      chains: db.open_tree(TREE_CHAINS)?,
      blocks: db.open_tree(TREE_BLOCKS)?,
      tx_index: db.open_tree(TREE_TX_INDEX)?,
      pending: db.open_tree(TREE_PENDING)?,
      pending_ids: db.open_tree(TREE_PENDING_IDS)?,
      db,
      write: Arc::new(Mutex::new(())),
    })
  }

  pub fn flush(&self) -> Result<()> {
    self.db.flush()?;
    Ok(())
  }

  /// Remove every chain, block and pending transaction.
  pub fn clear(&self) -> Result<()> {
    let _guard = self.write.lock();
    for tree in [&self.chains, &self.blocks, &self.tx_index, &self.pending, &self.pending_ids] {
      tree.clear()?;
    }
    self.flush()
  }

  fn record(&self, id: ChainId) -> Result<Option<ChainRecord>> {
    self.chains.get(id.as_bytes())?.map(|v| decode(&v)).transpose()
  }

  fn block(&self, chain_id: ChainId, hash: &str) -> Result<Option<Block>> {
    self
      .blocks
      .get(key(chain_id, hash.as_bytes()))?
      .map(|v| decode(&v))
      .transpose()
  }

  /// Walk previous-hash links back from the tip, at most `limit` blocks.
  fn walk(&self, chain_id: ChainId, limit: usize) -> Result<Vec<Block>> {
    let Some(record) = self.record(chain_id)? else {
      return Ok(Vec::new());
    };
    let mut out = Vec::new();
    let mut next = record.tip;
    while out.len() < limit {
      let Some(block) = self.block(chain_id, &next)? else {
        bail!("chain {chain_id} is missing block {next}");
      };
      let done = block.is_genesis();
      next = block.previous_hash.clone();
      out.push(block);
      if done {
        break;
      }
    }
    Ok(out)
  }

  fn keys_with_prefix(tree: &Tree, chain_id: ChainId) -> Result<Vec<IVec>> {
    tree
      .scan_prefix(chain_id.as_bytes())
      .keys()
      .map(|k| k.map_err(anyhow::Error::from))
      .collect()
  }

  fn try_append(&self, block: &Block, is_reward: bool) -> Result<(), AppendError> {
    let chain_id = block.chain_id;
    let _guard = self.write.lock();
    let Some(mut record) = self.record(chain_id)? else {
      return Err(AppendError::BlockchainUndefined);
    };
    check_append(block, &record.blockchain, &record.tip)?;

    let tx_key = key(chain_id, block.payload.id.as_bytes());
    if self.tx_index.contains_key(&tx_key).map_err(storage)? {
      return Err(AppendError::AlreadyIn);
    }
    let pending_seq = if is_reward {
      None
    } else {
      self.pending_ids.get(&tx_key).map_err(storage)?
    };

    record.tip = block.hash.clone();
    record.height += 1;
    let record_bytes = encode(&record)?;
    let block_bytes = encode(block)?;
    let block_key = key(chain_id, block.hash.as_bytes());

    (&self.chains, &self.blocks, &self.tx_index, &self.pending, &self.pending_ids)
      .transaction(|(chains, blocks, tx_index, pending, pending_ids)| -> TxResult {
        blocks.insert(block_key.as_slice(), block_bytes.as_slice())?;
        tx_index.insert(tx_key.as_slice(), block.hash.as_bytes())?;
        chains.insert(&chain_id.as_bytes()[..], record_bytes.as_slice())?;
        if let Some(seq) = &pending_seq {
          pending.remove(key(chain_id, seq))?;
          pending_ids.remove(tx_key.as_slice())?;
        }
        Ok(())
      })
      .map_err(storage)?;
    self.flush()?;
    debug!(
      chain = %chain_id,
      hash = %block.hash,
      height = record.height,
      is_reward,
      "appended block"
    );
    Ok(())
  }
}

impl Repository for SledStore {
  fn store(&self, chain: &Blockchain) -> Result<()> {
    let _guard = self.write.lock();
    if self.chains.contains_key(chain.id.as_bytes())? {
      bail!("blockchain {} already exists", chain.id);
    }
    let genesis = genesis_block(chain.id);
    let record = ChainRecord {
      blockchain: chain.clone(),
      tip: genesis.hash.clone(),
      height: 1,
    };
    let record_bytes = encode(&record)?;
    let block_bytes = encode(&genesis)?;
    let block_key = key(chain.id, genesis.hash.as_bytes());
    let tx_key = key(chain.id, genesis.payload.id.as_bytes());

    (&self.chains, &self.blocks, &self.tx_index)
      .transaction(|(chains, blocks, tx_index)| -> TxResult {
        blocks.insert(block_key.as_slice(), block_bytes.as_slice())?;
        tx_index.insert(tx_key.as_slice(), genesis.hash.as_bytes())?;
        chains.insert(&chain.id.as_bytes()[..], record_bytes.as_slice())?;
        Ok(())
      })?;
    self.flush()?;
    info!(chain = %chain.id, name = %chain.name, "stored blockchain");
    Ok(())
  }

  fn get_blockchain(&self, id: ChainId) -> Result<Option<Blockchain>> {
    Ok(self.record(id)?.map(|r| r.blockchain))
  }

  fn remove_chain(&self, id: ChainId) -> Result<bool> {
    let _guard = self.write.lock();
    if !self.chains.contains_key(id.as_bytes())? {
      return Ok(false);
    }
    let blocks = Self::keys_with_prefix(&self.blocks, id)?;
    let txs = Self::keys_with_prefix(&self.tx_index, id)?;
    let pending = Self::keys_with_prefix(&self.pending, id)?;
    let pending_ids = Self::keys_with_prefix(&self.pending_ids, id)?;

    (&self.chains, &self.blocks, &self.tx_index, &self.pending, &self.pending_ids)
      .transaction(|(chains, b, t, p, pi)| -> TxResult {
        chains.remove(&id.as_bytes()[..])?;
        remove_all(b, &blocks)?;
        remove_all(t, &txs)?;
        remove_all(p, &pending)?;
        remove_all(pi, &pending_ids)?;
        Ok(())
      })?;
    self.flush()?;
    info!(chain = %id, blocks = blocks.len(), "removed blockchain");
    Ok(true)
  }

  fn list_chains(&self) -> Result<Vec<Blockchain>> {
    self
      .chains
      .iter()
      .values()
      .map(|v| -> Result<Blockchain> { Ok(decode::<ChainRecord>(&v?)?.blockchain) })
      .collect()
  }

  fn enqueue_transaction(&self, chain_id: ChainId, tx: &Transaction) -> Result<()> {
    let _guard = self.write.lock();
    if !self.chains.contains_key(chain_id.as_bytes())? {
      bail!("blockchain {chain_id} is not defined");
    }
    let id_key = key(chain_id, tx.id.as_bytes());
    if self.pending_ids.contains_key(&id_key)? {
      bail!("transaction {} is already pending", tx.id);
    }
    let seq = self.db.generate_id()?.to_be_bytes();
    let tx_bytes = encode(tx)?;
    let pending_key = key(chain_id, &seq);

    (&self.pending, &self.pending_ids)
      .transaction(|(pending, pending_ids)| -> TxResult {
        pending.insert(pending_key.as_slice(), tx_bytes.as_slice())?;
        pending_ids.insert(id_key.as_slice(), &seq[..])?;
        Ok(())
      })?;
    self.flush()?;
    debug!(chain = %chain_id, tx = %tx.id, "enqueued transaction");
    Ok(())
  }

  fn fetch_oldest_pending(&self, chain_id: ChainId) -> Result<Option<Transaction>> {
    match self.pending.scan_prefix(chain_id.as_bytes()).values().next() {
      Some(v) => Ok(Some(decode(&v?)?)),
      None => Ok(None),
    }
  }

  fn discard_pending(&self, chain_id: ChainId, tx_id: Uuid) -> Result<bool> {
    let _guard = self.write.lock();
    let id_key = key(chain_id, tx_id.as_bytes());
    let Some(seq) = self.pending_ids.get(&id_key)? else {
      return Ok(false);
    };
    (&self.pending, &self.pending_ids)
      .transaction(|(pending, pending_ids)| -> TxResult {
        pending.remove(key(chain_id, &seq))?;
        pending_ids.remove(id_key.as_slice())?;
        Ok(())
      })?;
    self.flush()?;
    Ok(true)
  }

  fn tail(&self, chain_id: ChainId, n: usize) -> Result<Vec<Block>> {
    self.walk(chain_id, n)
  }

  fn fetch(&self, chain_id: ChainId) -> Result<Vec<Block>> {
    self.walk(chain_id, usize::MAX)
  }

  fn count_blocks(&self, chain_id: ChainId) -> Result<usize> {
    Ok(self.record(chain_id)?.map_or(0, |r| r.height as usize))
  }

  fn append_block(&self, block: &Block, is_reward: bool) -> Result<(), AppendError> {
    self.try_append(block, is_reward)
  }

  fn replace_chain_blocks(&self, chain_id: ChainId, blocks: &[Block]) -> Result<bool> {
    let _guard = self.write.lock();
    let Some(mut record) = self.record(chain_id)? else {
      bail!("blockchain {chain_id} is not defined");
    };
    if blocks.len() as u64 <= record.height {
      return Ok(false);
    }
    let Some(tip) = blocks.first() else {
      return Ok(false);
    };
    let old_blocks = Self::keys_with_prefix(&self.blocks, chain_id)?;
    let old_txs = Self::keys_with_prefix(&self.tx_index, chain_id)?;
    let mut new_blocks = Vec::with_capacity(blocks.len());
    for block in blocks {
      new_blocks.push((
        key(chain_id, block.hash.as_bytes()),
        encode(block)?,
        key(chain_id, block.payload.id.as_bytes()),
        block.hash.as_bytes(),
      ));
    }
    record.tip = tip.hash.clone();
    record.height = blocks.len() as u64;
    let record_bytes = encode(&record)?;

    (&self.chains, &self.blocks, &self.tx_index)
      .transaction(|(chains, b, t)| -> TxResult {
        remove_all(b, &old_blocks)?;
        remove_all(t, &old_txs)?;
        for (block_key, block_bytes, tx_key, hash) in &new_blocks {
          b.insert(block_key.as_slice(), block_bytes.as_slice())?;
          t.insert(tx_key.as_slice(), *hash)?;
        }
        chains.insert(&chain_id.as_bytes()[..], record_bytes.as_slice())?;
        Ok(())
      })?;
    self.flush()?;
    info!(chain = %chain_id, height = record.height, "replaced chain blocks");
    Ok(true)
  }
}

fn key(chain_id: ChainId, suffix: &[u8]) -> Vec<u8> {
  let mut key = Vec::with_capacity(16 + suffix.len());
  key.extend_from_slice(chain_id.as_bytes());
  key.extend_from_slice(suffix);
  key
}

fn remove_all(tree: &TransactionalTree, keys: &[IVec]) -> TxResult {
  for k in keys {
    tree.remove(k.clone())?;
  }
  Ok(())
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
  bincode::serialize(value).context("encoding value")
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
  bincode::deserialize(bytes).context("decoding stored value")
}

fn storage<E: Into<anyhow::Error>>(err: E) -> AppendError {
  AppendError::Storage(err.into())
}
