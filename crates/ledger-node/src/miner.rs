//! Mining orchestrator. At most one job runs at a time; the proof-of-work
//! search itself runs on the blocking pool.

use crate::constants::MAX_STALE_TIP_RETRIES;
use chrono::{DateTime, Utc};
use ledger_core::chain::{AppendError, Repository};
use ledger_core::pow::{mine_parallel, PowError};
use ledger_core::{Block, Blockchain, ChainId, Transaction};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum MiningError {
    #[error("Already mining, try again later...")]
    AlreadyMining,
    #[error("blockchain {0} not found")]
    ChainNotFound(ChainId),
    #[error("blockchain {0} has no blocks")]
    EmptyChain(ChainId),
    #[error("Impossible to mine the block")]
    NonceExhausted,
    #[error("mining cancelled")]
    Cancelled,
    #[error("chain tip kept moving after {0} attempts")]
    StaleTip(usize),
    #[error("append rejected: {0}")]
    Append(AppendError),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
    #[error("mining worker failed: {0}")]
    Join(#[from] JoinError),
}

impl From<PowError> for MiningError {
    fn from(err: PowError) -> Self {
        match err {
            PowError::Cancelled => MiningError::Cancelled,
            PowError::Exhausted => MiningError::NonceExhausted,
        }
    }
}

impl From<AppendError> for MiningError {
    fn from(err: AppendError) -> Self {
        match err {
            AppendError::Storage(e) => MiningError::Storage(e),
            other => MiningError::Append(other),
        }
    }
}

/// Blocks produced by a successful job.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct MiningReport {
    pub chain_id: ChainId,
    pub transaction_id: Uuid,
    pub block_hash: String,
    /// `None` when the reward block could not be appended.
    pub reward_hash: Option<String>,
}

/// Summary of the last finished job, kept for `status`.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct MiningOutcome {
    pub chain_id: ChainId,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub message: String,
}

#[derive(Debug)]
pub enum MiningStart {
    NothingToMine,
    Started(MiningJob),
}

#[derive(Debug)]
pub struct MiningJob {
    pub chain_id: ChainId,
    pub transaction_id: Uuid,
    handle: JoinHandle<Result<MiningReport, MiningError>>,
}

impl MiningJob {
    pub async fn wait(self) -> Result<MiningReport, MiningError> {
        self.handle.await?
    }
}

struct MinerInner {
    repo: Arc<dyn Repository>,
    busy: AtomicBool,
    shutdown: CancellationToken,
    current: Mutex<Option<CancellationToken>>,
    last: Mutex<Option<MiningOutcome>>,
}

impl MinerInner {
    fn record(&self, chain_id: ChainId, result: &Result<MiningReport, MiningError>) {
        let (success, message) = match result {
            Ok(report) => (true, format!("Mined block {}", report.block_hash)),
            Err(e) => (false, e.to_string()),
        };
        *self.last.lock() = Some(MiningOutcome {
            chain_id,
            finished_at: Utc::now(),
            success,
            message,
        });
    }
}

/// Clears the busy flag when the job ends, however it ends.
struct BusyGuard(Arc<MinerInner>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        *self.0.current.lock() = None;
        self.0.busy.store(false, Ordering::Release);
    }
}

#[derive(Clone)]
pub struct Miner {
    inner: Arc<MinerInner>,
}

impl Miner {
    /// Jobs are cancelled when `shutdown` is.
    pub fn new(repo: Arc<dyn Repository>, shutdown: CancellationToken) -> Self {
        Self {
            inner: Arc::new(MinerInner {
                repo,
                busy: AtomicBool::new(false),
                shutdown,
                current: Mutex::new(None),
                last: Mutex::new(None),
            }),
        }
    }

    pub fn is_mining(&self) -> bool {
        self.inner.busy.load(Ordering::Acquire)
    }

    pub fn last_outcome(&self) -> Option<MiningOutcome> {
        self.inner.last.lock().clone()
    }

    /// Cancel the running job, if any. Returns whether one was running.
    pub fn cancel(&self) -> bool {
        match self.inner.current.lock().as_ref() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Start mining the oldest pending transaction of `chain_id`, crediting
    /// the reward to `reward_address`. Must be called inside a tokio runtime.
    pub fn start(
        &self,
        chain_id: ChainId,
        reward_address: impl Into<String>,
    ) -> Result<MiningStart, MiningError> {
        if self
            .inner
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(MiningError::AlreadyMining);
        }
        let guard = BusyGuard(Arc::clone(&self.inner));

        let repo = Arc::clone(&self.inner.repo);
        let blockchain = repo
            .get_blockchain(chain_id)?
            .ok_or(MiningError::ChainNotFound(chain_id))?;
        let Some(transaction) = repo.fetch_oldest_pending(chain_id)? else {
            debug!(chain = %chain_id, "no pending transactions");
            return Ok(MiningStart::NothingToMine);
        };

        let cancel = self.inner.shutdown.child_token();
        *self.inner.current.lock() = Some(cancel.clone());
        let transaction_id = transaction.id;
        let job = Job {
            repo,
            blockchain,
            reward_address: reward_address.into(),
            cancel,
        };
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            let _guard = guard;
            let result = job.run(transaction).await;
            inner.record(chain_id, &result);
            result
        });
        info!(chain = %chain_id, tx = %transaction_id, "mining started");
        Ok(MiningStart::Started(MiningJob {
            chain_id,
            transaction_id,
            handle,
        }))
    }
}

struct Job {
    repo: Arc<dyn Repository>,
    blockchain: Blockchain,
    reward_address: String,
    cancel: CancellationToken,
}

impl Job {
    async fn run(self, transaction: Transaction) -> Result<MiningReport, MiningError> {
        let chain_id = self.blockchain.id;
        let transaction_id = transaction.id;
        let block = match self.mine_and_append(transaction, false).await {
            Ok(block) => block,
            Err(e) => {
                self.report_failure(transaction_id, &e);
                return Err(e);
            }
        };
        info!(chain = %chain_id, hash = %block.hash, nonce = block.nonce, "block mined");

        let reward = Transaction::new(self.reward_address.clone(), self.blockchain.reward_amount);
        let reward_hash = match self.mine_and_append(reward, true).await {
            Ok(reward) => {
                info!(
                    chain = %chain_id,
                    hash = %reward.hash,
                    to = %self.reward_address,
                    "reward block mined"
                );
                Some(reward.hash)
            }
            Err(e) => {
                warn!(chain = %chain_id, error = %e, "reward block not appended");
                None
            }
        };
        Ok(MiningReport {
            chain_id,
            transaction_id,
            block_hash: block.hash,
            reward_hash,
        })
    }

    fn report_failure(&self, transaction_id: Uuid, err: &MiningError) {
        let chain_id = self.blockchain.id;
        match err {
            MiningError::Cancelled => info!(chain = %chain_id, "mining cancelled"),
            MiningError::Append(AppendError::AlreadyIn) => {
                warn!(
                    chain = %chain_id,
                    tx = %transaction_id,
                    "transaction already in chain; discarding it"
                );
                if let Err(e) = self.repo.discard_pending(chain_id, transaction_id) {
                    error!(chain = %chain_id, error = %e, "could not discard pending transaction");
                }
            }
            other => error!(chain = %chain_id, error = %other, "mining failed"),
        }
    }

    /// Mine `payload` on top of the current tip and append it, re-mining on
    /// a fresh tip when another block lands first.
    async fn mine_and_append(
        &self,
        payload: Transaction,
        is_reward: bool,
    ) -> Result<Block, MiningError> {
        let chain_id = self.blockchain.id;
        let difficulty = self.blockchain.difficulty;
        for attempt in 1..=MAX_STALE_TIP_RETRIES {
            let tip = self
                .repo
                .tail(chain_id, 1)?
                .into_iter()
                .next()
                .ok_or(MiningError::EmptyChain(chain_id))?;
            let mut candidate = Block::new(chain_id, tip.hash, payload.clone());
            let cancel = self.cancel.clone();
            let mined = tokio::task::spawn_blocking(move || {
                mine_parallel(&mut candidate, difficulty, &cancel).map(|()| candidate)
            })
            .await??;

            match self.repo.append_block(&mined, is_reward) {
                Ok(()) => return Ok(mined),
                Err(AppendError::PrevHashMismatch) => {
                    debug!(chain = %chain_id, attempt, "tip moved while mining; retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(MiningError::StaleTip(MAX_STALE_TIP_RETRIES))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledger_core::Amount;
    use ledger_storage::MemoryStore;

    fn miner_with_chain(difficulty: u32) -> (Miner, Arc<MemoryStore>, Blockchain) {
        let store = Arc::new(MemoryStore::new());
        let chain = Blockchain::new("taxes", Amount::whole(10).unwrap(), difficulty);
        store.store(&chain).unwrap();
        let miner = Miner::new(store.clone(), CancellationToken::new());
        (miner, store, chain)
    }

    #[tokio::test]
    async fn empty_pool_is_a_no_op() {
        let (miner, _store, chain) = miner_with_chain(1);
        assert!(matches!(
            miner.start(chain.id, "miner").unwrap(),
            MiningStart::NothingToMine
        ));
        assert!(!miner.is_mining());
    }

    #[tokio::test]
    async fn unknown_chain_releases_the_busy_flag() {
        let (miner, _store, _chain) = miner_with_chain(1);
        let missing = Uuid::new_v4();
        assert!(matches!(
            miner.start(missing, "miner"),
            Err(MiningError::ChainNotFound(id)) if id == missing
        ));
        assert!(!miner.is_mining());
    }

    #[tokio::test]
    async fn cancelled_job_leaves_the_transaction_pending() {
        // difficulty high enough that the search cannot finish first
        let (miner, store, chain) = miner_with_chain(20);
        let tx = Transaction::new("alice", Amount::whole(100).unwrap());
        store.enqueue_transaction(chain.id, &tx).unwrap();

        let MiningStart::Started(job) = miner.start(chain.id, "miner").unwrap() else {
            panic!("expected a job");
        };
        assert!(miner.cancel());
        assert!(matches!(job.wait().await, Err(MiningError::Cancelled)));
        assert!(!miner.is_mining());
        assert_eq!(store.fetch_oldest_pending(chain.id).unwrap(), Some(tx));
        let outcome = miner.last_outcome().unwrap();
        assert!(!outcome.success);
    }
}
