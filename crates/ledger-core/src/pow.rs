//! Proof-of-work: search for the smallest nonce whose hex digest starts with
//! `difficulty` `'0'` characters.

use crate::Block;
use rayon::prelude::*;
use std::ops::RangeInclusive;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PowError {
    #[error("mining cancelled")]
    Cancelled,
    #[error("nonce space exhausted without a solution")]
    Exhausted,
}

/// `true` when the first `difficulty` characters of `hash` are all `'0'`.
pub fn has_zero_prefix(hash: &str, difficulty: u32) -> bool {
    let difficulty = difficulty as usize;
    hash.len() >= difficulty && hash.bytes().take(difficulty).all(|b| b == b'0')
}

impl Block {
    /// Mine in place over the whole nonce space, checking `cancel` before
    /// every attempt. On error the nonce and hash are left indeterminate.
    pub fn mine(&mut self, difficulty: u32, cancel: &CancellationToken) -> Result<(), PowError> {
        search(self, difficulty, cancel, 0..=u64::MAX)
    }
}

/// Sequential search over `nonces`. Exhaustion means every nonce in the range
/// was tried, i.e. the next increment would leave it.
pub fn search(
    block: &mut Block,
    difficulty: u32,
    cancel: &CancellationToken,
    nonces: RangeInclusive<u64>,
) -> Result<(), PowError> {
    let preimage = block.preimage();
    let (mut nonce, last) = nonces.into_inner();
    loop {
        if cancel.is_cancelled() {
            return Err(PowError::Cancelled);
        }
        let hash = preimage.digest(nonce);
        if has_zero_prefix(&hash, difficulty) {
            block.nonce = nonce;
            block.hash = hash;
            return Ok(());
        }
        if nonce >= last {
            block.nonce = nonce;
            return Err(PowError::Exhausted);
        }
        nonce += 1;
    }
}

/// Parallel variant of [`Block::mine`]. `find_first` keeps the result equal to
/// the sequential search, so the winning nonce stays reproducible.
pub fn mine_parallel(
    block: &mut Block,
    difficulty: u32,
    cancel: &CancellationToken,
) -> Result<(), PowError> {
    search_parallel(block, difficulty, cancel, 0..=u64::MAX)
}

pub fn search_parallel(
    block: &mut Block,
    difficulty: u32,
    cancel: &CancellationToken,
    nonces: RangeInclusive<u64>,
) -> Result<(), PowError> {
    let preimage = block.preimage();
    let found = nonces.into_par_iter().find_first(|nonce| {
        cancel.is_cancelled() || has_zero_prefix(&preimage.digest(*nonce), difficulty)
    });
    if cancel.is_cancelled() {
        return Err(PowError::Cancelled);
    }
    let nonce = found.ok_or(PowError::Exhausted)?;
    block.nonce = nonce;
    block.hash = preimage.digest(nonce);
    debug!(nonce, hash = %block.hash, "found proof of work");
    Ok(())
}
