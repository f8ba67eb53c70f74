//! Longest-valid-chain replacement.

use crate::chain::Repository;
use crate::constants::MAX_DIFFICULTY;
use crate::validate::{verify_chain, ValidationError};
use crate::{Block, Blockchain};
use anyhow::Result;
use tracing::{debug, info};

#[derive(Debug, PartialEq, Eq)]
pub enum Replacement {
    Replaced { blocks: usize },
    Rejected(ValidationError),
}

/// Apply a chain offered by a peer. Storage failures are errors; every
/// rule violation is a side-effect-free [`Replacement::Rejected`], except
/// that an unknown chain is first created from the offered metadata.
pub fn apply_offered_chain(
    repo: &dyn Repository,
    offered: &Blockchain,
    blocks: &[Block],
) -> Result<Replacement> {
    if offered.difficulty > MAX_DIFFICULTY {
        debug!(chain = %offered.id, difficulty = offered.difficulty, "rejected unminable chain");
        return Ok(Replacement::Rejected(ValidationError::DifficultyTooHigh {
            difficulty: offered.difficulty,
            max: MAX_DIFFICULTY,
        }));
    }
    let local = match repo.get_blockchain(offered.id)? {
        Some(local) => local,
        None => {
            info!(chain = %offered.id, name = %offered.name, "creating chain offered by peer");
            repo.store(offered)?;
            offered.clone()
        }
    };

    if let Err(reason) = check_offer(&local, offered, blocks) {
        debug!(chain = %offered.id, %reason, "rejected offered chain");
        return Ok(Replacement::Rejected(reason));
    }

    let local_count = repo.count_blocks(offered.id)?;
    if local_count >= blocks.len() {
        return Ok(Replacement::Rejected(ValidationError::NotLonger {
            local: local_count,
            offered: blocks.len(),
        }));
    }

    // the store re-checks length under its own lock; a concurrent longer
    // replacement may have landed since `count_blocks`
    if !repo.replace_chain_blocks(offered.id, blocks)? {
        let local = repo.count_blocks(offered.id)?;
        return Ok(Replacement::Rejected(ValidationError::NotLonger {
            local,
            offered: blocks.len(),
        }));
    }
    info!(chain = %offered.id, blocks = blocks.len(), "replaced local chain");
    Ok(Replacement::Replaced {
        blocks: blocks.len(),
    })
}

fn check_offer(
    local: &Blockchain,
    offered: &Blockchain,
    blocks: &[Block],
) -> Result<(), ValidationError> {
    if local.difficulty != offered.difficulty {
        return Err(ValidationError::DifficultyMismatch {
            local: local.difficulty,
            offered: offered.difficulty,
        });
    }
    if let Some(foreign) = blocks.iter().find(|b| b.chain_id != offered.id) {
        return Err(ValidationError::ForeignBlock {
            hash: foreign.hash.clone(),
        });
    }
    verify_chain(blocks, local.difficulty)
}
