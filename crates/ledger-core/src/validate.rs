//! Hash-chain integrity checks.
//!
//! Block lists are always ordered newest-first: index 0 is the tip and the
//! last element is the genesis block, which is exempt from every check.

use crate::chain::AppendError;
use crate::{Block, Blockchain};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("no blocks offered")]
    Empty,
    #[error("block {hash} does not match its digest")]
    DigestMismatch { hash: String },
    #[error("block {hash} does not meet difficulty {difficulty}")]
    DifficultyNotMet { hash: String, difficulty: u32 },
    #[error("block {hash} points at {previous} but the next block is {expected}")]
    BrokenLink {
        hash: String,
        previous: String,
        expected: String,
    },
    #[error("difficulty mismatch: local {local}, offered {offered}")]
    DifficultyMismatch { local: u32, offered: u32 },
    #[error("offered chain of {offered} blocks is not longer than local {local}")]
    NotLonger { local: usize, offered: usize },
    #[error("chain does not end in a genesis block")]
    MissingGenesis,
    #[error("block {hash} belongs to another chain")]
    ForeignBlock { hash: String },
    #[error("difficulty {difficulty} exceeds the maximum of {max}")]
    DifficultyTooHigh { difficulty: u32, max: u32 },
}

/// Detailed form of [`validate_blocks`].
pub fn check_blocks(blocks: &[Block], difficulty: u32) -> Result<(), ValidationError> {
    if blocks.is_empty() {
        return Err(ValidationError::Empty);
    }
    for pair in blocks.windows(2) {
        let (current, next) = (&pair[0], &pair[1]);
        if current.is_tampered() {
            return Err(ValidationError::DigestMismatch {
                hash: current.hash.clone(),
            });
        }
        if !current.meets_difficulty(difficulty) {
            return Err(ValidationError::DifficultyNotMet {
                hash: current.hash.clone(),
                difficulty,
            });
        }
        if current.previous_hash != next.hash {
            return Err(ValidationError::BrokenLink {
                hash: current.hash.clone(),
                previous: current.previous_hash.clone(),
                expected: next.hash.clone(),
            });
        }
    }
    Ok(())
}

pub fn validate_blocks(blocks: &[Block], difficulty: u32) -> bool {
    check_blocks(blocks, difficulty).is_ok()
}

/// Full-chain check used by `verify`: the list must also reach genesis.
pub fn verify_chain(blocks: &[Block], difficulty: u32) -> Result<(), ValidationError> {
    check_blocks(blocks, difficulty)?;
    match blocks.last() {
        Some(last) if last.is_genesis() => Ok(()),
        _ => Err(ValidationError::MissingGenesis),
    }
}

/// Consistency guard for appending `block` on top of the tip `tip_hash`.
/// The duplicate-transaction check needs the store and lives there.
pub fn check_append(block: &Block, chain: &Blockchain, tip_hash: &str) -> Result<(), AppendError> {
    if block.chain_id != chain.id {
        return Err(AppendError::BlockchainUndefined);
    }
    if block.is_tampered() || !block.meets_difficulty(chain.difficulty) {
        return Err(AppendError::DigestMismatch);
    }
    if block.previous_hash != tip_hash {
        return Err(AppendError::PrevHashMismatch);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::genesis_block;
    use crate::{Amount, Transaction};
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    const DIFFICULTY: u32 = 1;

    fn mined(chain_id: Uuid, previous: &str, payer: &str) -> Block {
        let payload = Transaction::new(payer, Amount::whole(1).unwrap());
        let mut block = Block::new(chain_id, previous, payload);
        block.mine(DIFFICULTY, &CancellationToken::new()).unwrap();
        block
    }

    /// `[B2, B1, B0]`, newest first.
    fn three_block_chain() -> Vec<Block> {
        let chain_id = Uuid::new_v4();
        let b0 = genesis_block(chain_id);
        let b1 = mined(chain_id, &b0.hash, "alice");
        let b2 = mined(chain_id, &b1.hash, "bob");
        vec![b2, b1, b0]
    }

    #[test]
    fn empty_is_invalid() {
        assert!(!validate_blocks(&[], 0));
        assert_eq!(check_blocks(&[], 0), Err(ValidationError::Empty));
    }

    #[test]
    fn single_block_is_valid() {
        let mut block = genesis_block(Uuid::new_v4());
        block.hash = "not even hex".to_string();
        assert!(validate_blocks(&[block], 5));
    }

    #[test]
    fn valid_chain_passes() {
        let blocks = three_block_chain();
        assert!(validate_blocks(&blocks, DIFFICULTY));
        assert!(verify_chain(&blocks, DIFFICULTY).is_ok());
    }

    #[test]
    fn tampering_any_payload_field_is_detected() {
        let tamperings: Vec<fn(&mut Block)> = vec![
            |b: &mut Block| b.payload.payer_id.push('x'),
            |b: &mut Block| b.payload.amount = Amount::whole(1_000).unwrap(),
            |b: &mut Block| b.payload.id = Uuid::new_v4(),
        ];
        for tamper in tamperings {
            let mut blocks = three_block_chain();
            tamper(&mut blocks[1]);
            assert!(matches!(
                check_blocks(&blocks, DIFFICULTY),
                Err(ValidationError::DigestMismatch { .. })
            ));
        }
    }

    #[test]
    fn broken_link_is_detected() {
        let mut blocks = three_block_chain();
        let chain_id = blocks[0].chain_id;
        blocks[0] = mined(chain_id, "deadbeef", "mallory");
        assert!(matches!(
            check_blocks(&blocks, DIFFICULTY),
            Err(ValidationError::BrokenLink { .. })
        ));
    }

    #[test]
    fn difficulty_prefix_is_enforced() {
        let blocks = three_block_chain();
        let hardest = blocks[..2]
            .iter()
            .map(|b| b.hash.bytes().take_while(|c| *c == b'0').count() as u32)
            .min()
            .unwrap();
        assert!(!validate_blocks(&blocks, hardest + 1));
    }

    #[test]
    fn genesis_is_exempt_but_required_for_verify() {
        let mut blocks = three_block_chain();
        blocks[2].payload.payer_id = "rewritten".to_string();
        assert!(validate_blocks(&blocks, DIFFICULTY));

        blocks.pop();
        assert_eq!(
            verify_chain(&blocks, DIFFICULTY),
            Err(ValidationError::MissingGenesis)
        );
    }

    #[test]
    fn append_guard_outcomes() {
        let blocks = three_block_chain();
        let chain = Blockchain {
            id: blocks[0].chain_id,
            name: "test".to_string(),
            reward_amount: Amount::ZERO,
            difficulty: DIFFICULTY,
        };
        let tip = &blocks[0].hash;
        let next = mined(chain.id, tip, "carol");
        assert!(check_append(&next, &chain, tip).is_ok());

        let stale = mined(chain.id, &blocks[1].hash, "carol");
        assert!(matches!(
            check_append(&stale, &chain, tip),
            Err(AppendError::PrevHashMismatch)
        ));

        let mut corrupt = next.clone();
        corrupt.nonce += 1;
        assert!(matches!(
            check_append(&corrupt, &chain, tip),
            Err(AppendError::DigestMismatch)
        ));

        let foreign = mined(Uuid::new_v4(), tip, "carol");
        assert!(matches!(
            check_append(&foreign, &chain, tip),
            Err(AppendError::BlockchainUndefined)
        ));
    }
}
