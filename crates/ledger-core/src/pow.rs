//! Difficulty predicate and proof-of-work verification.

use tracing::warn;

use crate::block::Block;
use crate::constants::HASH_HEX_SIZE;

/// 64 hex characters.
pub fn is_valid_hash(hash: &str) -> bool {
    hash.len() == HASH_HEX_SIZE && hash.bytes().all(|b| b.is_ascii_hexdigit())
}

pub fn count_leading_zero_digits(hash: &str) -> u32 {
    hash.bytes().take_while(|b| *b == b'0').count() as u32
}

/// The first `difficulty` hex characters of a well-formed hash are all `'0'`.
pub fn meets_difficulty(hash: &str, difficulty: u32) -> bool {
    is_valid_hash(hash) && count_leading_zero_digits(hash) >= difficulty
}

/// Stored hash must equal the recomputed header hash *and* satisfy the
/// block's own recorded difficulty.
pub fn verify_proof_of_work(block: &Block) -> bool {
    if !block.has_valid_hash() {
        warn!(index = block.index(), "block hash mismatch");
        return false;
    }
    if !meets_difficulty(&block.hash, block.difficulty()) {
        warn!(
            index = block.index(),
            difficulty = block.difficulty(),
            "block does not meet its difficulty"
        );
        return false;
    }
    true
}
