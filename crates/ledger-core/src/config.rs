use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_BLOCK_REWARD, DEFAULT_DIFFICULTY, DEFAULT_MAX_BLOCK_TRANSACTIONS, DEFAULT_MAX_SUPPLY,
};
use crate::error::{LedgerError, Result};

/// Tunables of a [`crate::chain::Blockchain`].
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChainConfig {
    pub mining_difficulty: u32,
    pub block_reward: u64,
    pub max_supply: u64,
    /// Mirror appended blocks to the attached store.
    pub enable_persistence: bool,
    /// Spread the nonce search over the rayon pool.
    pub parallel_mining: bool,
    /// Mempool entries pulled into one block by `mine_pending`.
    pub max_block_transactions: usize,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            mining_difficulty: DEFAULT_DIFFICULTY,
            block_reward: DEFAULT_BLOCK_REWARD,
            max_supply: DEFAULT_MAX_SUPPLY,
            enable_persistence: true,
            parallel_mining: false,
            max_block_transactions: DEFAULT_MAX_BLOCK_TRANSACTIONS,
        }
    }
}

impl ChainConfig {
    pub fn with_difficulty(mut self, difficulty: u32) -> Self {
        self.mining_difficulty = difficulty;
        self
    }

    pub fn without_persistence(mut self) -> Self {
        self.enable_persistence = false;
        self
    }
}

/// Boundary check for difficulties arriving as signed integers (CLI, JSON).
pub fn validate_difficulty(difficulty: i64) -> Result<u32> {
    if difficulty < 0 {
        return Err(LedgerError::validation("difficulty must be non-negative"));
    }
    u32::try_from(difficulty)
        .map_err(|_| LedgerError::validation(format!("difficulty {difficulty} is out of range")))
}
