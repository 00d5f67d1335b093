//! Error types for the ledger core.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, LedgerError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Malformed input, rejected before any mutation.
    #[error("validation error: {0}")]
    Validation(String),

    /// A freshly mined block no longer extends the current tip.
    #[error("stale block {index}: expected parent {expected}, tip is {found}")]
    StaleTip {
        index: u64,
        expected: String,
        found: String,
    },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("mining job {0} already exists")]
    JobExists(String),

    #[error("mining job {0} not found")]
    JobNotFound(String),

    #[error("mining worker failed: {0}")]
    Worker(String),
}

impl LedgerError {
    pub fn validation(msg: impl Into<String>) -> Self {
        LedgerError::Validation(msg.into())
    }
}
