pub const HASH_SIZE: usize = 32;
pub const HASH_HEX_SIZE: usize = HASH_SIZE * 2;

/// Previous-hash of the genesis block: 64 ASCII zeros.
pub const GENESIS_PREVIOUS_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";
/// Fixed so every instance derives the same genesis block.
pub const GENESIS_TIMESTAMP: u64 = 1_700_000_000;
pub const GENESIS_TX_ID: &str = "genesis";
pub const GENESIS_DATA: &str = "Genesis Block";

pub const COINBASE_SENDER: &str = "COINBASE";
pub const SYSTEM_SENDER: &str = "SYSTEM";
/// Preimage of the Merkle root of an empty batch.
pub const EMPTY_MERKLE_PREIMAGE: &str = "empty";

/// Attempts between two progress callback invocations.
pub const PROGRESS_INTERVAL: u64 = 1000;

/// Upper bound on a transfer's amount and on its fee. Keeps the fee total of
/// a pool far below `u64::MAX`.
pub const MAX_TRANSACTION_VALUE: u64 = 1 << 48;

pub const DEFAULT_DIFFICULTY: u32 = 4;
pub const DEFAULT_BLOCK_REWARD: u64 = 50;
pub const DEFAULT_MAX_SUPPLY: u64 = 21_000_000;
pub const DEFAULT_MAX_BLOCK_TRANSACTIONS: usize = 10;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 5;
