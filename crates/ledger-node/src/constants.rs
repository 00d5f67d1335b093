pub const DEFAULT_LISTEN: &str = "127.0.0.1:5000";
pub const DEFAULT_DATA_DIR: &str = "./data";
/// Coinbase recipient when a mining request names none.
pub const DEFAULT_MINER_ADDRESS: &str = "DEFAULT_MINER";
pub const DEFAULT_HEALTH_INTERVAL_SECS: u64 = 30;

pub(crate) const CHAIN_PATH: &str = "/chain";
pub(crate) const PEERS_PATH: &str = "/peers";
pub(crate) const HEALTH_PATH: &str = "/health";
pub(crate) const RECEIVE_BLOCK_PATH: &str = "/blocks/receive";
