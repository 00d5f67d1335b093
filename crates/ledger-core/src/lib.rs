//! Core of the proof-of-work ledger: blocks, Merkle commitments, the
//! mempool, the miner and its job registry, the chain orchestrator and the
//! peer protocol.

use std::time::{SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};

pub mod block;
pub mod chain;
pub mod config;
pub mod constants;
pub mod error;
pub mod mempool;
pub mod merkle;
pub mod mine;
pub mod network;
pub mod pow;
pub mod signature;
pub mod transaction;

pub use block::{Block, BlockBody, BlockHeader};
pub use chain::{validate_chain, Blockchain, ChainStats, ChainStore, MerkleProofInfo, ValidationReport};
pub use config::{validate_difficulty, ChainConfig};
pub use error::{LedgerError, Result};
pub use mempool::{MempoolSummary, TransactionPool};
pub use merkle::{MerkleTree, Position, ProofStep};
pub use mine::{BlockTemplate, JobStatus, MineOutcome, Miner, MiningHandle, MiningJob};
pub use network::{ChainResponse, Peer, PeerAddress, PeerNetwork, PeerStatus, PeerTransport, PeersResponse};
pub use signature::{KeyExport, KeyManager, KeyPair};
pub use transaction::{total_fees, CoinbaseTransaction, DataRecord, Transaction, TxRecord};

/// Seconds since the Unix epoch; 0 if the clock is before it.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Lowercase hex SHA-256 of the UTF-8 bytes of `input`.
pub fn sha256_hex(input: &str) -> String {
    sha256_hex_bytes(input.as_bytes())
}

pub fn sha256_hex_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
