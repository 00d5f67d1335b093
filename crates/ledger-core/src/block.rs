use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::constants::{GENESIS_PREVIOUS_HASH, GENESIS_TIMESTAMP};
use crate::merkle::merkle_root;
use crate::transaction::{DataRecord, TxRecord};
use crate::{now_secs, sha256_hex_bytes};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockHeader {
    pub index: u64,
    pub timestamp: u64,
    pub previous_hash: String,
    pub merkle_root: String,
    pub nonce: u64,
    pub difficulty: u32,
}

impl BlockHeader {
    pub fn new(index: u64, previous_hash: impl Into<String>, merkle_root: impl Into<String>, difficulty: u32) -> Self {
        Self {
            index,
            timestamp: now_secs(),
            previous_hash: previous_hash.into(),
            merkle_root: merkle_root.into(),
            nonce: 0,
            difficulty,
        }
    }

    /// Fixed-order concatenation of the six header fields.
    pub fn hash_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(
            8 + 8 + self.previous_hash.len() + self.merkle_root.len() + 8 + 4,
        );
        bytes.extend_from_slice(&self.index.to_le_bytes());
        bytes.extend_from_slice(&self.timestamp.to_le_bytes());
        bytes.extend_from_slice(self.previous_hash.as_bytes());
        bytes.extend_from_slice(self.merkle_root.as_bytes());
        bytes.extend_from_slice(&self.nonce.to_le_bytes());
        bytes.extend_from_slice(&self.difficulty.to_le_bytes());
        bytes
    }

    pub fn hash(&self) -> String {
        sha256_hex_bytes(&self.hash_bytes())
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockBody {
    pub transactions: Vec<TxRecord>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// A header, its body and the cached header hash.
///
/// Serialized as the flat block record shared with storage and peers:
/// `{index, timestamp, previous_hash, merkle_root, nonce, difficulty, hash,
/// transactions, metadata}`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(from = "BlockRecord", into = "BlockRecord")]
pub struct Block {
    pub header: BlockHeader,
    pub body: BlockBody,
    pub hash: String,
}

impl Block {
    /// Unmined block (nonce 0) committing to `transactions`.
    pub fn new(index: u64, previous_hash: impl Into<String>, transactions: Vec<TxRecord>, difficulty: u32) -> Self {
        let header = BlockHeader::new(index, previous_hash, merkle_root(&transactions), difficulty);
        let hash = header.hash();
        Self {
            header,
            body: BlockBody {
                transactions,
                metadata: BTreeMap::new(),
            },
            hash,
        }
    }

    /// Index 0, zero parent, one synthetic record, nonce and difficulty 0.
    pub fn genesis() -> Self {
        let mut block = Block::new(0, GENESIS_PREVIOUS_HASH, vec![DataRecord::genesis().into()], 0);
        block.header.timestamp = GENESIS_TIMESTAMP;
        block.hash = block.calculate_hash();
        block
    }

    pub fn index(&self) -> u64 {
        self.header.index
    }

    pub fn previous_hash(&self) -> &str {
        &self.header.previous_hash
    }

    pub fn difficulty(&self) -> u32 {
        self.header.difficulty
    }

    pub fn transactions(&self) -> &[TxRecord] {
        &self.body.transactions
    }

    pub fn calculate_hash(&self) -> String {
        self.header.hash()
    }

    pub fn has_valid_hash(&self) -> bool {
        self.hash == self.calculate_hash()
    }

    pub fn has_valid_merkle_root(&self) -> bool {
        merkle_root(&self.body.transactions) == self.header.merkle_root
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct BlockRecord {
    index: u64,
    timestamp: u64,
    previous_hash: String,
    merkle_root: String,
    nonce: u64,
    difficulty: u32,
    hash: String,
    transactions: Vec<TxRecord>,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
}

impl From<BlockRecord> for Block {
    fn from(r: BlockRecord) -> Self {
        Block {
            header: BlockHeader {
                index: r.index,
                timestamp: r.timestamp,
                previous_hash: r.previous_hash,
                merkle_root: r.merkle_root,
                nonce: r.nonce,
                difficulty: r.difficulty,
            },
            body: BlockBody {
                transactions: r.transactions,
                metadata: r.metadata,
            },
            hash: r.hash,
        }
    }
}

impl From<Block> for BlockRecord {
    fn from(b: Block) -> Self {
        BlockRecord {
            index: b.header.index,
            timestamp: b.header.timestamp,
            previous_hash: b.header.previous_hash,
            merkle_root: b.header.merkle_root,
            nonce: b.header.nonce,
            difficulty: b.header.difficulty,
            hash: b.hash,
            transactions: b.body.transactions,
            metadata: b.body.metadata,
        }
    }
}
