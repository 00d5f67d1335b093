//! Binary Merkle commitment over an ordered transaction batch.
//!
//! Hashes are lowercase hex; an inner node is `sha256(left_hex ‖ right_hex)`.
//! A level with an odd count pairs its last node with itself. That
//! construction admits duplicate-leaf forgeries (a batch `[a, b, c]` and
//! `[a, b, c, c]` share a root) and is kept for compatibility with existing
//! chains.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants::EMPTY_MERKLE_PREIMAGE;
use crate::sha256_hex;
use crate::transaction::TxRecord;

/// Side of the sibling relative to the node on the path.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Position {
    Left,
    Right,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProofStep {
    pub hash: String,
    pub position: Position,
}

#[derive(Clone, Debug, Serialize)]
pub struct MerkleTree {
    levels: Vec<Vec<String>>,
    root: String,
}

pub fn leaf_hash(tx: &TxRecord) -> String {
    sha256_hex(&tx.leaf_preimage())
}

pub fn empty_root() -> String {
    sha256_hex(EMPTY_MERKLE_PREIMAGE)
}

pub fn merkle_root(txs: &[TxRecord]) -> String {
    MerkleTree::new(txs).root
}

fn hash_pair(left: &str, right: &str) -> String {
    let mut combined = String::with_capacity(left.len() + right.len());
    combined.push_str(left);
    combined.push_str(right);
    sha256_hex(&combined)
}

impl MerkleTree {
    pub fn new(transactions: &[TxRecord]) -> Self {
        Self::from_leaves(transactions.iter().map(leaf_hash).collect())
    }

    pub fn from_leaves(leaves: Vec<String>) -> Self {
        if leaves.is_empty() {
            return Self {
                levels: Vec::new(),
                root: empty_root(),
            };
        }

        let mut levels = vec![leaves];
        while let Some(level) = levels.last().filter(|level| level.len() > 1) {
            let next: Vec<String> = level
                .chunks(2)
                .map(|pair| match pair {
                    [left, right] => hash_pair(left, right),
                    [lone] => hash_pair(lone, lone),
                    _ => unreachable!("chunks(2) yields one or two items"),
                })
                .collect();
            levels.push(next);
        }

        let root = levels
            .last()
            .and_then(|top| top.first())
            .cloned()
            .unwrap_or_else(empty_root);
        debug!(root = %root, leaves = levels[0].len(), "merkle tree built");
        Self { levels, root }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn leaves(&self) -> &[String] {
        self.levels.first().map(Vec::as_slice).unwrap_or(&[])
    }

    /// All levels, leaves first and root last.
    pub fn levels(&self) -> &[Vec<String>] {
        &self.levels
    }

    pub fn len(&self) -> usize {
        self.leaves().len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    /// Raw leaf hash, for external proof requests.
    pub fn get_transaction_hash(&self, index: usize) -> Option<&str> {
        self.leaves().get(index).map(String::as_str)
    }

    /// Sibling path from leaf `index` up to (excluding) the root.
    /// `None` when the index is out of range.
    pub fn get_proof(&self, index: usize) -> Option<Vec<ProofStep>> {
        if index >= self.len() {
            return None;
        }

        let mut proof = Vec::with_capacity(self.levels.len().saturating_sub(1));
        let mut current = index;
        for level in &self.levels[..self.levels.len() - 1] {
            let step = if current % 2 == 0 {
                // a lone last node is its own right sibling
                let sibling = level.get(current + 1).unwrap_or(&level[current]);
                ProofStep {
                    hash: sibling.clone(),
                    position: Position::Right,
                }
            } else {
                ProofStep {
                    hash: level[current - 1].clone(),
                    position: Position::Left,
                }
            };
            proof.push(step);
            current /= 2;
        }
        Some(proof)
    }

    /// Recombines `leaf_hash` along `proof`; an empty proof holds iff the
    /// leaf is the root.
    pub fn verify_proof(leaf_hash: &str, proof: &[ProofStep], root: &str) -> bool {
        let computed = proof
            .iter()
            .fold(leaf_hash.to_string(), |current, step| match step.position {
                Position::Left => hash_pair(&step.hash, &current),
                Position::Right => hash_pair(&current, &step.hash),
            });
        computed == root
    }
}

/// Checks that `tx` is committed under `merkle_root` via `proof`.
pub fn verify_transaction_in_block(tx: &TxRecord, merkle_root: &str, proof: &[ProofStep]) -> bool {
    MerkleTree::verify_proof(&leaf_hash(tx), proof, merkle_root)
}
