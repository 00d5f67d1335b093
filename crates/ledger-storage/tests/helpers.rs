use std::fs;

use ledger_core::{Block, ChainStore, Transaction, TxRecord};
use ledger_storage::SledStore;
use rand::Rng;
use tempfile::{tempdir, TempDir};

pub fn create_temp_store() -> (TempDir, SledStore) {
    // Create a temporary directory for the sled database
    let temp_dir = tempdir().expect("Failed to create temp dir");
    let db_path = temp_dir.path().to_path_buf();
    (
        temp_dir,
        SledStore::open(&db_path).expect("Failed to open SledStore"),
    )
}

pub fn teardown_store(temp_dir: TempDir, store: SledStore) {
    let db_path = temp_dir.path().to_path_buf();
    store.close().expect("Failed to flush the store");
    drop(store);
    temp_dir.close().expect("Failed to delete temp dir");
    let _ = fs::remove_dir_all(&db_path);
    // Verify the directory is removed
    assert!(!db_path.exists(), "Database directory should be removed");
}

/// Unmined linked blocks on top of genesis, each with a few random transfers.
pub fn linked_blocks(count: usize) -> Vec<Block> {
    let mut rng = rand::thread_rng();
    let mut blocks = vec![Block::genesis()];
    for i in 1..count {
        let txs: Vec<TxRecord> = (0..rng.gen_range(1..5))
            .map(|n| Transaction::new(format!("from_{i}_{n}"), "to", rng.gen_range(1..1000), 0).into())
            .collect();
        let prev = blocks[i - 1].hash.clone();
        blocks.push(Block::new(i as u64, prev, txs, 0));
    }
    blocks
}
