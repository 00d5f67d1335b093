//! Pending transactions, keyed by id, in insertion order.
//!
//! No fee-based prioritisation: `get_transactions` hands out the oldest
//! entries first.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use crate::transaction::Transaction;

#[derive(Debug, Default)]
struct PoolInner {
    next_seq: u64,
    seq_by_id: HashMap<String, u64>,
    by_seq: BTreeMap<u64, Transaction>,
}

#[derive(Debug, Default)]
pub struct TransactionPool {
    inner: Mutex<PoolInner>,
}

#[derive(Clone, Debug, Serialize)]
pub struct MempoolSummary {
    pub size: usize,
    pub total_fees: u64,
    pub transactions: Vec<Transaction>,
}

impl TransactionPool {
    pub fn new() -> Self {
        info!("transaction pool initialized");
        Self::default()
    }

    /// False when a transaction with the same id is already pooled.
    pub fn add_transaction(&self, transaction: Transaction) -> bool {
        let mut inner = self.inner.lock();
        if inner.seq_by_id.contains_key(&transaction.id) {
            warn!(id = %transaction.id, "transaction already in pool");
            return false;
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        info!(id = %transaction.id, "transaction added to pool");
        inner.seq_by_id.insert(transaction.id.clone(), seq);
        inner.by_seq.insert(seq, transaction);
        true
    }

    /// No-op when absent; returns whether something was removed.
    pub fn remove_transaction(&self, id: &str) -> bool {
        let mut inner = self.inner.lock();
        match inner.seq_by_id.remove(id) {
            Some(seq) => {
                inner.by_seq.remove(&seq);
                info!(id, "transaction removed from pool");
                true
            }
            None => false,
        }
    }

    pub fn remove_many<'a>(&self, ids: impl IntoIterator<Item = &'a str>) -> usize {
        ids.into_iter()
            .filter(|id| self.remove_transaction(id))
            .count()
    }

    /// Up to `limit` entries (all when `None`), oldest first.
    pub fn get_transactions(&self, limit: Option<usize>) -> Vec<Transaction> {
        let inner = self.inner.lock();
        inner
            .by_seq
            .values()
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<Transaction> {
        let inner = self.inner.lock();
        inner
            .seq_by_id
            .get(id)
            .and_then(|seq| inner.by_seq.get(seq))
            .cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.lock().seq_by_id.contains_key(id)
    }

    /// Sum of fees over `transactions`, or over the whole pool. Saturates
    /// at `u64::MAX`.
    pub fn get_total_fees(&self, transactions: Option<&[Transaction]>) -> u64 {
        let sum = |total: u64, tx: &Transaction| total.saturating_add(tx.fee);
        match transactions {
            Some(txs) => txs.iter().fold(0, sum),
            None => self.inner.lock().by_seq.values().fold(0, sum),
        }
    }

    pub fn size(&self) -> usize {
        self.inner.lock().by_seq.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        let count = inner.by_seq.len();
        inner.by_seq.clear();
        inner.seq_by_id.clear();
        info!(count, "transaction pool cleared");
    }

    pub fn summary(&self) -> MempoolSummary {
        let transactions = self.get_transactions(None);
        MempoolSummary {
            size: transactions.len(),
            total_fees: self.get_total_fees(Some(&transactions)),
            transactions,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    fn tx(id: &str, fee: u64) -> Transaction {
        Transaction::new("Alice", "Bob", 10, fee).with_id(id)
    }

    #[test]
    fn duplicate_id_is_refused() {
        let pool = TransactionPool::new();
        assert!(pool.add_transaction(tx("a", 1)));
        assert!(!pool.add_transaction(tx("a", 5)));
        assert_eq!(pool.size(), 1);
        assert_eq!(pool.get("a").unwrap().fee, 1);
    }

    #[test]
    fn remove_is_idempotent() {
        let pool = TransactionPool::new();
        pool.add_transaction(tx("a", 0));
        assert!(pool.remove_transaction("a"));
        assert!(!pool.remove_transaction("a"));
        assert!(pool.is_empty());
        // the id becomes available again
        assert!(pool.add_transaction(tx("a", 0)));
    }

    #[test]
    fn retrieval_keeps_insertion_order() {
        let pool = TransactionPool::new();
        for id in ["c", "a", "b", "d"] {
            pool.add_transaction(tx(id, 0));
        }
        pool.remove_transaction("a");
        let ids: Vec<String> = pool.get_transactions(None).into_iter().map(|t| t.id).collect();
        assert_eq!(ids, ["c", "b", "d"]);
        let first_two: Vec<String> = pool.get_transactions(Some(2)).into_iter().map(|t| t.id).collect();
        assert_eq!(first_two, ["c", "b"]);
    }

    #[test]
    fn total_fees() {
        let pool = TransactionPool::new();
        pool.add_transaction(tx("a", 1));
        pool.add_transaction(tx("b", 2));
        pool.add_transaction(tx("c", 3));
        assert_eq!(pool.get_total_fees(None), 6);
        let subset = pool.get_transactions(Some(2));
        assert_eq!(pool.get_total_fees(Some(&subset)), 3);
        assert_eq!(pool.summary().total_fees, 6);
    }

    #[test]
    fn total_fees_saturate() {
        let pool = TransactionPool::new();
        pool.add_transaction(tx("a", u64::MAX));
        pool.add_transaction(tx("b", 1));
        assert_eq!(pool.get_total_fees(None), u64::MAX);
    }

    #[test]
    fn remove_many_and_clear() {
        let pool = TransactionPool::new();
        for id in ["a", "b", "c"] {
            pool.add_transaction(tx(id, 0));
        }
        assert_eq!(pool.remove_many(["a", "b", "zz"]), 2);
        assert!(pool.contains("c"));
        pool.clear();
        assert_eq!(pool.size(), 0);
    }

    #[test]
    fn concurrent_adds_keep_ids_unique() {
        let pool = Arc::new(TransactionPool::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || (0..50).filter(|i| pool.add_transaction(tx(&format!("tx{i}"), 0))).count())
            })
            .collect();
        let accepted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(accepted, 50);
        assert_eq!(pool.size(), 50);
    }
}
