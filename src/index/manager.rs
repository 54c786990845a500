// Index manager.
//
// Wraps one B+ tree for a single indexed field (or composite field set)
// of a collection and buffers transactional mutations. The committed tree
// is only touched during finalize; reads inside a transaction overlay the
// transaction's own buffered changes on the committed contents.

use std::ops::Bound;
use std::time::SystemTime;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::btree::BPlusTree;
use super::key::IndexKey;
use crate::common::{PrimaryKey, TransactionId};
use crate::error::{DbError, Result};

/// Kind of a buffered index mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexChangeKind {
    Insert,
    Remove,
}

/// One buffered index mutation.
///
/// A `Remove` without a value removes every entry under the key; with a
/// value it removes only that (key, value) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexChange {
    pub kind: IndexChangeKind,
    pub key: IndexKey,
    pub value: Option<PrimaryKey>,
    pub timestamp: SystemTime,
}

#[derive(Debug, Default)]
struct TxIndexBuffer {
    changes: Vec<IndexChange>,
    prepared: bool,
}

/// Transactional wrapper around one index tree.
pub struct IndexManager {
    name: String,
    unique: bool,
    tree: BPlusTree<IndexKey, PrimaryKey>,
    pending: DashMap<TransactionId, TxIndexBuffer>,
}

impl IndexManager {
    pub fn new(name: impl Into<String>, unique: bool) -> Self {
        Self {
            name: name.into(),
            unique,
            tree: BPlusTree::with_options(64, unique),
            pending: DashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_unique(&self) -> bool {
        self.unique
    }

    /// Buffers an insert; the tree is never mutated here.
    pub fn insert_in_transaction(
        &self,
        txn_id: TransactionId,
        key: IndexKey,
        value: PrimaryKey,
    ) -> Result<()> {
        self.append_change(
            txn_id,
            IndexChange {
                kind: IndexChangeKind::Insert,
                key,
                value: Some(value),
                timestamp: SystemTime::now(),
            },
        )
    }

    /// Buffers a remove of one (key, value) pair, or of every entry under
    /// the key when `value` is `None`.
    pub fn remove_in_transaction(
        &self,
        txn_id: TransactionId,
        key: IndexKey,
        value: Option<PrimaryKey>,
    ) -> Result<()> {
        self.append_change(
            txn_id,
            IndexChange {
                kind: IndexChangeKind::Remove,
                key,
                value,
                timestamp: SystemTime::now(),
            },
        )
    }

    fn append_change(&self, txn_id: TransactionId, change: IndexChange) -> Result<()> {
        let mut buffer = self.pending.entry(txn_id).or_default();
        if buffer.prepared {
            return Err(DbError::InvalidState(format!(
                "index {}: transaction {} already prepared",
                self.name, txn_id
            )));
        }
        buffer.changes.push(change);
        Ok(())
    }

    /// Committed matches overlaid with the transaction's pending inserts
    /// and removes for the same key.
    pub fn get_all_in_transaction(&self, txn_id: TransactionId, key: &IndexKey) -> Vec<PrimaryKey> {
        let mut merged = self.tree.find(key);
        if let Some(buffer) = self.pending.get(&txn_id) {
            for change in &buffer.changes {
                if &change.key != key {
                    continue;
                }
                match (change.kind, &change.value) {
                    (IndexChangeKind::Insert, Some(v)) => {
                        if !merged.contains(v) {
                            merged.push(v.clone());
                        }
                    }
                    (IndexChangeKind::Insert, None) => {}
                    (IndexChangeKind::Remove, Some(v)) => merged.retain(|m| m != v),
                    (IndexChangeKind::Remove, None) => merged.clear(),
                }
            }
        }
        merged
    }

    /// Committed matches only.
    pub fn get_all(&self, key: &IndexKey) -> Vec<PrimaryKey> {
        self.tree.find(key)
    }

    /// Committed (key, id) pairs in ascending key order within bounds.
    pub fn range(&self, lower: Bound<IndexKey>, upper: Bound<IndexKey>) -> Vec<(IndexKey, PrimaryKey)> {
        self.tree.range(lower, upper)
    }

    pub fn min(&self) -> Option<(IndexKey, Vec<PrimaryKey>)> {
        self.tree.min()
    }

    pub fn max(&self) -> Option<(IndexKey, Vec<PrimaryKey>)> {
        self.tree.max()
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// True when the transaction has buffered changes on this index.
    pub fn has_pending(&self, txn_id: TransactionId) -> bool {
        self.pending
            .get(&txn_id)
            .map(|b| !b.changes.is_empty())
            .unwrap_or(false)
    }

    /// Validates every buffered change and marks the transaction
    /// prepared.
    ///
    /// Returns `Ok(false)` when a change is malformed (null key, insert
    /// without a value) or when the combined committed + buffered view
    /// would violate a unique constraint.
    pub fn prepare_commit(&self, txn_id: TransactionId) -> Result<bool> {
        let Some(mut buffer) = self.pending.get_mut(&txn_id) else {
            // Nothing buffered for this transaction; trivially prepared.
            return Ok(true);
        };

        for change in &buffer.changes {
            match change.kind {
                IndexChangeKind::Insert => {
                    if change.key.is_null() || change.value.is_none() {
                        tracing::warn!(
                            index = %self.name,
                            txn_id = %txn_id,
                            "rejecting insert with null key or missing value"
                        );
                        return Ok(false);
                    }
                }
                IndexChangeKind::Remove => {
                    if change.key.is_null() {
                        tracing::warn!(
                            index = %self.name,
                            txn_id = %txn_id,
                            "rejecting remove with null key"
                        );
                        return Ok(false);
                    }
                }
            }
        }

        if self.unique {
            for change in &buffer.changes {
                if change.kind != IndexChangeKind::Insert {
                    continue;
                }
                let merged = self.merged_view(&buffer.changes, &change.key);
                if merged.len() > 1 {
                    tracing::warn!(
                        index = %self.name,
                        txn_id = %txn_id,
                        key = %change.key,
                        "unique constraint violation at prepare"
                    );
                    return Ok(false);
                }
            }
        }

        buffer.prepared = true;
        Ok(true)
    }

    /// Applies every buffered change to the live tree in insertion order
    /// and drops the buffer. Requires a successful prepare.
    pub fn finalize_commit(&self, txn_id: TransactionId) -> Result<()> {
        let Some((_, buffer)) = self.pending.remove(&txn_id) else {
            return Ok(());
        };
        if !buffer.prepared {
            // Put the buffer back so a later rollback still cleans up.
            self.pending.insert(txn_id, buffer);
            return Err(DbError::InvalidState(format!(
                "index {}: finalize_commit for {} without prepare",
                self.name, txn_id
            )));
        }

        for change in buffer.changes {
            match (change.kind, change.value) {
                (IndexChangeKind::Insert, Some(value)) => {
                    self.tree.insert(change.key, value)?;
                }
                (IndexChangeKind::Insert, None) => {
                    // Rejected at prepare; unreachable on the happy path.
                    return Err(DbError::Internal(format!(
                        "index {}: insert without value survived prepare",
                        self.name
                    )));
                }
                (IndexChangeKind::Remove, Some(value)) => {
                    self.tree.remove_value(&change.key, &value);
                }
                (IndexChangeKind::Remove, None) => {
                    self.tree.remove(&change.key);
                }
            }
        }
        Ok(())
    }

    /// Discards the transaction's buffer and prepared status.
    pub fn rollback(&self, txn_id: TransactionId) {
        self.pending.remove(&txn_id);
    }

    /// Rebuilds the tree from scratch (snapshot restore).
    pub fn clear(&self) {
        self.tree.clear();
    }

    /// Non-transactional insert used by recovery replay and snapshot
    /// restore.
    pub fn insert_committed(&self, key: IndexKey, value: PrimaryKey) -> Result<()> {
        self.tree.insert(key, value)
    }

    /// Non-transactional remove used by recovery replay.
    pub fn remove_committed(&self, key: &IndexKey, value: &PrimaryKey) {
        self.tree.remove_value(key, value);
    }

    fn merged_view(&self, changes: &[IndexChange], key: &IndexKey) -> Vec<PrimaryKey> {
        let mut merged = self.tree.find(key);
        for change in changes {
            if &change.key != key {
                continue;
            }
            match (change.kind, &change.value) {
                (IndexChangeKind::Insert, Some(v)) => {
                    if !merged.contains(v) {
                        merged.push(v.clone());
                    }
                }
                (IndexChangeKind::Insert, None) => {}
                (IndexChangeKind::Remove, Some(v)) => merged.retain(|m| m != v),
                (IndexChangeKind::Remove, None) => merged.clear(),
            }
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::new_transaction_id;

    #[test]
    fn test_buffered_insert_is_isolated() {
        let index = IndexManager::new("name", false);
        let t1 = new_transaction_id();
        let t2 = new_transaction_id();

        index
            .insert_in_transaction(t1, IndexKey::from("a"), PrimaryKey::Int(1))
            .unwrap();

        assert_eq!(
            index.get_all_in_transaction(t1, &IndexKey::from("a")),
            vec![PrimaryKey::Int(1)]
        );
        assert!(index
            .get_all_in_transaction(t2, &IndexKey::from("a"))
            .is_empty());
        assert!(index.get_all(&IndexKey::from("a")).is_empty());
    }

    #[test]
    fn test_prepare_finalize_applies_in_order() {
        let index = IndexManager::new("name", false);
        let txn = new_transaction_id();

        index
            .insert_in_transaction(txn, IndexKey::from("a"), PrimaryKey::Int(1))
            .unwrap();
        index
            .insert_in_transaction(txn, IndexKey::from("a"), PrimaryKey::Int(2))
            .unwrap();
        index
            .remove_in_transaction(txn, IndexKey::from("a"), Some(PrimaryKey::Int(1)))
            .unwrap();

        assert!(index.prepare_commit(txn).unwrap());
        index.finalize_commit(txn).unwrap();

        assert_eq!(index.get_all(&IndexKey::from("a")), vec![PrimaryKey::Int(2)]);
        assert!(!index.has_pending(txn));
    }

    #[test]
    fn test_unique_violation_returns_false() {
        let index = IndexManager::new("email", true);
        index
            .insert_committed(IndexKey::from("x@y"), PrimaryKey::Int(1))
            .unwrap();

        let txn = new_transaction_id();
        index
            .insert_in_transaction(txn, IndexKey::from("x@y"), PrimaryKey::Int(2))
            .unwrap();
        assert!(!index.prepare_commit(txn).unwrap());
    }

    #[test]
    fn test_null_key_rejected_at_prepare() {
        let index = IndexManager::new("name", false);
        let txn = new_transaction_id();
        index
            .insert_in_transaction(txn, IndexKey::Null, PrimaryKey::Int(1))
            .unwrap();
        assert!(!index.prepare_commit(txn).unwrap());
    }

    #[test]
    fn test_finalize_without_prepare_is_misuse() {
        let index = IndexManager::new("name", false);
        let txn = new_transaction_id();
        index
            .insert_in_transaction(txn, IndexKey::from("a"), PrimaryKey::Int(1))
            .unwrap();
        assert!(matches!(
            index.finalize_commit(txn),
            Err(DbError::InvalidState(_))
        ));
        // Buffer survives for rollback.
        index.rollback(txn);
        assert!(!index.has_pending(txn));
    }

    #[test]
    fn test_rollback_discards_buffer() {
        let index = IndexManager::new("name", false);
        let txn = new_transaction_id();
        index
            .insert_in_transaction(txn, IndexKey::from("a"), PrimaryKey::Int(1))
            .unwrap();
        index.rollback(txn);
        assert!(index.get_all(&IndexKey::from("a")).is_empty());
        assert!(index
            .get_all_in_transaction(txn, &IndexKey::from("a"))
            .is_empty());
    }

    #[test]
    fn test_remove_without_value_clears_key() {
        let index = IndexManager::new("tag", false);
        index
            .insert_committed(IndexKey::from("blue"), PrimaryKey::Int(1))
            .unwrap();
        index
            .insert_committed(IndexKey::from("blue"), PrimaryKey::Int(2))
            .unwrap();

        let txn = new_transaction_id();
        index
            .remove_in_transaction(txn, IndexKey::from("blue"), None)
            .unwrap();
        assert!(index
            .get_all_in_transaction(txn, &IndexKey::from("blue"))
            .is_empty());

        assert!(index.prepare_commit(txn).unwrap());
        index.finalize_commit(txn).unwrap();
        assert!(index.get_all(&IndexKey::from("blue")).is_empty());
    }
}
