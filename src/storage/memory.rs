// In-memory transactional store.
//
// Committed documents live in one map; every transaction gets an ordered
// change buffer. Transactional reads return the most recent buffered
// state for a key, falling back to the committed document.

use std::collections::HashMap;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;

use super::adapter::StorageAdapter;
use super::change::{ChangeKind, ChangeRecord};
use crate::common::{PrimaryKey, TransactionId};
use crate::error::{DbError, Result};

#[derive(Debug, Default)]
struct TxChangeBuffer {
    records: Vec<ChangeRecord>,
    prepared: bool,
}

/// In-memory document storage with snapshot + change-buffer semantics.
#[derive(Default)]
pub struct TransactionalStorage {
    committed: RwLock<HashMap<PrimaryKey, Value>>,
    buffers: DashMap<TransactionId, TxChangeBuffer>,
}

impl TransactionalStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of committed documents.
    pub fn len(&self) -> usize {
        self.committed.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.committed.read().is_empty()
    }

    /// Committed (id, document) pairs sorted by id, for snapshots.
    pub fn all_committed(&self) -> Vec<(PrimaryKey, Value)> {
        let committed = self.committed.read();
        let mut docs: Vec<(PrimaryKey, Value)> =
            committed.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        docs.sort_by(|a, b| a.0.cmp(&b.0));
        docs
    }

    /// Most recent buffered state for the key, if the transaction touched
    /// it: `Some(Some(doc))` after insert/update, `Some(None)` after
    /// delete, `None` when untouched.
    fn buffered_state(&self, txn_id: TransactionId, key: &PrimaryKey) -> Option<Option<Value>> {
        let buffer = self.buffers.get(&txn_id)?;
        for record in buffer.records.iter().rev() {
            if &record.id == key {
                return match record.kind {
                    ChangeKind::Insert | ChangeKind::Update => {
                        Some(record.new_value.clone())
                    }
                    ChangeKind::Delete => Some(None),
                };
            }
        }
        None
    }
}

impl StorageAdapter for TransactionalStorage {
    fn init(&self) -> Result<()> {
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.buffers.clear();
        Ok(())
    }

    fn get(&self, key: &PrimaryKey, txn_id: Option<TransactionId>) -> Result<Option<Value>> {
        if let Some(txn) = txn_id {
            if let Some(state) = self.buffered_state(txn, key) {
                return Ok(state);
            }
        }
        Ok(self.committed.read().get(key).cloned())
    }

    fn set(&self, key: PrimaryKey, value: Value, txn_id: Option<TransactionId>) -> Result<()> {
        match txn_id {
            Some(txn) => {
                let old = self.get(&key, Some(txn))?;
                let record = match old {
                    Some(old_value) => ChangeRecord::update(key, old_value, value),
                    None => ChangeRecord::insert(key, value),
                };
                let mut buffer = self.buffers.entry(txn).or_default();
                if buffer.prepared {
                    return Err(DbError::InvalidState(format!(
                        "transaction {} already prepared",
                        txn
                    )));
                }
                buffer.records.push(record);
                Ok(())
            }
            None => {
                self.committed.write().insert(key, value);
                Ok(())
            }
        }
    }

    fn delete(&self, key: &PrimaryKey, txn_id: Option<TransactionId>) -> Result<Option<Value>> {
        match txn_id {
            Some(txn) => {
                let old = self.get(key, Some(txn))?;
                let Some(old_value) = old else {
                    return Ok(None);
                };
                let mut buffer = self.buffers.entry(txn).or_default();
                if buffer.prepared {
                    return Err(DbError::InvalidState(format!(
                        "transaction {} already prepared",
                        txn
                    )));
                }
                buffer
                    .records
                    .push(ChangeRecord::delete(key.clone(), old_value.clone()));
                Ok(Some(old_value))
            }
            None => Ok(self.committed.write().remove(key)),
        }
    }

    fn keys(&self) -> Vec<PrimaryKey> {
        self.committed.read().keys().cloned().collect()
    }

    fn clear(&self) -> Result<()> {
        self.committed.write().clear();
        Ok(())
    }

    fn prepare_commit(&self, txn_id: TransactionId) -> Result<bool> {
        let Some(mut buffer) = self.buffers.get_mut(&txn_id) else {
            return Ok(true);
        };
        for record in &buffer.records {
            match record.kind {
                ChangeKind::Insert | ChangeKind::Update => {
                    if record.new_value.is_none() {
                        tracing::warn!(
                            txn_id = %txn_id,
                            id = %record.id,
                            "rejecting write without a new value"
                        );
                        return Ok(false);
                    }
                }
                ChangeKind::Delete => {}
            }
        }
        buffer.prepared = true;
        Ok(true)
    }

    fn finalize_commit(&self, txn_id: TransactionId) -> Result<()> {
        let Some((_, buffer)) = self.buffers.remove(&txn_id) else {
            return Ok(());
        };
        if !buffer.prepared {
            self.buffers.insert(txn_id, buffer);
            return Err(DbError::InvalidState(format!(
                "finalize_commit for {} without prepare",
                txn_id
            )));
        }

        let mut committed = self.committed.write();
        for record in buffer.records {
            match record.kind {
                ChangeKind::Insert | ChangeKind::Update => {
                    if let Some(value) = record.new_value {
                        committed.insert(record.id, value);
                    }
                }
                ChangeKind::Delete => {
                    committed.remove(&record.id);
                }
            }
        }
        Ok(())
    }

    fn rollback(&self, txn_id: TransactionId) -> Result<()> {
        self.buffers.remove(&txn_id);
        Ok(())
    }

    fn changes(&self, txn_id: TransactionId) -> Vec<ChangeRecord> {
        self.buffers
            .get(&txn_id)
            .map(|b| b.records.clone())
            .unwrap_or_default()
    }

    fn has_pending(&self, txn_id: TransactionId) -> bool {
        self.buffers
            .get(&txn_id)
            .map(|b| !b.records.is_empty())
            .unwrap_or(false)
    }
}
