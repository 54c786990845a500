// Transactional collection.
//
// Composes one storage adapter and one index manager per defined index
// for a single collection, routing every operation through a transaction
// context. The collection is itself a 2PC participant: prepare asks
// storage and every index, finalize applies storage first and then the
// indexes, rollback discards everything.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use crate::common::{PrimaryKey, TransactionId};
use crate::error::{DbError, Result};
use crate::index::{IndexKey, IndexManager};
use crate::storage::{ChangeKind, ChangeRecord, CollectionStore, StorageAdapter, TransactionalStorage};
use crate::transaction::{
    ReplayKind, ReplayOperation, TransactionParticipant, WalParticipant,
};

use super::definition::{
    AcceptAllValidator, CollectionConfig, DocumentValidator, IndexDefinition, ValidationOutcome,
};

/// A named document container with transactional storage and indexes.
pub struct TransactionalCollection {
    name: String,
    id_field: String,
    validator: Arc<dyn DocumentValidator>,
    storage: Arc<TransactionalStorage>,
    indexes: Vec<(IndexDefinition, Arc<IndexManager>)>,
}

impl TransactionalCollection {
    pub fn new(config: CollectionConfig) -> Result<Self> {
        let mut seen = std::collections::HashSet::new();
        for definition in &config.indexes {
            if !seen.insert(definition.name.clone()) {
                return Err(DbError::InvalidOperation(format!(
                    "collection {}: duplicate index name {}",
                    config.name, definition.name
                )));
            }
        }

        let indexes = config
            .indexes
            .into_iter()
            .map(|definition| {
                let manager = Arc::new(IndexManager::new(
                    format!("{}.{}", config.name, definition.name),
                    definition.unique,
                ));
                (definition, manager)
            })
            .collect();

        Ok(Self {
            name: config.name,
            id_field: config.id_field,
            validator: config
                .validator
                .unwrap_or_else(|| Arc::new(AcceptAllValidator)),
            storage: Arc::new(TransactionalStorage::new()),
            indexes,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index_names(&self) -> Vec<String> {
        self.indexes
            .iter()
            .map(|(d, _)| d.name.clone())
            .collect()
    }

    /// Number of committed documents.
    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    // ------------------------------------------------------------------
    // Transactional operations
    // ------------------------------------------------------------------

    /// Validates and buffers a document insert plus one index insert per
    /// defined index. Returns the document's primary key.
    pub fn create_in_transaction(
        &self,
        txn_id: TransactionId,
        document: Value,
    ) -> Result<PrimaryKey> {
        self.validate(&document)?;
        let id = self.id_of(&document)?;

        if self.storage.get(&id, Some(txn_id))?.is_some() {
            return Err(DbError::Constraint(format!(
                "collection {}: duplicate primary key {}",
                self.name, id
            )));
        }

        self.storage
            .set(id.clone(), document.clone(), Some(txn_id))?;

        for (definition, index) in &self.indexes {
            if let Some(key) = definition.key_for(&document)? {
                index.insert_in_transaction(txn_id, key, id.clone())?;
            }
        }

        Ok(id)
    }

    /// Reads the transactional view of the document, merges or replaces
    /// it with `patch`, re-validates, and buffers the storage update plus
    /// a remove-old/insert-new pair per index. `Ok(None)` when the id is
    /// unknown.
    pub fn update_in_transaction(
        &self,
        txn_id: TransactionId,
        id: &PrimaryKey,
        patch: Value,
        merge: bool,
    ) -> Result<Option<Value>> {
        let Some(current) = self.storage.get(id, Some(txn_id))? else {
            return Ok(None);
        };

        let mut updated = if merge {
            merge_documents(&current, &patch)
        } else {
            patch
        };

        match updated.get(&self.id_field).map(PrimaryKey::from_json) {
            Some(Some(patched_id)) if patched_id != *id => {
                return Err(DbError::Validation(format!(
                    "collection {}: primary key is immutable ({} -> {})",
                    self.name, id, patched_id
                )));
            }
            Some(Some(_)) => {}
            _ => {
                if let Value::Object(map) = &mut updated {
                    map.insert(self.id_field.clone(), id.to_json());
                }
            }
        }

        self.validate(&updated)?;
        self.storage.set(id.clone(), updated.clone(), Some(txn_id))?;

        for (definition, index) in &self.indexes {
            if let Some(old_key) = definition.key_for(&current)? {
                index.remove_in_transaction(txn_id, old_key, Some(id.clone()))?;
            }
            if let Some(new_key) = definition.key_for(&updated)? {
                index.insert_in_transaction(txn_id, new_key, id.clone())?;
            }
        }

        Ok(Some(updated))
    }

    /// Buffers a delete plus one index remove per defined index.
    /// `Ok(None)` when the id is unknown.
    pub fn remove_in_transaction(
        &self,
        txn_id: TransactionId,
        id: &PrimaryKey,
    ) -> Result<Option<Value>> {
        let Some(current) = self.storage.delete(id, Some(txn_id))? else {
            return Ok(None);
        };

        for (definition, index) in &self.indexes {
            if let Some(key) = definition.key_for(&current)? {
                index.remove_in_transaction(txn_id, key, Some(id.clone()))?;
            }
        }

        Ok(Some(current))
    }

    /// Transactional read: the transaction's buffered state overlays the
    /// committed document.
    pub fn find_by_id_in_transaction(
        &self,
        txn_id: TransactionId,
        id: &PrimaryKey,
    ) -> Result<Option<Value>> {
        self.storage.get(id, Some(txn_id))
    }

    /// Transactional index lookup: committed matches merged with the
    /// transaction's pending index changes, resolved to documents.
    pub fn find_by_index_in_transaction(
        &self,
        txn_id: TransactionId,
        index_name: &str,
        key: &IndexKey,
    ) -> Result<Vec<Value>> {
        let (_, index) = self.index_by_name(index_name)?;
        let ids = index.get_all_in_transaction(txn_id, key);
        let mut documents = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(doc) = self.storage.get(&id, Some(txn_id))? {
                documents.push(doc);
            }
        }
        Ok(documents)
    }

    // ------------------------------------------------------------------
    // Committed reads
    // ------------------------------------------------------------------

    pub fn find_by_id(&self, id: &PrimaryKey) -> Result<Option<Value>> {
        self.storage.get(id, None)
    }

    pub fn find_by_index(&self, index_name: &str, key: &IndexKey) -> Result<Vec<Value>> {
        let (_, index) = self.index_by_name(index_name)?;
        let mut documents = Vec::new();
        for id in index.get_all(key) {
            if let Some(doc) = self.storage.get(&id, None)? {
                documents.push(doc);
            }
        }
        Ok(documents)
    }

    /// Committed (id, document) pairs sorted by id, for snapshots.
    pub fn all_committed(&self) -> Vec<(PrimaryKey, Value)> {
        self.storage.all_committed()
    }

    // ------------------------------------------------------------------
    // Recovery / snapshot plumbing
    // ------------------------------------------------------------------

    /// Replaces the committed document and reindexes it, bypassing the
    /// transaction layer. Used by WAL replay and snapshot restore;
    /// idempotent because old index entries are removed first.
    pub fn apply_committed_write(&self, id: PrimaryKey, document: Value) -> Result<()> {
        if let Some(old) = self.storage.get(&id, None)? {
            for (definition, index) in &self.indexes {
                if let Some(key) = definition.key_for(&old)? {
                    index.remove_committed(&key, &id);
                }
            }
        }

        self.storage.set(id.clone(), document.clone(), None)?;
        for (definition, index) in &self.indexes {
            if let Some(key) = definition.key_for(&document)? {
                index.insert_committed(key, id.clone())?;
            }
        }
        Ok(())
    }

    /// Deletes the committed document and its index entries, bypassing
    /// the transaction layer.
    pub fn apply_committed_delete(&self, id: &PrimaryKey) -> Result<()> {
        let Some(old) = self.storage.get(id, None)? else {
            return Ok(());
        };
        for (definition, index) in &self.indexes {
            if let Some(key) = definition.key_for(&old)? {
                index.remove_committed(&key, id);
            }
        }
        self.storage.delete(id, None)?;
        Ok(())
    }

    /// Replaces all committed contents (snapshot restore).
    pub fn restore_snapshot(&self, documents: Vec<(PrimaryKey, Value)>) -> Result<()> {
        self.storage.clear()?;
        for (_, index) in &self.indexes {
            index.clear();
        }
        for (id, document) in documents {
            self.apply_committed_write(id, document)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn index_by_name(&self, name: &str) -> Result<&(IndexDefinition, Arc<IndexManager>)> {
        self.indexes
            .iter()
            .find(|(d, _)| d.name == name)
            .ok_or_else(|| {
                DbError::NotFound(format!("collection {}: no index named {}", self.name, name))
            })
    }

    fn validate(&self, document: &Value) -> Result<()> {
        match self.validator.validate(document) {
            ValidationOutcome::Success => Ok(()),
            ValidationOutcome::Failure { errors } => Err(DbError::Validation(format!(
                "collection {}: {}",
                self.name,
                errors.join("; ")
            ))),
        }
    }

    fn id_of(&self, document: &Value) -> Result<PrimaryKey> {
        document
            .get(&self.id_field)
            .and_then(PrimaryKey::from_json)
            .ok_or_else(|| {
                DbError::Validation(format!(
                    "collection {}: identifier field '{}' is missing or has an unsupported type",
                    self.name, self.id_field
                ))
            })
    }
}

#[async_trait]
impl TransactionParticipant for TransactionalCollection {
    fn participant_id(&self) -> String {
        format!("collection:{}", self.name)
    }

    fn has_pending(&self, txn_id: TransactionId) -> bool {
        self.storage.has_pending(txn_id)
            || self.indexes.iter().any(|(_, i)| i.has_pending(txn_id))
    }

    fn pending_changes(&self, txn_id: TransactionId) -> Vec<ChangeRecord> {
        self.storage.changes(txn_id)
    }

    async fn prepare_commit(&self, txn_id: TransactionId) -> Result<bool> {
        if !self.storage.prepare_commit(txn_id)? {
            return Ok(false);
        }
        for (_, index) in &self.indexes {
            if !index.prepare_commit(txn_id)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn finalize_commit(&self, txn_id: TransactionId) -> Result<()> {
        // Storage first, then the indexes; a failure anywhere is fatal
        // at the collection level and surfaces to the coordinator.
        self.storage.finalize_commit(txn_id)?;
        for (_, index) in &self.indexes {
            index.finalize_commit(txn_id)?;
        }
        Ok(())
    }

    async fn rollback(&self, txn_id: TransactionId) -> Result<()> {
        let result = self.storage.rollback(txn_id);
        for (_, index) in &self.indexes {
            index.rollback(txn_id);
        }
        result
    }
}

impl WalParticipant for TransactionalCollection {
    fn replay_target(&self) -> String {
        self.name.clone()
    }

    fn pending_operations(&self, txn_id: TransactionId) -> Vec<ReplayOperation> {
        self.storage
            .changes(txn_id)
            .into_iter()
            .map(|record| ReplayOperation {
                collection: self.name.clone(),
                kind: match record.kind {
                    ChangeKind::Insert => ReplayKind::Create,
                    ChangeKind::Update => ReplayKind::Update,
                    ChangeKind::Delete => ReplayKind::Delete,
                },
                key: record.id,
                value: record.new_value,
            })
            .collect()
    }

    fn apply_operation(&self, operation: &ReplayOperation) -> Result<()> {
        match operation.kind {
            ReplayKind::Create | ReplayKind::Update => {
                let document = operation.value.clone().ok_or_else(|| {
                    DbError::Corruption(format!(
                        "recovered {} operation without a document for key {}",
                        self.name, operation.key
                    ))
                })?;
                self.apply_committed_write(operation.key.clone(), document)
            }
            ReplayKind::Delete => self.apply_committed_delete(&operation.key),
        }
    }
}

/// Shallow merge of two JSON objects; non-objects replace wholesale.
fn merge_documents(base: &Value, patch: &Value) -> Value {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            let mut merged = base_map.clone();
            for (key, value) in patch_map {
                merged.insert(key.clone(), value.clone());
            }
            Value::Object(merged)
        }
        _ => patch.clone(),
    }
}

/// Named set of collections addressed by the replication and recovery
/// layers.
#[derive(Default)]
pub struct CollectionRegistry {
    collections: RwLock<HashMap<String, Arc<TransactionalCollection>>>,
}

impl CollectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, collection: Arc<TransactionalCollection>) {
        self.collections
            .write()
            .insert(collection.name().to_string(), collection);
    }

    pub fn get(&self, name: &str) -> Option<Arc<TransactionalCollection>> {
        self.collections.read().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn all(&self) -> Vec<Arc<TransactionalCollection>> {
        self.collections.read().values().cloned().collect()
    }

    fn required(&self, name: &str) -> Result<Arc<TransactionalCollection>> {
        self.get(name)
            .ok_or_else(|| DbError::NotFound(format!("collection {} is not registered", name)))
    }
}

impl CollectionStore for CollectionRegistry {
    fn create(&self, collection: &str, id: PrimaryKey, document: Value) -> Result<()> {
        self.required(collection)?.apply_committed_write(id, document)
    }

    fn read(&self, collection: &str, id: &PrimaryKey) -> Result<Option<Value>> {
        self.required(collection)?.find_by_id(id)
    }

    fn update(&self, collection: &str, id: PrimaryKey, document: Value) -> Result<()> {
        self.required(collection)?.apply_committed_write(id, document)
    }

    fn remove(&self, collection: &str, id: &PrimaryKey) -> Result<Option<Value>> {
        let target = self.required(collection)?;
        let existing = target.find_by_id(id)?;
        target.apply_committed_delete(id)?;
        Ok(existing)
    }
}
