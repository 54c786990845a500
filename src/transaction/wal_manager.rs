// WAL-aware transaction manager.
//
// Layers durable intent records over the plain manager:
//
// - `begin`   -> Begin entry
// - `commit`  -> one Data entry per involved participant (before its
//                prepare), then Commit + flush on success
// - `rollback`-> Rollback entry
//
// The Commit entry is written only after every participant finalized, so
// a crash mid-finalize leaves no commit record and recovery discards the
// transaction's data entries.
//
// One logical WAL is injected at construction; collections and
// independent storage adapters registered with the same manager share it,
// which is what "global WAL" mode means here.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use async_trait::async_trait;

use crate::common::{PrimaryKey, SequenceNumber, TransactionId};
use crate::error::{DbError, Result};
use crate::storage::{ChangeKind, ChangeRecord, StorageAdapter, TransactionalStorage};
use crate::wal::{RecoveryReport, WalConfig, WalEntry, WalEntryType, WalManager};

use super::error::{TransactionError, TransactionResult};
use super::manager::{ListenerHandle, TransactionManager};
use super::participant::TransactionParticipant;
use super::types::{Transaction, TransactionOptions};

/// Kind of a replayable document operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplayKind {
    Create,
    Update,
    Delete,
}

/// One durable, replayable document operation carried in a Data entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayOperation {
    /// Collection (or adapter) the operation belongs to.
    pub collection: String,
    pub kind: ReplayKind,
    pub key: PrimaryKey,
    /// New document for Create/Update; absent for Delete.
    pub value: Option<Value>,
}

/// Participant whose buffered changes can be written to and replayed
/// from the WAL.
pub trait WalParticipant: TransactionParticipant {
    /// Collection name recovered operations are routed by.
    fn replay_target(&self) -> String;

    /// Buffered operations of the transaction, in insertion order.
    fn pending_operations(&self, txn_id: TransactionId) -> Vec<ReplayOperation>;

    /// Applies one recovered operation directly to committed state.
    /// Must be idempotent: re-applying an already applied operation
    /// yields no observable change.
    fn apply_operation(&self, operation: &ReplayOperation) -> Result<()>;
}

/// Storage adapter participant not tied to any collection.
///
/// Wraps a raw transactional store under a stable name so it can join
/// cross-collection commits over the shared WAL alongside regular
/// collections.
pub struct AdapterParticipant {
    name: String,
    storage: Arc<TransactionalStorage>,
}

impl AdapterParticipant {
    pub fn new(name: impl Into<String>, storage: Arc<TransactionalStorage>) -> Self {
        Self {
            name: name.into(),
            storage,
        }
    }

    pub fn storage(&self) -> &Arc<TransactionalStorage> {
        &self.storage
    }
}

#[async_trait]
impl TransactionParticipant for AdapterParticipant {
    fn participant_id(&self) -> String {
        format!("adapter:{}", self.name)
    }

    fn has_pending(&self, txn_id: TransactionId) -> bool {
        self.storage.has_pending(txn_id)
    }

    fn pending_changes(&self, txn_id: TransactionId) -> Vec<ChangeRecord> {
        self.storage.changes(txn_id)
    }

    async fn prepare_commit(&self, txn_id: TransactionId) -> Result<bool> {
        self.storage.prepare_commit(txn_id)
    }

    async fn finalize_commit(&self, txn_id: TransactionId) -> Result<()> {
        self.storage.finalize_commit(txn_id)
    }

    async fn rollback(&self, txn_id: TransactionId) -> Result<()> {
        self.storage.rollback(txn_id)
    }
}

impl WalParticipant for AdapterParticipant {
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
                let value = operation.value.clone().ok_or_else(|| {
                    DbError::Corruption(format!(
                        "recovered {} operation without a value for key {}",
                        self.name, operation.key
                    ))
                })?;
                self.storage.set(operation.key.clone(), value, None)
            }
            ReplayKind::Delete => self.storage.delete(&operation.key, None).map(|_| ()),
        }
    }
}

/// Transaction manager that records intent in a write-ahead log.
pub struct WalTransactionManager {
    inner: Arc<TransactionManager>,
    wal: Arc<WalManager>,
    enabled: bool,
    auto_recovery: bool,
    participants: RwLock<Vec<Arc<dyn WalParticipant>>>,
    /// Begin sequence per live transaction; the minimum is the WAL
    /// retention floor.
    begin_sequences: Arc<RwLock<HashMap<TransactionId, SequenceNumber>>>,
}

impl WalTransactionManager {
    pub fn new(wal: Arc<WalManager>, config: &WalConfig) -> Self {
        Self::with_manager(Arc::new(TransactionManager::new()), wal, config)
    }

    pub fn with_manager(
        inner: Arc<TransactionManager>,
        wal: Arc<WalManager>,
        config: &WalConfig,
    ) -> Self {
        let begin_sequences = Arc::new(RwLock::new(HashMap::new()));
        let guard_map: Arc<RwLock<HashMap<TransactionId, SequenceNumber>>> =
            Arc::clone(&begin_sequences);
        wal.set_retention_guard(move || guard_map.read().values().min().copied());

        Self {
            inner,
            wal,
            enabled: config.enabled,
            auto_recovery: config.auto_recovery,
            participants: RwLock::new(Vec::new()),
            begin_sequences,
        }
    }

    pub fn inner(&self) -> &Arc<TransactionManager> {
        &self.inner
    }

    pub fn wal(&self) -> &Arc<WalManager> {
        &self.wal
    }

    /// Registers a participant with both the 2PC coordinator and the WAL
    /// replay path. Independent storage adapters register the same way
    /// as collections, sharing the one logical WAL.
    pub fn register_participant<P: WalParticipant + 'static>(&self, participant: Arc<P>) {
        self.inner.register_participant(participant.clone());
        self.participants.write().push(participant);
    }

    pub fn begin(&self) -> TransactionResult<TransactionId> {
        self.begin_with_options(TransactionOptions::default())
    }

    pub fn begin_with_options(
        &self,
        options: TransactionOptions,
    ) -> TransactionResult<TransactionId> {
        let txn_id = self.inner.begin_with_options(options);
        if self.enabled {
            let sequence = self
                .wal
                .write_entry(WalEntry::begin(txn_id))
                .map_err(|e| TransactionError::Wal(e.to_string()))?;
            self.begin_sequences.write().insert(txn_id, sequence);
        }
        Ok(txn_id)
    }

    /// Commits via 2PC, writing Data entries before the participants
    /// prepare and the Commit entry (flushed) after they all finalized.
    pub async fn commit(&self, txn_id: TransactionId) -> TransactionResult<()> {
        if self.enabled {
            let participants = self.participants.read().clone();
            for participant in participants {
                let operations = participant.pending_operations(txn_id);
                if operations.is_empty() {
                    continue;
                }
                let payload = serde_json::to_vec(&operations)
                    .map_err(|e| TransactionError::Wal(e.to_string()))?;
                self.wal
                    .write_entry(WalEntry::new(
                        txn_id,
                        WalEntryType::Data,
                        Some(participant.replay_target()),
                        Some("apply".to_string()),
                        payload,
                    ))
                    .map_err(|e| TransactionError::Wal(e.to_string()))?;
            }
        }

        let result = self.inner.commit(txn_id).await;

        if self.enabled {
            match &result {
                Ok(()) => {
                    self.wal
                        .write_entry(WalEntry::commit(txn_id))
                        .map_err(|e| TransactionError::Wal(e.to_string()))?;
                    self.wal
                        .flush()
                        .map_err(|e| TransactionError::Wal(e.to_string()))?;
                }
                Err(_) => {
                    // Terminal marker so recovery skips the data entries;
                    // best effort, the missing Commit already excludes them.
                    if let Err(e) = self.wal.write_entry(WalEntry::rollback(txn_id)) {
                        tracing::warn!(txn_id = %txn_id, error = %e, "failed to write rollback marker");
                    }
                }
            }
            self.begin_sequences.write().remove(&txn_id);
        }

        result
    }

    pub async fn rollback(&self, txn_id: TransactionId) -> TransactionResult<()> {
        let result = self.inner.rollback(txn_id).await;
        if self.enabled {
            if let Err(e) = self.wal.write_entry(WalEntry::rollback(txn_id)) {
                tracing::warn!(txn_id = %txn_id, error = %e, "failed to write rollback marker");
            }
            self.begin_sequences.write().remove(&txn_id);
        }
        result
    }

    /// Scans the WAL and, when auto-recovery is configured, replays every
    /// committed transaction's operations against the registered
    /// participants. Safe to call repeatedly.
    pub fn recover(&self) -> Result<RecoveryReport> {
        let report = self.wal.recover()?;
        if !self.auto_recovery {
            return Ok(report);
        }

        let participants = self.participants.read().clone();
        for recovered in &report.committed {
            for entry in &recovered.data_entries {
                let operations: Vec<ReplayOperation> = serde_json::from_slice(&entry.payload)?;
                for operation in &operations {
                    match participants
                        .iter()
                        .find(|p| p.replay_target() == operation.collection)
                    {
                        Some(participant) => participant.apply_operation(operation)?,
                        None => tracing::warn!(
                            collection = %operation.collection,
                            txn_id = %recovered.txn_id,
                            "no participant registered for recovered operation"
                        ),
                    }
                }
            }
        }

        tracing::info!(
            committed = report.committed.len(),
            rolled_back = report.rolled_back,
            incomplete = report.incomplete,
            "WAL recovery complete"
        );
        Ok(report)
    }

    // Delegates to the plain manager.

    pub fn get(&self, txn_id: TransactionId) -> Option<Transaction> {
        self.inner.get(txn_id)
    }

    pub fn is_active(&self, txn_id: TransactionId) -> bool {
        self.inner.is_active(txn_id)
    }

    pub async fn cleanup(&self) -> Vec<TransactionId> {
        self.inner.cleanup().await
    }

    pub fn add_change_listener(
        &self,
        listener: impl Fn(&[crate::storage::ChangeRecord]) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.inner.add_change_listener(listener)
    }

    pub fn remove_change_listener(&self, handle: ListenerHandle) {
        self.inner.remove_change_listener(handle)
    }
}
