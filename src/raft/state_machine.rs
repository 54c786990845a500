// Raft state machine.
//
// Applies committed Raft commands to the transactional collection layer.
// Standalone document commands run inside a one-shot transaction;
// TxBegin/TxCommit/TxRollback commands span multiple entries using the
// transaction id carried in the command, which keeps transaction ids
// deterministic across replicas.
//
// Entries must arrive strictly in order: an index that is not
// last_applied + 1 is refused.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::collection::{CollectionRegistry, TransactionalCollection};
use crate::common::{LogIndex, PrimaryKey, Term, TransactionId};
use crate::error::{DbError, Result};
use crate::transaction::{TransactionManager, TransactionOptions};

use super::types::RaftLogEntry;

/// Replicated command applied to the collection layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RaftCommand {
    Create {
        collection: String,
        document: Value,
        /// Present when the command belongs to an open replicated
        /// transaction.
        txn_id: Option<TransactionId>,
    },
    Update {
        collection: String,
        id: PrimaryKey,
        patch: Value,
        merge: bool,
        txn_id: Option<TransactionId>,
    },
    Delete {
        collection: String,
        id: PrimaryKey,
        txn_id: Option<TransactionId>,
    },
    TxBegin {
        txn_id: TransactionId,
    },
    TxCommit {
        txn_id: TransactionId,
    },
    TxRollback {
        txn_id: TransactionId,
    },
}

impl RaftCommand {
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| DbError::Serialization(format!("raft command encode: {}", e)))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| DbError::Serialization(format!("raft command decode: {}", e)))
    }
}

/// Serialized state machine contents at an applied index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateMachineSnapshot {
    pub last_applied_index: LogIndex,
    pub last_applied_term: Term,
    /// Every collection's committed documents, sorted by id.
    pub collections: BTreeMap<String, Vec<(PrimaryKey, Value)>>,
}

/// Applies committed commands to registered collections.
pub struct CollectionStateMachine {
    registry: Arc<CollectionRegistry>,
    transactions: Arc<TransactionManager>,
    /// Replicated transactions currently open on this replica.
    open_transactions: DashMap<TransactionId, ()>,
    last_applied_index: AtomicU64,
    last_applied_term: AtomicU64,
}

impl CollectionStateMachine {
    pub fn new() -> Self {
        Self::with_parts(
            Arc::new(CollectionRegistry::new()),
            Arc::new(TransactionManager::new()),
        )
    }

    pub fn with_parts(
        registry: Arc<CollectionRegistry>,
        transactions: Arc<TransactionManager>,
    ) -> Self {
        Self {
            registry,
            transactions,
            open_transactions: DashMap::new(),
            last_applied_index: AtomicU64::new(0),
            last_applied_term: AtomicU64::new(0),
        }
    }

    /// Registers a collection as both an apply target and a 2PC
    /// participant of the state machine's transaction manager.
    pub fn register_collection(&self, collection: Arc<TransactionalCollection>) {
        self.transactions.register_participant(collection.clone());
        self.registry.register(collection);
    }

    pub fn registry(&self) -> &Arc<CollectionRegistry> {
        &self.registry
    }

    pub fn last_applied_index(&self) -> LogIndex {
        self.last_applied_index.load(Ordering::SeqCst)
    }

    pub fn last_applied_term(&self) -> Term {
        self.last_applied_term.load(Ordering::SeqCst)
    }

    /// Applies one committed entry. Refuses anything that is not exactly
    /// the next index.
    pub async fn apply(&self, entry: &RaftLogEntry) -> Result<()> {
        let expected = self.last_applied_index() + 1;
        if entry.index != expected {
            return Err(DbError::InvalidState(format!(
                "state machine expected index {}, got {}",
                expected, entry.index
            )));
        }

        let command = RaftCommand::decode(&entry.command)?;
        self.execute(command).await?;

        self.last_applied_index.store(entry.index, Ordering::SeqCst);
        self.last_applied_term.store(entry.term, Ordering::SeqCst);
        Ok(())
    }

    async fn execute(&self, command: RaftCommand) -> Result<()> {
        match command {
            RaftCommand::Create {
                collection,
                document,
                txn_id,
            } => {
                let target = self.target(&collection)?;
                match self.open_txn(txn_id) {
                    Some(txn) => target.create_in_transaction(txn, document).map(|_| ()),
                    None => {
                        self.run_auto(move |txn| {
                            target.create_in_transaction(txn, document).map(|_| ())
                        })
                        .await
                    }
                }
            }
            RaftCommand::Update {
                collection,
                id,
                patch,
                merge,
                txn_id,
            } => {
                let target = self.target(&collection)?;
                match self.open_txn(txn_id) {
                    Some(txn) => target
                        .update_in_transaction(txn, &id, patch, merge)
                        .map(|_| ()),
                    None => {
                        self.run_auto(move |txn| {
                            target.update_in_transaction(txn, &id, patch, merge).map(|_| ())
                        })
                        .await
                    }
                }
            }
            RaftCommand::Delete {
                collection,
                id,
                txn_id,
            } => {
                let target = self.target(&collection)?;
                match self.open_txn(txn_id) {
                    Some(txn) => target.remove_in_transaction(txn, &id).map(|_| ()),
                    None => {
                        self.run_auto(move |txn| {
                            target.remove_in_transaction(txn, &id).map(|_| ())
                        })
                        .await
                    }
                }
            }
            RaftCommand::TxBegin { txn_id } => {
                self.transactions
                    .begin_with_id(txn_id, TransactionOptions::default())
                    .map_err(DbError::from)?;
                self.open_transactions.insert(txn_id, ());
                Ok(())
            }
            RaftCommand::TxCommit { txn_id } => {
                self.open_transactions.remove(&txn_id);
                self.transactions.commit(txn_id).await.map_err(DbError::from)
            }
            RaftCommand::TxRollback { txn_id } => {
                self.open_transactions.remove(&txn_id);
                self.transactions
                    .rollback(txn_id)
                    .await
                    .map_err(DbError::from)
            }
        }
    }

    fn target(&self, collection: &str) -> Result<Arc<TransactionalCollection>> {
        self.registry.get(collection).ok_or_else(|| {
            DbError::NotFound(format!("collection {} is not registered", collection))
        })
    }

    fn open_txn(&self, txn_id: Option<TransactionId>) -> Option<TransactionId> {
        txn_id.filter(|t| self.open_transactions.contains_key(t))
    }

    /// One-shot transaction around a standalone command.
    async fn run_auto<F>(&self, op: F) -> Result<()>
    where
        F: FnOnce(TransactionId) -> Result<()>,
    {
        let txn = self.transactions.begin();
        match op(txn) {
            Ok(()) => self.transactions.commit(txn).await.map_err(DbError::from),
            Err(e) => {
                if let Err(rollback_err) = self.transactions.rollback(txn).await {
                    tracing::warn!(txn_id = %txn, error = %rollback_err, "auto rollback failed");
                }
                Err(e)
            }
        }
    }

    /// Serializes every collection's committed contents plus the applied
    /// position.
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        let mut collections = BTreeMap::new();
        for collection in self.registry.all() {
            collections.insert(collection.name().to_string(), collection.all_committed());
        }
        let snapshot = StateMachineSnapshot {
            last_applied_index: self.last_applied_index(),
            last_applied_term: self.last_applied_term(),
            collections,
        };
        serde_json::to_vec(&snapshot)
            .map_err(|e| DbError::Serialization(format!("snapshot encode: {}", e)))
    }

    /// Replaces all collection state from a snapshot and adopts its
    /// applied position.
    pub fn restore(&self, data: &[u8]) -> Result<()> {
        let snapshot: StateMachineSnapshot = serde_json::from_slice(data)
            .map_err(|e| DbError::Serialization(format!("snapshot decode: {}", e)))?;

        for collection in self.registry.all() {
            match snapshot.collections.get(collection.name()) {
                Some(documents) => collection.restore_snapshot(documents.clone())?,
                None => collection.restore_snapshot(Vec::new())?,
            }
        }
        for name in snapshot.collections.keys() {
            if self.registry.get(name).is_none() {
                tracing::warn!(collection = %name, "snapshot contains unregistered collection");
            }
        }

        self.last_applied_index
            .store(snapshot.last_applied_index, Ordering::SeqCst);
        self.last_applied_term
            .store(snapshot.last_applied_term, Ordering::SeqCst);
        self.open_transactions.clear();

        tracing::info!(
            last_applied_index = snapshot.last_applied_index,
            "state machine restored from snapshot"
        );
        Ok(())
    }
}

impl Default for CollectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::{CollectionConfig, IndexDefinition};
    use crate::common::new_transaction_id;
    use crate::index::IndexKey;
    use serde_json::json;

    fn machine() -> CollectionStateMachine {
        let machine = CollectionStateMachine::new();
        let users = TransactionalCollection::new(
            CollectionConfig::new("users").index(IndexDefinition::field("name", "name").unique()),
        )
        .unwrap();
        machine.register_collection(Arc::new(users));
        machine
    }

    fn entry(index: u64, command: &RaftCommand) -> RaftLogEntry {
        RaftLogEntry::new(1, index, command.encode().unwrap(), "node-1".to_string())
    }

    #[tokio::test]
    async fn test_apply_create_through_auto_transaction() {
        let machine = machine();
        let command = RaftCommand::Create {
            collection: "users".to_string(),
            document: json!({"id": 1, "name": "a"}),
            txn_id: None,
        };
        machine.apply(&entry(1, &command)).await.unwrap();

        let users = machine.registry().get("users").unwrap();
        assert!(users.find_by_id(&PrimaryKey::Int(1)).unwrap().is_some());
        assert_eq!(machine.last_applied_index(), 1);
    }

    #[tokio::test]
    async fn test_out_of_order_apply_refused() {
        let machine = machine();
        let command = RaftCommand::Create {
            collection: "users".to_string(),
            document: json!({"id": 1, "name": "a"}),
            txn_id: None,
        };

        // Index 3 when 1 is expected.
        let result = machine.apply(&entry(3, &command)).await;
        assert!(matches!(result, Err(DbError::InvalidState(_))));

        machine.apply(&entry(1, &command)).await.unwrap();
        // Replaying an already applied index is refused too.
        assert!(machine.apply(&entry(1, &command)).await.is_err());
    }

    #[tokio::test]
    async fn test_replicated_transaction_spans_entries() {
        let machine = machine();
        let txn_id = new_transaction_id();

        machine
            .apply(&entry(1, &RaftCommand::TxBegin { txn_id }))
            .await
            .unwrap();
        machine
            .apply(&entry(
                2,
                &RaftCommand::Create {
                    collection: "users".to_string(),
                    document: json!({"id": 1, "name": "a"}),
                    txn_id: Some(txn_id),
                },
            ))
            .await
            .unwrap();

        // Not visible until the replicated commit applies.
        let users = machine.registry().get("users").unwrap();
        assert!(users.find_by_id(&PrimaryKey::Int(1)).unwrap().is_none());

        machine
            .apply(&entry(3, &RaftCommand::TxCommit { txn_id }))
            .await
            .unwrap();
        assert!(users.find_by_id(&PrimaryKey::Int(1)).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_replicated_rollback_discards() {
        let machine = machine();
        let txn_id = new_transaction_id();

        machine
            .apply(&entry(1, &RaftCommand::TxBegin { txn_id }))
            .await
            .unwrap();
        machine
            .apply(&entry(
                2,
                &RaftCommand::Create {
                    collection: "users".to_string(),
                    document: json!({"id": 2, "name": "b"}),
                    txn_id: Some(txn_id),
                },
            ))
            .await
            .unwrap();
        machine
            .apply(&entry(3, &RaftCommand::TxRollback { txn_id }))
            .await
            .unwrap();

        let users = machine.registry().get("users").unwrap();
        assert!(users.find_by_id(&PrimaryKey::Int(2)).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let source = machine();
        for (index, (id, name)) in [(1, "a"), (2, "b")].iter().enumerate() {
            let command = RaftCommand::Create {
                collection: "users".to_string(),
                document: json!({"id": id, "name": name}),
                txn_id: None,
            };
            source
                .apply(&entry(index as u64 + 1, &command))
                .await
                .unwrap();
        }

        let data = source.snapshot().unwrap();

        let target = machine();
        target.restore(&data).unwrap();
        assert_eq!(target.last_applied_index(), 2);

        let users = target.registry().get("users").unwrap();
        assert_eq!(users.len(), 2);
        assert_eq!(
            users
                .find_by_index("name", &IndexKey::from("b"))
                .unwrap()
                .len(),
            1
        );
    }
}
