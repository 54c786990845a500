// Storage adapter traits.
//
// `StorageAdapter` is the key-value seam consumed by the transaction
// core: transactional reads and writes plus the 2PC hooks. A `None`
// transaction id addresses the committed store directly.
//
// `CollectionStore` is the collection-routing surface used by WAL replay
// and the Raft state machine, which address documents by collection name.

use serde_json::Value;

use super::change::ChangeRecord;
use crate::common::{PrimaryKey, TransactionId};
use crate::error::Result;

/// Key-value storage with per-transaction change buffers.
pub trait StorageAdapter: Send + Sync {
    /// Prepares the adapter for use.
    fn init(&self) -> Result<()>;

    /// Releases resources; further operations are undefined.
    fn close(&self) -> Result<()>;

    /// Reads a document. With a transaction id the transaction's buffered
    /// state overlays the committed store.
    fn get(&self, key: &PrimaryKey, txn_id: Option<TransactionId>) -> Result<Option<Value>>;

    /// Writes a document. With a transaction id the write is buffered;
    /// without one it hits the committed store directly.
    fn set(&self, key: PrimaryKey, value: Value, txn_id: Option<TransactionId>) -> Result<()>;

    /// Deletes a document, returning the previously visible value.
    fn delete(&self, key: &PrimaryKey, txn_id: Option<TransactionId>) -> Result<Option<Value>>;

    /// Committed keys.
    fn keys(&self) -> Vec<PrimaryKey>;

    /// Drops all committed documents.
    fn clear(&self) -> Result<()>;

    /// Validates the transaction's buffered records; `Ok(false)` vetoes
    /// the commit.
    fn prepare_commit(&self, txn_id: TransactionId) -> Result<bool>;

    /// Applies the buffered records in insertion order.
    fn finalize_commit(&self, txn_id: TransactionId) -> Result<()>;

    /// Discards the transaction's buffer.
    fn rollback(&self, txn_id: TransactionId) -> Result<()>;

    /// Ordered buffered records for the transaction (empty if none).
    fn changes(&self, txn_id: TransactionId) -> Vec<ChangeRecord>;

    /// True when the transaction has buffered records here.
    fn has_pending(&self, txn_id: TransactionId) -> bool;
}

/// Collection-addressed document operations.
pub trait CollectionStore: Send + Sync {
    fn create(&self, collection: &str, id: PrimaryKey, document: Value) -> Result<()>;

    fn read(&self, collection: &str, id: &PrimaryKey) -> Result<Option<Value>>;

    fn update(&self, collection: &str, id: PrimaryKey, document: Value) -> Result<()>;

    fn remove(&self, collection: &str, id: &PrimaryKey) -> Result<Option<Value>>;
}
