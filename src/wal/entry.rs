// WAL entry types.
//
// Every record carries a monotonic sequence number, the owning transaction,
// and a CRC32 checksum over all immutable fields. Checksum validation is
// mandatory on read; a mismatch terminates replay.

use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::common::{checksum, SequenceNumber, TransactionId};
use crate::error::{DbError, Result};

/// Kind of a WAL record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalEntryType {
    /// Transaction begin marker.
    Begin,
    /// Buffered changes of one participant, written before its prepare.
    Data,
    /// Durable commit point; all prior Data entries of the transaction
    /// are replayable once this record is on stable storage.
    Commit,
    /// Transaction rollback marker.
    Rollback,
    /// Checkpoint marker carrying the highest covered sequence number.
    Checkpoint,
}

/// A single write-ahead log record.
///
/// `sequence` and `checksum` are assigned by the manager when the entry is
/// written; constructors leave them zeroed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    pub sequence: SequenceNumber,
    pub txn_id: TransactionId,
    pub timestamp: SystemTime,
    pub entry_type: WalEntryType,
    pub collection: Option<String>,
    pub operation: Option<String>,
    pub payload: Vec<u8>,
    pub checksum: u32,
}

impl WalEntry {
    /// Creates an unsealed entry; the sequence number and checksum are
    /// filled in by the manager on write.
    pub fn new(
        txn_id: TransactionId,
        entry_type: WalEntryType,
        collection: Option<String>,
        operation: Option<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            sequence: 0,
            txn_id,
            timestamp: SystemTime::now(),
            entry_type,
            collection,
            operation,
            payload,
            checksum: 0,
        }
    }

    /// Begin marker for a transaction.
    pub fn begin(txn_id: TransactionId) -> Self {
        Self::new(txn_id, WalEntryType::Begin, None, None, Vec::new())
    }

    /// Commit marker for a transaction.
    pub fn commit(txn_id: TransactionId) -> Self {
        Self::new(txn_id, WalEntryType::Commit, None, None, Vec::new())
    }

    /// Rollback marker for a transaction.
    pub fn rollback(txn_id: TransactionId) -> Self {
        Self::new(txn_id, WalEntryType::Rollback, None, None, Vec::new())
    }

    /// Assigns the sequence number and computes the checksum over the
    /// immutable fields.
    pub fn seal(mut self, sequence: SequenceNumber) -> Result<Self> {
        self.sequence = sequence;
        self.checksum = self.compute_checksum()?;
        Ok(self)
    }

    /// Checksum over every field except the checksum itself.
    pub fn compute_checksum(&self) -> Result<u32> {
        let mut probe = self.clone();
        probe.checksum = 0;
        let bytes = bincode::serialize(&probe)
            .map_err(|e| DbError::Serialization(format!("WAL entry checksum input: {}", e)))?;
        Ok(checksum(&bytes))
    }

    /// Verifies the stored checksum against a recomputation.
    pub fn verify_checksum(&self) -> Result<bool> {
        Ok(self.checksum == self.compute_checksum()?)
    }

    /// True for Commit and Rollback markers.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.entry_type,
            WalEntryType::Commit | WalEntryType::Rollback
        )
    }
}

/// Checkpoint marker recorded in the WAL; entries with a sequence number
/// at or below `last_sequence` are safe to truncate once retention allows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub checkpoint_id: Uuid,
    pub last_sequence: SequenceNumber,
    pub timestamp: SystemTime,
}

impl Checkpoint {
    pub fn new(last_sequence: SequenceNumber) -> Self {
        Self {
            checkpoint_id: Uuid::new_v4(),
            last_sequence,
            timestamp: SystemTime::now(),
        }
    }
}
