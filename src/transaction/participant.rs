// Transaction participant trait.
//
// Any component that buffers changes per transaction and can prepare,
// finalize, or roll them back: storage adapters, index managers, and
// whole collections. Participants are looked up by transaction id; they
// own their buffers, so the manager never holds shared mutable state
// across participants.

use async_trait::async_trait;

use crate::common::TransactionId;
use crate::error::Result;
use crate::storage::ChangeRecord;

#[async_trait]
pub trait TransactionParticipant: Send + Sync {
    /// Stable identifier, used in error reports and the WAL.
    fn participant_id(&self) -> String;

    /// True when the transaction has buffered work here; uninvolved
    /// participants are skipped by the commit protocol.
    fn has_pending(&self, txn_id: TransactionId) -> bool;

    /// Ordered storage-level change records for listener notification.
    fn pending_changes(&self, txn_id: TransactionId) -> Vec<ChangeRecord>;

    /// Phase one: validate buffered changes. `Ok(false)` vetoes the
    /// commit and triggers rollback of the whole transaction.
    async fn prepare_commit(&self, txn_id: TransactionId) -> Result<bool>;

    /// Phase two: apply buffered changes atomically from this
    /// participant's viewpoint.
    async fn finalize_commit(&self, txn_id: TransactionId) -> Result<()>;

    /// Discard buffered changes and prepared status.
    async fn rollback(&self, txn_id: TransactionId) -> Result<()>;
}
