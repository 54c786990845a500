// Transaction-specific error types.

use thiserror::Error;

use crate::common::TransactionId;
use crate::error::DbError;

use super::types::TransactionState;

pub type TransactionResult<T> = std::result::Result<T, TransactionError>;

#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("transaction {0} not found")]
    NotFound(TransactionId),

    #[error("transaction {0} already exists")]
    AlreadyExists(TransactionId),

    #[error("invalid state transition {from} -> {to} for transaction {txn_id}")]
    InvalidTransition {
        txn_id: TransactionId,
        from: TransactionState,
        to: TransactionState,
    },

    #[error("transaction {txn_id} timed out after {elapsed_ms} ms (timeout {timeout_ms} ms)")]
    Timeout {
        txn_id: TransactionId,
        elapsed_ms: u64,
        timeout_ms: u64,
    },

    #[error("participant {participant} rejected prepare for transaction {txn_id}")]
    PrepareFailed {
        txn_id: TransactionId,
        participant: String,
    },

    #[error("participant {participant} failed to finalize transaction {txn_id}: {reason}")]
    FinalizeFailed {
        txn_id: TransactionId,
        participant: String,
        reason: String,
    },

    #[error("rollback of transaction {txn_id} reported errors: {reason}")]
    RollbackFailed {
        txn_id: TransactionId,
        reason: String,
    },

    #[error("write-ahead log failure: {0}")]
    Wal(String),
}

impl From<TransactionError> for DbError {
    fn from(err: TransactionError) -> Self {
        match err {
            TransactionError::Timeout { .. } => DbError::Timeout(err.to_string()),
            TransactionError::PrepareFailed { .. } => DbError::Constraint(err.to_string()),
            other => DbError::Transaction(other.to_string()),
        }
    }
}
