// Transaction Management
//
// Multi-resource atomic commits over a two-phase commit protocol, with an
// optional write-ahead-log layer for durability and crash recovery.
//
// # Module Organization
//
// | Module | Responsibility |
// |--------|----------------|
// | [`types`] | `Transaction`, `TransactionState`, `IsolationLevel` |
// | [`error`] | Transaction-specific error types |
// | [`participant`] | The 2PC participant trait |
// | [`manager`] | Lifecycle, 2PC orchestration, listeners, timeout sweep |
// | [`wal_manager`] | Begin/Data/Commit/Rollback WAL records + recovery |

pub mod error;
pub mod manager;
pub mod participant;
pub mod types;
pub mod wal_manager;

pub use error::{TransactionError, TransactionResult};
pub use manager::{ListenerHandle, TransactionManager};
pub use participant::TransactionParticipant;
pub use types::{IsolationLevel, Transaction, TransactionOptions, TransactionState};
pub use wal_manager::{
    AdapterParticipant, ReplayKind, ReplayOperation, WalParticipant, WalTransactionManager,
};
