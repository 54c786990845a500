// Core transaction types.
//
// A transaction moves forward only:
//
// ```text
// Active -> Preparing -> Prepared -> Committed
//        \           \_________ -> Aborted
//         \______________________-> Aborted
// ```
//
// Prepared never returns to Active; the only exits are Committed and
// Aborted.

use std::fmt;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::common::TransactionId;

/// Isolation level for transactional reads.
///
/// Both levels currently behave identically: reads observe the
/// committed state plus the transaction's own buffered changes
/// (read-committed with local overlay), for storage and index reads
/// alike. The level is carried on every transaction so callers can
/// request the stronger mode, but it does not yet select distinct
/// storage behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IsolationLevel {
    /// Snapshot reads within the transaction (default).
    SnapshotReads,
    /// Committed state plus the local overlay.
    ReadCommitted,
}

impl Default for IsolationLevel {
    fn default() -> Self {
        IsolationLevel::SnapshotReads
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IsolationLevel::SnapshotReads => write!(f, "SNAPSHOT READS"),
            IsolationLevel::ReadCommitted => write!(f, "READ COMMITTED"),
        }
    }
}

/// Transaction lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionState {
    /// Accepting operations.
    Active,
    /// Two-phase commit: participants are validating.
    Preparing,
    /// Every participant voted yes; waiting for finalize.
    Prepared,
    /// Terminal: all participants applied their changes.
    Committed,
    /// Terminal: changes discarded.
    Aborted,
}

impl TransactionState {
    /// True for Committed and Aborted.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionState::Committed | TransactionState::Aborted
        )
    }

    /// Forward-only transition check.
    pub fn can_transition_to(&self, next: TransactionState) -> bool {
        use TransactionState::*;
        matches!(
            (self, next),
            (Active, Preparing)
                | (Active, Aborted)
                | (Preparing, Prepared)
                | (Preparing, Aborted)
                | (Prepared, Committed)
                | (Prepared, Aborted)
        )
    }
}

impl Default for TransactionState {
    fn default() -> Self {
        TransactionState::Active
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TransactionState::Active => "ACTIVE",
            TransactionState::Preparing => "PREPARING",
            TransactionState::Prepared => "PREPARED",
            TransactionState::Committed => "COMMITTED",
            TransactionState::Aborted => "ABORTED",
        };
        write!(f, "{}", label)
    }
}

/// Per-transaction options.
#[derive(Debug, Clone, Copy)]
pub struct TransactionOptions {
    /// Wall-clock age after which the transaction is aborted.
    pub timeout: Duration,
    pub isolation_level: IsolationLevel,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            isolation_level: IsolationLevel::default(),
        }
    }
}

/// Live transaction tracked by the manager.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub id: TransactionId,
    pub state: TransactionState,
    pub started_at: SystemTime,
    pub options: TransactionOptions,
    /// Participant ids with buffered work, filled in at commit.
    pub participants: Vec<String>,
}

impl Transaction {
    pub fn new(id: TransactionId, options: TransactionOptions) -> Self {
        Self {
            id,
            state: TransactionState::Active,
            started_at: SystemTime::now(),
            options,
            participants: Vec::new(),
        }
    }

    /// Wall-clock age of the transaction.
    pub fn elapsed(&self) -> Duration {
        SystemTime::now()
            .duration_since(self.started_at)
            .unwrap_or(Duration::ZERO)
    }

    /// True once the wall-clock age exceeds the configured timeout.
    pub fn is_expired(&self) -> bool {
        self.elapsed() > self.options.timeout
    }
}
