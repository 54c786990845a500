// Storage-layer change records.
//
// Every mutation inside a transaction is buffered as one record; the
// ordered list is what 2PC applies at finalize and what change listeners
// receive after commit.

use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::common::PrimaryKey;

/// Kind of a buffered storage mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// One buffered storage mutation, ordered by insertion into the
/// transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub kind: ChangeKind,
    pub id: PrimaryKey,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
    pub timestamp: SystemTime,
}

impl ChangeRecord {
    pub fn insert(id: PrimaryKey, new_value: Value) -> Self {
        Self {
            kind: ChangeKind::Insert,
            id,
            old_value: None,
            new_value: Some(new_value),
            timestamp: SystemTime::now(),
        }
    }

    pub fn update(id: PrimaryKey, old_value: Value, new_value: Value) -> Self {
        Self {
            kind: ChangeKind::Update,
            id,
            old_value: Some(old_value),
            new_value: Some(new_value),
            timestamp: SystemTime::now(),
        }
    }

    pub fn delete(id: PrimaryKey, old_value: Value) -> Self {
        Self {
            kind: ChangeKind::Delete,
            id,
            old_value: Some(old_value),
            new_value: None,
            timestamp: SystemTime::now(),
        }
    }
}
