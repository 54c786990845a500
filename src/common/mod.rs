// # Common Types
//
// Shared identifiers and helpers used across all store modules.
//
// - **TransactionId**: UUID v4, generated at `begin`.
// - **PrimaryKey**: the typed document identifier (integer, string, or
//   composite), totally ordered so it can live in index trees.
// - **SequenceNumber / Term / LogIndex / NodeId**: plain aliases shared by
//   the WAL and Raft layers.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique transaction identifier.
pub type TransactionId = Uuid;

/// Monotonic sequence number assigned by the write-ahead log.
pub type SequenceNumber = u64;

/// Raft term number (logical clock).
pub type Term = u64;

/// Raft log index.
pub type LogIndex = u64;

/// Cluster node identifier ("node-1" style).
pub type NodeId = String;

/// Generates a fresh transaction identifier.
pub fn new_transaction_id() -> TransactionId {
    Uuid::new_v4()
}

/// CRC32 checksum over a byte slice.
///
/// The store uses a single stable checksum function for WAL records and
/// Raft log entries so that mixed-version log files stay verifiable.
#[inline]
pub fn checksum(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Milliseconds since the Unix epoch, saturating at zero for clocks set
/// before 1970.
pub fn unix_millis(ts: SystemTime) -> u64 {
    ts.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Typed primary identifier of a document.
///
/// Each collection picks one identifier shape; composite keys compare
/// element-wise in declaration order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PrimaryKey {
    /// Integer identifier.
    Int(i64),
    /// String identifier.
    Str(String),
    /// Composite identifier built from multiple fields.
    Composite(Vec<PrimaryKey>),
}

impl PrimaryKey {
    /// Builds a primary key from a JSON value, if the value has a
    /// supported identifier shape.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Number(n) => n.as_i64().map(PrimaryKey::Int),
            serde_json::Value::String(s) => Some(PrimaryKey::Str(s.clone())),
            serde_json::Value::Array(items) => {
                let parts: Option<Vec<PrimaryKey>> = items.iter().map(Self::from_json).collect();
                parts.map(PrimaryKey::Composite)
            }
            _ => None,
        }
    }

    /// JSON representation of this key, used when writing the identifier
    /// back into a document.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            PrimaryKey::Int(i) => serde_json::Value::from(*i),
            PrimaryKey::Str(s) => serde_json::Value::from(s.clone()),
            PrimaryKey::Composite(parts) => {
                serde_json::Value::Array(parts.iter().map(|p| p.to_json()).collect())
            }
        }
    }
}

impl fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrimaryKey::Int(i) => write!(f, "{}", i),
            PrimaryKey::Str(s) => write!(f, "{}", s),
            PrimaryKey::Composite(parts) => {
                let rendered: Vec<String> = parts.iter().map(|p| p.to_string()).collect();
                write!(f, "[{}]", rendered.join(","))
            }
        }
    }
}

impl From<i64> for PrimaryKey {
    fn from(value: i64) -> Self {
        PrimaryKey::Int(value)
    }
}

impl From<&str> for PrimaryKey {
    fn from(value: &str) -> Self {
        PrimaryKey::Str(value.to_string())
    }
}

impl From<String> for PrimaryKey {
    fn from(value: String) -> Self {
        PrimaryKey::Str(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_primary_key_from_json() {
        assert_eq!(PrimaryKey::from_json(&json!(7)), Some(PrimaryKey::Int(7)));
        assert_eq!(
            PrimaryKey::from_json(&json!("user-1")),
            Some(PrimaryKey::Str("user-1".to_string()))
        );
        assert_eq!(PrimaryKey::from_json(&json!(null)), None);
        assert_eq!(
            PrimaryKey::from_json(&json!([1, "a"])),
            Some(PrimaryKey::Composite(vec![
                PrimaryKey::Int(1),
                PrimaryKey::Str("a".to_string())
            ]))
        );
    }

    #[test]
    fn test_primary_key_ordering() {
        let mut keys = vec![
            PrimaryKey::Int(3),
            PrimaryKey::Int(1),
            PrimaryKey::Int(2),
        ];
        keys.sort();
        assert_eq!(
            keys,
            vec![PrimaryKey::Int(1), PrimaryKey::Int(2), PrimaryKey::Int(3)]
        );
    }

    #[test]
    fn test_checksum_stability() {
        let a = checksum(b"hello");
        let b = checksum(b"hello");
        let c = checksum(b"hellp");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
