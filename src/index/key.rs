// Index key values.
//
// A sum type over the scalar and composite shapes an index key can take.
// Floats are stored by bit pattern so keys stay `Eq`/`Ord`/`Hash`.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Index key value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IndexKey {
    /// Null or missing value (stored only by non-sparse indexes).
    Null,
    /// Boolean value.
    Bool(bool),
    /// Integer value.
    Int(i64),
    /// Float value (stored as bits).
    Float(u64),
    /// String value.
    Str(String),
    /// Composite key built from multiple fields.
    Composite(Vec<IndexKey>),
}

impl IndexKey {
    /// Builds an index key from a JSON value. Objects and arrays have no
    /// key representation and map to `Null`.
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::String(s) => IndexKey::Str(s.clone()),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    IndexKey::Int(i)
                } else if let Some(f) = n.as_f64() {
                    IndexKey::Float(f.to_bits())
                } else {
                    IndexKey::Null
                }
            }
            serde_json::Value::Bool(b) => IndexKey::Bool(*b),
            _ => IndexKey::Null,
        }
    }

    /// Float constructor preserving ordering-by-bits storage.
    pub fn float(value: f64) -> Self {
        IndexKey::Float(value.to_bits())
    }

    pub fn composite(parts: Vec<IndexKey>) -> Self {
        IndexKey::Composite(parts)
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, IndexKey::Null)
            || matches!(self, IndexKey::Composite(parts) if parts.iter().any(|p| p.is_null()))
    }
}

impl fmt::Display for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexKey::Null => write!(f, "null"),
            IndexKey::Bool(b) => write!(f, "{}", b),
            IndexKey::Int(i) => write!(f, "{}", i),
            IndexKey::Float(bits) => write!(f, "{}", f64::from_bits(*bits)),
            IndexKey::Str(s) => write!(f, "{}", s),
            IndexKey::Composite(parts) => {
                let rendered: Vec<String> = parts.iter().map(|p| p.to_string()).collect();
                write!(f, "[{}]", rendered.join(", "))
            }
        }
    }
}

impl From<&str> for IndexKey {
    fn from(value: &str) -> Self {
        IndexKey::Str(value.to_string())
    }
}

impl From<String> for IndexKey {
    fn from(value: String) -> Self {
        IndexKey::Str(value)
    }
}

impl From<i64> for IndexKey {
    fn from(value: i64) -> Self {
        IndexKey::Int(value)
    }
}
