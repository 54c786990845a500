// Index subsystem.
//
// B+ tree indexes with transaction-isolated mutations. The tree itself is
// transaction-agnostic; `IndexManager` layers per-transaction change
// buffers and two-phase commit on top.
//
// | Module | Responsibility |
// |--------|----------------|
// | [`key`] | `IndexKey` sum type over scalar and composite shapes |
// | [`btree`] | Ordered key -> values tree with range scans |
// | [`manager`] | Per-field transactional wrapper, 2PC participant |

pub mod btree;
pub mod key;
pub mod manager;

pub use btree::BPlusTree;
pub use key::IndexKey;
pub use manager::{IndexChange, IndexChangeKind, IndexManager};
