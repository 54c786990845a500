// Raft log manager.
//
// Persists the replicated log through the write-ahead log: every append,
// truncation, and compaction becomes a WAL Data record tagged with the
// `_raft` collection, and metadata (commit index, snapshot point, hard
// state) rides alongside. Recovery replays the records in order to
// rebuild the in-memory suffix.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::common::{LogIndex, NodeId, Term};
use crate::error::{DbError, Result};
use crate::wal::{WalEntry, WalEntryType, WalManager};

use super::types::RaftLogEntry;

const RAFT_COLLECTION: &str = "_raft";
const OP_ENTRY: &str = "entry";
const OP_TRUNCATE: &str = "truncate";
const OP_COMPACT: &str = "compact";
const OP_META: &str = "meta";

/// Metadata persisted alongside the log entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RaftLogMeta {
    commit_index: LogIndex,
    snapshot_index: LogIndex,
    snapshot_term: Term,
    current_term: Term,
    voted_for: Option<NodeId>,
}

/// WAL-backed Raft log with snapshot-aware addressing.
pub struct RaftLogManager {
    wal: Arc<WalManager>,
    /// In-memory entries after the snapshot point, ascending by index.
    entries: RwLock<Vec<RaftLogEntry>>,
    commit_index: AtomicU64,
    snapshot_index: AtomicU64,
    snapshot_term: AtomicU64,
    /// (current_term, voted_for) persisted before any RPC acknowledgment.
    hard_state: RwLock<(Term, Option<NodeId>)>,
}

impl RaftLogManager {
    pub fn new(wal: Arc<WalManager>) -> Self {
        Self {
            wal,
            entries: RwLock::new(Vec::new()),
            commit_index: AtomicU64::new(0),
            snapshot_index: AtomicU64::new(0),
            snapshot_term: AtomicU64::new(0),
            hard_state: RwLock::new((0, None)),
        }
    }

    /// Appends contiguous entries and persists each as a WAL record.
    pub fn append(&self, new_entries: Vec<RaftLogEntry>) -> Result<()> {
        if new_entries.is_empty() {
            return Ok(());
        }
        let mut entries = self.entries.write();
        for entry in new_entries {
            let expected = entries
                .last()
                .map(|e| e.index + 1)
                .unwrap_or_else(|| self.snapshot_index.load(Ordering::SeqCst) + 1);
            if entry.index != expected {
                return Err(DbError::Replication(format!(
                    "non-contiguous raft append: expected index {}, got {}",
                    expected, entry.index
                )));
            }
            let payload = bincode::serialize(&entry)
                .map_err(|e| DbError::Serialization(format!("raft entry encode: {}", e)))?;
            self.wal.write_entry(WalEntry::new(
                Uuid::nil(),
                WalEntryType::Data,
                Some(RAFT_COLLECTION.to_string()),
                Some(OP_ENTRY.to_string()),
                payload,
            ))?;
            entries.push(entry);
        }
        Ok(())
    }

    /// Drops every entry with index >= `index` (conflict resolution).
    pub fn truncate_from(&self, index: LogIndex) -> Result<()> {
        {
            let mut entries = self.entries.write();
            entries.retain(|e| e.index < index);
        }
        let payload = bincode::serialize(&index)
            .map_err(|e| DbError::Serialization(format!("raft truncate encode: {}", e)))?;
        self.wal.write_entry(WalEntry::new(
            Uuid::nil(),
            WalEntryType::Data,
            Some(RAFT_COLLECTION.to_string()),
            Some(OP_TRUNCATE.to_string()),
            payload,
        ))?;
        Ok(())
    }

    /// Entry at `index`; `None` for index 0, entries covered by the
    /// snapshot, or beyond the end.
    pub fn entry(&self, index: LogIndex) -> Option<RaftLogEntry> {
        if index == 0 || index <= self.snapshot_index.load(Ordering::SeqCst) {
            return None;
        }
        let entries = self.entries.read();
        let offset = (index - self.snapshot_index.load(Ordering::SeqCst) - 1) as usize;
        entries.get(offset).cloned()
    }

    /// Entries in `[start, end)`.
    pub fn entries_in(&self, start: LogIndex, end: LogIndex) -> Vec<RaftLogEntry> {
        let entries = self.entries.read();
        entries
            .iter()
            .filter(|e| e.index >= start && e.index < end)
            .cloned()
            .collect()
    }

    /// Up to `max` entries starting at `start`.
    pub fn entries_from(&self, start: LogIndex, max: usize) -> Vec<RaftLogEntry> {
        let entries = self.entries.read();
        entries
            .iter()
            .filter(|e| e.index >= start)
            .take(max)
            .cloned()
            .collect()
    }

    pub fn last_index(&self) -> LogIndex {
        self.entries
            .read()
            .last()
            .map(|e| e.index)
            .unwrap_or_else(|| self.snapshot_index.load(Ordering::SeqCst))
    }

    pub fn last_term(&self) -> Term {
        self.entries
            .read()
            .last()
            .map(|e| e.term)
            .unwrap_or_else(|| self.snapshot_term.load(Ordering::SeqCst))
    }

    /// Term of the entry at `index`, answering from the snapshot point
    /// when the entry itself is compacted away.
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == self.snapshot_index.load(Ordering::SeqCst) && index > 0 {
            return Some(self.snapshot_term.load(Ordering::SeqCst));
        }
        self.entry(index).map(|e| e.term)
    }

    pub fn commit_index(&self) -> LogIndex {
        self.commit_index.load(Ordering::SeqCst)
    }

    pub fn set_commit_index(&self, index: LogIndex) {
        self.commit_index.store(index, Ordering::SeqCst);
    }

    pub fn snapshot_index(&self) -> LogIndex {
        self.snapshot_index.load(Ordering::SeqCst)
    }

    pub fn snapshot_term(&self) -> Term {
        self.snapshot_term.load(Ordering::SeqCst)
    }

    /// Number of in-memory entries (compaction trigger input).
    pub fn in_memory_len(&self) -> usize {
        self.entries.read().len()
    }

    /// Moves the snapshot point forward and drops in-memory entries up
    /// to it.
    pub fn compact(&self, last_included_index: LogIndex, last_included_term: Term) -> Result<()> {
        {
            let mut entries = self.entries.write();
            entries.retain(|e| e.index > last_included_index);
        }
        self.snapshot_index
            .store(last_included_index, Ordering::SeqCst);
        self.snapshot_term
            .store(last_included_term, Ordering::SeqCst);

        let payload = bincode::serialize(&(last_included_index, last_included_term))
            .map_err(|e| DbError::Serialization(format!("raft compact encode: {}", e)))?;
        self.wal.write_entry(WalEntry::new(
            Uuid::nil(),
            WalEntryType::Data,
            Some(RAFT_COLLECTION.to_string()),
            Some(OP_COMPACT.to_string()),
            payload,
        ))?;
        self.persist()?;
        tracing::info!(
            last_included_index,
            last_included_term,
            "raft log compacted"
        );
        Ok(())
    }

    /// Persists the current metadata and flushes the WAL.
    pub fn persist(&self) -> Result<()> {
        let (current_term, voted_for) = self.hard_state.read().clone();
        let meta = RaftLogMeta {
            commit_index: self.commit_index(),
            snapshot_index: self.snapshot_index(),
            snapshot_term: self.snapshot_term(),
            current_term,
            voted_for,
        };
        let payload = bincode::serialize(&meta)
            .map_err(|e| DbError::Serialization(format!("raft meta encode: {}", e)))?;
        self.wal.write_entry(WalEntry::new(
            Uuid::nil(),
            WalEntryType::Data,
            Some(RAFT_COLLECTION.to_string()),
            Some(OP_META.to_string()),
            payload,
        ))?;
        self.wal.flush()?;
        Ok(())
    }

    /// Updates and persists (currentTerm, votedFor). Called before any
    /// RPC response that depends on them.
    pub fn persist_hard_state(&self, term: Term, voted_for: Option<NodeId>) -> Result<()> {
        *self.hard_state.write() = (term, voted_for);
        self.persist()
    }

    pub fn hard_state(&self) -> (Term, Option<NodeId>) {
        self.hard_state.read().clone()
    }

    /// Rebuilds log state from the WAL. Entry checksums are verified;
    /// a mismatch terminates recovery with a corruption error.
    pub fn recover(&self) -> Result<()> {
        let records = self.wal.read_entries(None)?;

        let mut entries: Vec<RaftLogEntry> = Vec::new();
        let mut commit_index = 0;
        let mut snapshot_index = 0;
        let mut snapshot_term = 0;
        let mut hard_state = (0, None);

        for record in records {
            if record.collection.as_deref() != Some(RAFT_COLLECTION) {
                continue;
            }
            match record.operation.as_deref() {
                Some(OP_ENTRY) => {
                    let entry: RaftLogEntry = bincode::deserialize(&record.payload)
                        .map_err(|e| {
                            DbError::Corruption(format!("raft entry decode: {}", e))
                        })?;
                    if !entry.verify_checksum() {
                        return Err(DbError::Corruption(format!(
                            "raft entry checksum mismatch at index {}",
                            entry.index
                        )));
                    }
                    // A re-appended index overwrites the old suffix.
                    entries.retain(|e| e.index < entry.index);
                    let expected = entries
                        .last()
                        .map(|e| e.index + 1)
                        .unwrap_or(snapshot_index + 1);
                    if entry.index != expected {
                        return Err(DbError::Corruption(format!(
                            "raft log gap: expected index {}, got {}",
                            expected, entry.index
                        )));
                    }
                    entries.push(entry);
                }
                Some(OP_TRUNCATE) => {
                    let from: LogIndex = bincode::deserialize(&record.payload)
                        .map_err(|e| {
                            DbError::Corruption(format!("raft truncate decode: {}", e))
                        })?;
                    entries.retain(|e| e.index < from);
                }
                Some(OP_COMPACT) => {
                    let (index, term): (LogIndex, Term) = bincode::deserialize(&record.payload)
                        .map_err(|e| {
                            DbError::Corruption(format!("raft compact decode: {}", e))
                        })?;
                    entries.retain(|e| e.index > index);
                    snapshot_index = index;
                    snapshot_term = term;
                }
                Some(OP_META) => {
                    let meta: RaftLogMeta = bincode::deserialize(&record.payload)
                        .map_err(|e| DbError::Corruption(format!("raft meta decode: {}", e)))?;
                    commit_index = meta.commit_index;
                    snapshot_index = meta.snapshot_index;
                    snapshot_term = meta.snapshot_term;
                    hard_state = (meta.current_term, meta.voted_for);
                }
                _ => {}
            }
        }

        *self.entries.write() = entries;
        self.commit_index.store(commit_index, Ordering::SeqCst);
        self.snapshot_index.store(snapshot_index, Ordering::SeqCst);
        self.snapshot_term.store(snapshot_term, Ordering::SeqCst);
        *self.hard_state.write() = hard_state;

        tracing::info!(
            last_index = self.last_index(),
            commit_index,
            snapshot_index,
            "raft log recovered"
        );
        Ok(())
    }
}
