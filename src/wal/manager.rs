// WAL manager.
//
// Owns sequence-number assignment (the serialization point for all log
// writes), flush policy, checkpointing, truncation, and recovery of
// committed transactions.
//
// # Key Concepts
//
// - **Force-at-Commit**: with `SyncMode::Always` the log is flushed to
//   stable storage whenever a terminal record is written.
// - **Valid prefix**: reads stop at the first checksum mismatch or
//   sequence gap; everything before it is trustworthy.
// - **Poisoning**: a failed append leaves the log indeterminate until a
//   successful `recover` resets it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use super::backend::{FileWalBackend, MemoryWalBackend, WalBackend};
use super::entry::{Checkpoint, WalEntry, WalEntryType};
use crate::common::{SequenceNumber, TransactionId};
use crate::error::{DbError, Result};

/// When the manager forces buffered entries to stable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Flush whenever a Commit, Rollback, or Checkpoint record is written.
    Always,
    /// Flush from the background ticker only.
    Periodic,
    /// Never flush implicitly (tests only).
    Never,
}

/// WAL configuration.
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Log file path (file backend only).
    pub path: PathBuf,
    /// Whether the WAL is written at all.
    pub enabled: bool,
    /// Whether committed transactions are replayed on startup.
    pub auto_recovery: bool,
    /// Background flush interval for `SyncMode::Periodic`.
    pub flush_interval: Duration,
    /// Flush policy.
    pub sync_mode: SyncMode,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./wal/docstore.wal"),
            enabled: true,
            auto_recovery: true,
            flush_interval: Duration::from_millis(50),
            sync_mode: SyncMode::Always,
        }
    }
}

/// Operational counters.
#[derive(Debug, Clone, Default)]
pub struct WalStats {
    pub entries_written: u64,
    pub bytes_written: u64,
    pub flushes: u64,
    pub checkpoints: u64,
    pub truncations: u64,
}

/// One committed transaction reconstructed during recovery, with its Data
/// entries in append order.
#[derive(Debug, Clone)]
pub struct RecoveredTransaction {
    pub txn_id: TransactionId,
    pub data_entries: Vec<WalEntry>,
}

/// Result of a recovery scan.
#[derive(Debug, Clone)]
pub struct RecoveryReport {
    /// Transactions whose final record is Commit, in commit order.
    pub committed: Vec<RecoveredTransaction>,
    /// Transactions that ended in Rollback.
    pub rolled_back: usize,
    /// Transactions with no terminal record (crash mid-flight).
    pub incomplete: usize,
    /// Highest valid sequence number seen.
    pub last_sequence: SequenceNumber,
    /// Set when the scan stopped early at a corrupt record; the report
    /// still covers the valid prefix.
    pub corruption: Option<String>,
}

type RetentionGuard = Box<dyn Fn() -> Option<SequenceNumber> + Send + Sync>;

/// Write-ahead log manager.
pub struct WalManager {
    backend: Arc<dyn WalBackend>,
    /// Next sequence number to assign. Appends happen under this lock so
    /// assignment order and file order cannot diverge.
    next_sequence: Mutex<SequenceNumber>,
    poisoned: AtomicBool,
    sync_mode: SyncMode,
    flush_interval: Duration,
    stats: RwLock<WalStats>,
    /// Reports the lowest sequence number still needed by an active
    /// transaction; truncation past it is rejected.
    retention_guard: RwLock<Option<RetentionGuard>>,
    shutdown: Arc<AtomicBool>,
}

impl WalManager {
    /// Opens a manager over an explicit backend, scanning existing
    /// entries to resume the sequence counter.
    pub fn with_backend(backend: Arc<dyn WalBackend>, config: &WalConfig) -> Result<Self> {
        let existing = backend.read_all()?;
        let next = existing.last().map(|e| e.sequence + 1).unwrap_or(1);
        Ok(Self {
            backend,
            next_sequence: Mutex::new(next),
            poisoned: AtomicBool::new(false),
            sync_mode: config.sync_mode,
            flush_interval: config.flush_interval,
            stats: RwLock::new(WalStats::default()),
            retention_guard: RwLock::new(None),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Opens a durable file-backed manager at `config.path`.
    pub fn open(config: &WalConfig) -> Result<Self> {
        let backend = Arc::new(FileWalBackend::open(&config.path)?);
        Self::with_backend(backend, config)
    }

    /// In-memory manager for tests and ephemeral stores.
    pub fn in_memory() -> Self {
        Self {
            backend: Arc::new(MemoryWalBackend::new()),
            next_sequence: Mutex::new(1),
            poisoned: AtomicBool::new(false),
            sync_mode: SyncMode::Never,
            flush_interval: Duration::from_millis(50),
            stats: RwLock::new(WalStats::default()),
            retention_guard: RwLock::new(None),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Registers the callback consulted by `truncate`.
    pub fn set_retention_guard(
        &self,
        guard: impl Fn() -> Option<SequenceNumber> + Send + Sync + 'static,
    ) {
        *self.retention_guard.write() = Some(Box::new(guard));
    }

    /// Appends an entry, assigning the next sequence number and checksum.
    ///
    /// Terminal records are flushed immediately under `SyncMode::Always`.
    pub fn write_entry(&self, entry: WalEntry) -> Result<SequenceNumber> {
        if self.poisoned.load(Ordering::SeqCst) {
            return Err(DbError::InvalidState(
                "write-ahead log is indeterminate; run recover() first".to_string(),
            ));
        }

        let sealed = {
            let mut next = self.next_sequence.lock();
            let sealed = entry.seal(*next)?;
            if let Err(e) = self.backend.append(&sealed) {
                self.poisoned.store(true, Ordering::SeqCst);
                return Err(e);
            }
            *next += 1;
            sealed
        };

        {
            let mut stats = self.stats.write();
            stats.entries_written += 1;
            stats.bytes_written += sealed.payload.len() as u64;
        }

        if self.sync_mode == SyncMode::Always
            && matches!(
                sealed.entry_type,
                WalEntryType::Commit | WalEntryType::Rollback | WalEntryType::Checkpoint
            )
        {
            self.flush()?;
        }

        Ok(sealed.sequence)
    }

    /// Forces all buffered entries to stable storage.
    pub fn flush(&self) -> Result<()> {
        if let Err(e) = self.backend.flush() {
            self.poisoned.store(true, Ordering::SeqCst);
            return Err(e);
        }
        self.stats.write().flushes += 1;
        Ok(())
    }

    /// Reads entries with sequence >= `from` (all entries when `None`).
    ///
    /// A checksum mismatch or sequence gap is reported as corruption.
    pub fn read_entries(&self, from: Option<SequenceNumber>) -> Result<Vec<WalEntry>> {
        let (prefix, corruption) = self.scan_valid_prefix()?;
        if let Some(reason) = corruption {
            return Err(DbError::Corruption(reason));
        }
        let from = from.unwrap_or(0);
        Ok(prefix
            .into_iter()
            .filter(|e| e.sequence >= from)
            .collect())
    }

    /// Records a Checkpoint entry covering the current maximum sequence
    /// number and flushes it.
    pub fn create_checkpoint(&self) -> Result<Checkpoint> {
        let checkpoint = Checkpoint::new(self.current_sequence());
        let payload = bincode::serialize(&checkpoint)
            .map_err(|e| DbError::Serialization(format!("checkpoint encode: {}", e)))?;
        let entry = WalEntry::new(
            Uuid::nil(),
            WalEntryType::Checkpoint,
            None,
            Some("checkpoint".to_string()),
            payload,
        );
        self.write_entry(entry)?;
        self.flush()?;
        self.stats.write().checkpoints += 1;
        Ok(checkpoint)
    }

    /// Removes entries with sequence < `before_seq`.
    ///
    /// Rejected while any active transaction still requires a covered
    /// entry, and refused outright on a corrupt log.
    pub fn truncate(&self, before_seq: SequenceNumber) -> Result<()> {
        if let Some(guard) = self.retention_guard.read().as_ref() {
            if let Some(floor) = guard() {
                if floor < before_seq {
                    return Err(DbError::InvalidOperation(format!(
                        "cannot truncate before sequence {}: active transaction still requires sequence {}",
                        before_seq, floor
                    )));
                }
            }
        }

        let (prefix, corruption) = self.scan_valid_prefix()?;
        if let Some(reason) = corruption {
            return Err(DbError::Corruption(reason));
        }

        let retained: Vec<WalEntry> = prefix
            .into_iter()
            .filter(|e| e.sequence >= before_seq)
            .collect();
        self.backend.rewrite(&retained)?;
        self.stats.write().truncations += 1;
        tracing::info!(before_seq, retained = retained.len(), "WAL truncated");
        Ok(())
    }

    /// Scans the log and reconstructs committed transactions.
    ///
    /// Data entries whose transaction never reached Commit are discarded.
    /// The scan is read-only and therefore idempotent; on success it also
    /// clears the poisoned flag and resyncs the sequence counter.
    pub fn recover(&self) -> Result<RecoveryReport> {
        let (prefix, corruption) = self.scan_valid_prefix()?;

        struct TxScan {
            data: Vec<WalEntry>,
            terminal: Option<WalEntryType>,
        }

        let mut transactions: HashMap<TransactionId, TxScan> = HashMap::new();
        let mut order: Vec<TransactionId> = Vec::new();

        for entry in &prefix {
            match entry.entry_type {
                WalEntryType::Checkpoint => continue,
                WalEntryType::Begin => {
                    if !transactions.contains_key(&entry.txn_id) {
                        order.push(entry.txn_id);
                        transactions.insert(
                            entry.txn_id,
                            TxScan {
                                data: Vec::new(),
                                terminal: None,
                            },
                        );
                    }
                }
                WalEntryType::Data => {
                    let scan = transactions.entry(entry.txn_id).or_insert_with(|| {
                        order.push(entry.txn_id);
                        TxScan {
                            data: Vec::new(),
                            terminal: None,
                        }
                    });
                    scan.data.push(entry.clone());
                }
                WalEntryType::Commit | WalEntryType::Rollback => {
                    let scan = transactions.entry(entry.txn_id).or_insert_with(|| {
                        order.push(entry.txn_id);
                        TxScan {
                            data: Vec::new(),
                            terminal: None,
                        }
                    });
                    scan.terminal = Some(entry.entry_type);
                }
            }
        }

        let mut committed = Vec::new();
        let mut rolled_back = 0;
        let mut incomplete = 0;
        for txn_id in order {
            let scan = &transactions[&txn_id];
            match scan.terminal {
                Some(WalEntryType::Commit) => committed.push(RecoveredTransaction {
                    txn_id,
                    data_entries: scan.data.clone(),
                }),
                Some(WalEntryType::Rollback) => rolled_back += 1,
                _ => incomplete += 1,
            }
        }

        let last_sequence = prefix.last().map(|e| e.sequence).unwrap_or(0);
        *self.next_sequence.lock() = last_sequence + 1;
        self.poisoned.store(false, Ordering::SeqCst);

        if let Some(reason) = &corruption {
            tracing::error!(reason = %reason, "WAL recovery stopped at corrupt record");
        }

        Ok(RecoveryReport {
            committed,
            rolled_back,
            incomplete,
            last_sequence,
            corruption,
        })
    }

    /// Highest sequence number assigned so far (0 before the first write).
    pub fn current_sequence(&self) -> SequenceNumber {
        *self.next_sequence.lock() - 1
    }

    /// True after a failed append until `recover` succeeds.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> WalStats {
        self.stats.read().clone()
    }

    /// Spawns the periodic flush ticker used with `SyncMode::Periodic`.
    pub fn start_background_flush(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.flush_interval);
            while !manager.shutdown.load(Ordering::SeqCst) {
                ticker.tick().await;
                if let Err(e) = manager.flush() {
                    tracing::error!(error = %e, "background WAL flush failed");
                }
            }
        })
    }

    /// Stops the background flusher and forces a final flush.
    pub fn shutdown(&self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        self.flush()
    }

    /// Entries in append order up to the first invalid record, plus the
    /// reason the scan stopped (if it did).
    fn scan_valid_prefix(&self) -> Result<(Vec<WalEntry>, Option<String>)> {
        let raw = self.backend.read_all()?;
        let mut valid = Vec::with_capacity(raw.len());
        let mut previous: Option<SequenceNumber> = None;

        for entry in raw {
            if !entry.verify_checksum()? {
                return Ok((
                    valid,
                    Some(format!("checksum mismatch at sequence {}", entry.sequence)),
                ));
            }
            if let Some(prev) = previous {
                if entry.sequence != prev + 1 {
                    return Ok((
                        valid,
                        Some(format!(
                            "sequence gap: {} followed by {}",
                            prev, entry.sequence
                        )),
                    ));
                }
            }
            previous = Some(entry.sequence);
            valid.push(entry);
        }

        Ok((valid, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn data_entry(txn: TransactionId, payload: Vec<u8>) -> WalEntry {
        WalEntry::new(
            txn,
            WalEntryType::Data,
            Some("users".to_string()),
            Some("create".to_string()),
            payload,
        )
    }

    #[test]
    fn test_sequences_are_strictly_increasing() {
        let wal = WalManager::in_memory();
        let txn = Uuid::new_v4();
        let s1 = wal.write_entry(WalEntry::begin(txn)).unwrap();
        let s2 = wal.write_entry(data_entry(txn, vec![1])).unwrap();
        let s3 = wal.write_entry(WalEntry::commit(txn)).unwrap();
        assert_eq!((s1, s2, s3), (1, 2, 3));
        assert_eq!(wal.current_sequence(), 3);
    }

    #[test]
    fn test_read_entries_from() {
        let wal = WalManager::in_memory();
        let txn = Uuid::new_v4();
        for _ in 0..5 {
            wal.write_entry(data_entry(txn, vec![0])).unwrap();
        }
        let tail = wal.read_entries(Some(4)).unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].sequence, 4);
    }

    #[test]
    fn test_recover_classifies_transactions() {
        let wal = WalManager::in_memory();

        let committed = Uuid::new_v4();
        wal.write_entry(WalEntry::begin(committed)).unwrap();
        wal.write_entry(data_entry(committed, vec![1])).unwrap();
        wal.write_entry(WalEntry::commit(committed)).unwrap();

        let rolled_back = Uuid::new_v4();
        wal.write_entry(WalEntry::begin(rolled_back)).unwrap();
        wal.write_entry(data_entry(rolled_back, vec![2])).unwrap();
        wal.write_entry(WalEntry::rollback(rolled_back)).unwrap();

        let incomplete = Uuid::new_v4();
        wal.write_entry(WalEntry::begin(incomplete)).unwrap();
        wal.write_entry(data_entry(incomplete, vec![3])).unwrap();

        let report = wal.recover().unwrap();
        assert_eq!(report.committed.len(), 1);
        assert_eq!(report.committed[0].txn_id, committed);
        assert_eq!(report.committed[0].data_entries.len(), 1);
        assert_eq!(report.rolled_back, 1);
        assert_eq!(report.incomplete, 1);
        assert!(report.corruption.is_none());

        // Recovery is idempotent.
        let again = wal.recover().unwrap();
        assert_eq!(again.committed.len(), 1);
    }

    #[test]
    fn test_corrupt_entry_stops_read() {
        let backend = Arc::new(MemoryWalBackend::new());
        let wal = WalManager::with_backend(backend.clone(), &WalConfig::default()).unwrap();
        let txn = Uuid::new_v4();
        wal.write_entry(WalEntry::begin(txn)).unwrap();
        wal.write_entry(data_entry(txn, vec![1])).unwrap();
        wal.write_entry(WalEntry::commit(txn)).unwrap();

        // Flip a payload byte behind the manager's back.
        let mut entries = backend.read_all().unwrap();
        entries[1].payload = vec![0xFF];
        backend.rewrite(&entries).unwrap();

        assert!(matches!(
            wal.read_entries(None),
            Err(DbError::Corruption(_))
        ));

        // Recovery reports the corruption but still yields the prefix.
        let report = wal.recover().unwrap();
        assert!(report.corruption.is_some());
        assert_eq!(report.last_sequence, 1);
    }

    #[test]
    fn test_sequence_gap_is_corruption() {
        let backend = Arc::new(MemoryWalBackend::new());
        let wal = WalManager::with_backend(backend.clone(), &WalConfig::default()).unwrap();
        let txn = Uuid::new_v4();
        for _ in 0..3 {
            wal.write_entry(data_entry(txn, vec![0])).unwrap();
        }

        let entries = backend.read_all().unwrap();
        let gapped = vec![entries[0].clone(), entries[2].clone()];
        backend.rewrite(&gapped).unwrap();

        assert!(matches!(
            wal.read_entries(None),
            Err(DbError::Corruption(_))
        ));
    }

    #[test]
    fn test_checkpoint_records_current_sequence() {
        let wal = WalManager::in_memory();
        let txn = Uuid::new_v4();
        wal.write_entry(data_entry(txn, vec![1])).unwrap();
        wal.write_entry(data_entry(txn, vec![2])).unwrap();

        let checkpoint = wal.create_checkpoint().unwrap();
        assert_eq!(checkpoint.last_sequence, 2);

        let entries = wal.read_entries(None).unwrap();
        assert_eq!(entries.last().unwrap().entry_type, WalEntryType::Checkpoint);
    }

    #[test]
    fn test_truncate_respects_retention_guard() {
        let wal = WalManager::in_memory();
        let txn = Uuid::new_v4();
        for _ in 0..4 {
            wal.write_entry(data_entry(txn, vec![0])).unwrap();
        }

        wal.set_retention_guard(|| Some(2));
        assert!(wal.truncate(3).is_err());

        wal.set_retention_guard(|| None);
        wal.truncate(3).unwrap();
        let entries = wal.read_entries(None).unwrap();
        assert_eq!(entries.first().unwrap().sequence, 3);
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn test_sequence_resumes_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = WalConfig {
            path: dir.path().join("resume.wal"),
            ..WalConfig::default()
        };

        {
            let wal = WalManager::open(&config).unwrap();
            let txn = Uuid::new_v4();
            wal.write_entry(WalEntry::begin(txn)).unwrap();
            wal.write_entry(WalEntry::commit(txn)).unwrap();
        }

        let reopened = WalManager::open(&config).unwrap();
        assert_eq!(reopened.current_sequence(), 2);
        let txn = Uuid::new_v4();
        assert_eq!(reopened.write_entry(WalEntry::begin(txn)).unwrap(), 3);
    }
}
