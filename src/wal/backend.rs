// WAL storage backends.
//
// Two variants behind one interface: a durable file-backed log using
// length-prefixed bincode records, and an in-memory log for tests and
// ephemeral stores. Truncation rewrites the file through a temp file and
// an atomic rename so a crash mid-truncate never loses the suffix.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, RwLock};

use super::entry::WalEntry;
use crate::error::{DbError, Result};

/// Storage backend for the write-ahead log.
pub trait WalBackend: Send + Sync {
    /// Appends one sealed entry. Durability is only guaranteed after
    /// `flush` returns.
    fn append(&self, entry: &WalEntry) -> Result<()>;

    /// Forces buffered entries to stable storage.
    fn flush(&self) -> Result<()>;

    /// Reads every decodable entry in append order. A partial record at
    /// the tail (torn write) ends the scan at the last complete record.
    fn read_all(&self) -> Result<Vec<WalEntry>>;

    /// Atomically replaces the log contents with `entries`.
    fn rewrite(&self, entries: &[WalEntry]) -> Result<()>;
}

/// Durable file-backed log. Records are framed as a little-endian `u32`
/// length followed by the bincode-encoded entry.
pub struct FileWalBackend {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl FileWalBackend {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn encode(entry: &WalEntry) -> Result<Vec<u8>> {
        let body = bincode::serialize(entry)
            .map_err(|e| DbError::Serialization(format!("WAL entry encode: {}", e)))?;
        let mut framed = Vec::with_capacity(body.len() + 4);
        framed.extend_from_slice(&(body.len() as u32).to_le_bytes());
        framed.extend_from_slice(&body);
        Ok(framed)
    }
}

impl WalBackend for FileWalBackend {
    fn append(&self, entry: &WalEntry) -> Result<()> {
        let framed = Self::encode(entry)?;
        let mut writer = self.writer.lock();
        writer.write_all(&framed)?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    fn read_all(&self) -> Result<Vec<WalEntry>> {
        // Hold the writer lock so a concurrent append cannot interleave
        // with the scan, and flush buffered bytes first.
        let mut writer = self.writer.lock();
        writer.flush()?;

        let file = File::open(&self.path)?;
        let mut reader = BufReader::new(file);
        let mut entries = Vec::new();

        loop {
            let mut len_buf = [0u8; 4];
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let len = u32::from_le_bytes(len_buf) as usize;
            let mut body = vec![0u8; len];
            if reader.read_exact(&mut body).is_err() {
                // Torn tail record from a crash mid-write; the prefix up
                // to here is the valid log.
                tracing::warn!(path = %self.path.display(), "truncated record at WAL tail");
                break;
            }
            match bincode::deserialize::<WalEntry>(&body) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    tracing::warn!(
                        path = %self.path.display(),
                        error = %e,
                        "undecodable record at WAL tail"
                    );
                    break;
                }
            }
        }

        Ok(entries)
    }

    fn rewrite(&self, entries: &[WalEntry]) -> Result<()> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));

        let mut writer = self.writer.lock();
        writer.flush()?;

        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        for entry in entries {
            tmp.write_all(&Self::encode(entry)?)?;
        }
        tmp.flush()?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)
            .map_err(|e| DbError::Io(e.error))?;

        let file = OpenOptions::new().append(true).open(&self.path)?;
        *writer = BufWriter::new(file);
        Ok(())
    }
}

/// In-memory log for tests and ephemeral use.
#[derive(Default)]
pub struct MemoryWalBackend {
    entries: RwLock<Vec<WalEntry>>,
}

impl MemoryWalBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WalBackend for MemoryWalBackend {
    fn append(&self, entry: &WalEntry) -> Result<()> {
        self.entries.write().push(entry.clone());
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn read_all(&self) -> Result<Vec<WalEntry>> {
        Ok(self.entries.read().clone())
    }

    fn rewrite(&self, entries: &[WalEntry]) -> Result<()> {
        *self.entries.write() = entries.to_vec();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::entry::WalEntryType;
    use uuid::Uuid;

    fn sealed(seq: u64) -> WalEntry {
        WalEntry::new(
            Uuid::new_v4(),
            WalEntryType::Data,
            Some("users".to_string()),
            None,
            vec![seq as u8],
        )
        .seal(seq)
        .unwrap()
    }

    #[test]
    fn test_file_backend_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileWalBackend::open(dir.path().join("test.wal")).unwrap();

        backend.append(&sealed(1)).unwrap();
        backend.append(&sealed(2)).unwrap();
        backend.flush().unwrap();

        let entries = backend.read_all().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].sequence, 1);
        assert_eq!(entries[1].sequence, 2);
    }

    #[test]
    fn test_file_backend_rewrite_drops_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileWalBackend::open(dir.path().join("test.wal")).unwrap();

        for seq in 1..=4 {
            backend.append(&sealed(seq)).unwrap();
        }
        backend.flush().unwrap();

        let all = backend.read_all().unwrap();
        backend.rewrite(&all[2..]).unwrap();

        let remaining = backend.read_all().unwrap();
        assert_eq!(remaining.len(), 2);
        assert_eq!(remaining[0].sequence, 3);

        // The file stays appendable after the rename.
        backend.append(&sealed(5)).unwrap();
        backend.flush().unwrap();
        assert_eq!(backend.read_all().unwrap().len(), 3);
    }

    #[test]
    fn test_file_backend_tolerates_torn_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.wal");
        let backend = FileWalBackend::open(&path).unwrap();
        backend.append(&sealed(1)).unwrap();
        backend.flush().unwrap();

        // Simulate a crash mid-append: a length prefix with no body.
        {
            use std::io::Write;
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&64u32.to_le_bytes()).unwrap();
            file.write_all(&[1, 2, 3]).unwrap();
        }

        let entries = backend.read_all().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].sequence, 1);
    }

    #[test]
    fn test_memory_backend() {
        let backend = MemoryWalBackend::new();
        backend.append(&sealed(1)).unwrap();
        backend.rewrite(&[]).unwrap();
        assert!(backend.read_all().unwrap().is_empty());
    }
}
