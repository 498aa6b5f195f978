//! Payload slot: the single file holding the current WebAssembly binary.
//!
//! The receiver truncates the slot when a transfer starts and appends one chunk per Data frame;
//! the sender and the bootstrap only read it. Both implementations open, mutate and close per
//! call, so nothing is buffered across frames.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Storage for the payload slot.
pub trait PayloadStore {
    /// Empty the slot (truncate mode). Creates it if missing.
    fn truncate(&mut self) -> Result<(), StorageError>;

    /// Append bytes at the end of the slot (append mode).
    fn append(&mut self, bytes: &[u8]) -> Result<(), StorageError>;

    /// Current size in bytes. `Missing` if the slot was never written.
    fn size(&self) -> Result<u64, StorageError>;

    /// Read up to `len` bytes starting at `offset`. Shorter at end of slot.
    fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>, StorageError>;

    /// Read the whole slot.
    fn read_all(&self) -> Result<Vec<u8>, StorageError>;

    /// Replace the slot content (local import of a new binary).
    fn replace(&mut self, bytes: &[u8]) -> Result<(), StorageError> {
        self.truncate()?;
        self.append(bytes)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("payload slot {0} does not exist")]
    Missing(String),
    #[error("{op} failed on payload slot: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: io::Error,
    },
}

impl StorageError {
    fn io(op: &'static str) -> impl FnOnce(io::Error) -> StorageError {
        move |source| StorageError::Io { op, source }
    }
}

/// Payload slot backed by a file on disk (flash file system on a device).
#[derive(Debug, Clone)]
pub struct FsPayloadStore {
    path: PathBuf,
}

impl FsPayloadStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Slot named `main.wasm` inside `dir`.
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(crate::protocol::PAYLOAD_SLOT))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open_read(&self) -> Result<File, StorageError> {
        File::open(&self.path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => StorageError::Missing(self.path.display().to_string()),
            _ => StorageError::Io {
                op: "open",
                source: e,
            },
        })
    }
}

impl PayloadStore for FsPayloadStore {
    fn truncate(&mut self) -> Result<(), StorageError> {
        File::create(&self.path).map_err(StorageError::io("truncate"))?;
        Ok(())
    }

    fn append(&mut self, bytes: &[u8]) -> Result<(), StorageError> {
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)
            .map_err(StorageError::io("open"))?;
        file.write_all(bytes).map_err(StorageError::io("append"))?;
        file.flush().map_err(StorageError::io("flush"))
    }

    fn size(&self) -> Result<u64, StorageError> {
        let file = self.open_read()?;
        let meta = file.metadata().map_err(StorageError::io("stat"))?;
        Ok(meta.len())
    }

    fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>, StorageError> {
        let mut file = self.open_read()?;
        file.seek(SeekFrom::Start(offset))
            .map_err(StorageError::io("seek"))?;
        let mut out = Vec::with_capacity(len);
        file.take(len as u64)
            .read_to_end(&mut out)
            .map_err(StorageError::io("read"))?;
        Ok(out)
    }

    fn read_all(&self) -> Result<Vec<u8>, StorageError> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(StorageError::Missing(self.path.display().to_string()))
            }
            Err(e) => Err(StorageError::Io {
                op: "read",
                source: e,
            }),
        }
    }
}

/// In-memory payload slot for tests and simulation. Counts truncations; writes can be failed on demand.
#[derive(Debug, Default, Clone)]
pub struct MemoryPayloadStore {
    bytes: Option<Vec<u8>>,
    truncations: usize,
    fail_writes: bool,
}

impl MemoryPayloadStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: Some(bytes.into()),
            ..Self::default()
        }
    }

    /// Bytes currently in the slot, if it exists.
    pub fn bytes(&self) -> Option<&[u8]> {
        self.bytes.as_deref()
    }

    /// How many times `truncate` was called.
    pub fn truncations(&self) -> usize {
        self.truncations
    }

    /// Make every subsequent truncate/append fail with an I/O error.
    pub fn set_fail_writes(&mut self, fail: bool) {
        self.fail_writes = fail;
    }

    fn check_writable(&self, op: &'static str) -> Result<(), StorageError> {
        if self.fail_writes {
            return Err(StorageError::Io {
                op,
                source: io::Error::other("injected write failure"),
            });
        }
        Ok(())
    }

    fn existing(&self) -> Result<&Vec<u8>, StorageError> {
        self.bytes
            .as_ref()
            .ok_or_else(|| StorageError::Missing("memory".into()))
    }
}

impl PayloadStore for MemoryPayloadStore {
    fn truncate(&mut self) -> Result<(), StorageError> {
        self.check_writable("truncate")?;
        self.truncations += 1;
        self.bytes = Some(Vec::new());
        Ok(())
    }

    fn append(&mut self, bytes: &[u8]) -> Result<(), StorageError> {
        self.check_writable("append")?;
        self.bytes.get_or_insert_with(Vec::new).extend_from_slice(bytes);
        Ok(())
    }

    fn size(&self) -> Result<u64, StorageError> {
        Ok(self.existing()?.len() as u64)
    }

    fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>, StorageError> {
        let bytes = self.existing()?;
        let start = (offset as usize).min(bytes.len());
        let end = start.saturating_add(len).min(bytes.len());
        Ok(bytes[start..end].to_vec())
    }

    fn read_all(&self) -> Result<Vec<u8>, StorageError> {
        Ok(self.existing()?.clone())
    }
}
