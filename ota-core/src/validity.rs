//! Persistent validity record: a two-byte non-volatile region.
//!
//! Offset 0 holds the validity flag (`0x00` valid, anything else invalid, so erased flash reads
//! as invalid); offset 1 holds the version id. Every write is committed before it returns.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Size of the region in bytes.
pub const REGION_LEN: usize = 2;

const FLAG_OFFSET: usize = 0;
const VERSION_OFFSET: usize = 1;
const FLAG_VALID: u8 = 0x00;
const FLAG_INVALID: u8 = 0x01;

/// Region content on first boot: invalid, version 0.
pub const INITIAL_REGION: [u8; REGION_LEN] = [FLAG_INVALID, 0x00];

/// File name of the region inside a node's data directory.
pub const VALIDITY_FILE: &str = "validity.bin";

/// Decoded validity record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Validity {
    pub invalid: bool,
    pub version: u8,
}

impl Validity {
    pub fn valid(version: u8) -> Self {
        Self {
            invalid: false,
            version,
        }
    }

    /// True when the stored binary may be executed.
    pub fn is_executable(&self) -> bool {
        !self.invalid
    }

    pub fn from_region(region: [u8; REGION_LEN]) -> Self {
        Self {
            invalid: region[FLAG_OFFSET] != FLAG_VALID,
            version: region[VERSION_OFFSET],
        }
    }

    pub fn to_region(self) -> [u8; REGION_LEN] {
        let mut region = [0u8; REGION_LEN];
        region[FLAG_OFFSET] = if self.invalid { FLAG_INVALID } else { FLAG_VALID };
        region[VERSION_OFFSET] = self.version;
        region
    }
}

/// The small non-volatile flag region.
pub trait ValidityStore {
    fn read_validity(&self) -> Result<Validity, ValidityError>;

    /// Mark the stored binary invalid. The version byte is kept.
    fn write_invalid(&mut self) -> Result<(), ValidityError>;

    /// Mark the stored binary valid with the given version.
    fn write_valid(&mut self, version: u8) -> Result<(), ValidityError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ValidityError {
    #[error("{op} failed on validity region {path}: {source}")]
    Io {
        op: &'static str,
        path: String,
        #[source]
        source: io::Error,
    },
}

/// Validity region kept in a small file, synced on every write.
#[derive(Debug)]
pub struct FileValidityStore {
    path: PathBuf,
}

impl FileValidityStore {
    /// Open the region, initializing it to [`INITIAL_REGION`] if it does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ValidityError> {
        let store = Self { path: path.into() };
        if !store.path.exists() {
            tracing::info!(path = %store.path.display(), "initializing validity region");
            store.write_region(INITIAL_REGION)?;
        }
        Ok(store)
    }

    /// Region named `validity.bin` inside `dir`.
    pub fn in_dir(dir: &Path) -> Result<Self, ValidityError> {
        Self::open(dir.join(VALIDITY_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn err(&self, op: &'static str) -> impl FnOnce(io::Error) -> ValidityError + '_ {
        move |source| ValidityError::Io {
            op,
            path: self.path.display().to_string(),
            source,
        }
    }

    fn read_region(&self) -> Result<[u8; REGION_LEN], ValidityError> {
        let mut file = File::open(&self.path).map_err(self.err("open"))?;
        // Bytes past the end of a short file read as erased flash.
        let mut region = [0xffu8; REGION_LEN];
        let mut buf = Vec::with_capacity(REGION_LEN);
        Read::by_ref(&mut file)
            .take(REGION_LEN as u64)
            .read_to_end(&mut buf)
            .map_err(self.err("read"))?;
        region[..buf.len()].copy_from_slice(&buf);
        Ok(region)
    }

    fn write_region(&self, region: [u8; REGION_LEN]) -> Result<(), ValidityError> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(self.err("open"))?;
        file.seek(SeekFrom::Start(0)).map_err(self.err("seek"))?;
        file.write_all(&region).map_err(self.err("write"))?;
        file.sync_all().map_err(self.err("sync"))
    }
}

impl ValidityStore for FileValidityStore {
    fn read_validity(&self) -> Result<Validity, ValidityError> {
        Ok(Validity::from_region(self.read_region()?))
    }

    fn write_invalid(&mut self) -> Result<(), ValidityError> {
        let mut region = self.read_region()?;
        region[FLAG_OFFSET] = FLAG_INVALID;
        self.write_region(region)
    }

    fn write_valid(&mut self, version: u8) -> Result<(), ValidityError> {
        self.write_region(Validity::valid(version).to_region())
    }
}

/// In-memory region for tests. Counts writes so fallbacks can be checked for "exactly once".
#[derive(Debug, Clone)]
pub struct MemoryValidityStore {
    region: [u8; REGION_LEN],
    invalid_writes: usize,
    valid_writes: usize,
    fail_writes: bool,
}

impl MemoryValidityStore {
    pub fn new() -> Self {
        Self {
            region: INITIAL_REGION,
            invalid_writes: 0,
            valid_writes: 0,
            fail_writes: false,
        }
    }

    /// Region already holding a valid binary of `version`.
    pub fn valid(version: u8) -> Self {
        Self {
            region: Validity::valid(version).to_region(),
            ..Self::new()
        }
    }

    pub fn region(&self) -> [u8; REGION_LEN] {
        self.region
    }

    pub fn invalid_writes(&self) -> usize {
        self.invalid_writes
    }

    pub fn valid_writes(&self) -> usize {
        self.valid_writes
    }

    pub fn set_fail_writes(&mut self, fail: bool) {
        self.fail_writes = fail;
    }

    fn check_writable(&self) -> Result<(), ValidityError> {
        if self.fail_writes {
            return Err(ValidityError::Io {
                op: "write",
                path: "memory".into(),
                source: io::Error::other("injected write failure"),
            });
        }
        Ok(())
    }
}

impl Default for MemoryValidityStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ValidityStore for MemoryValidityStore {
    fn read_validity(&self) -> Result<Validity, ValidityError> {
        Ok(Validity::from_region(self.region))
    }

    fn write_invalid(&mut self) -> Result<(), ValidityError> {
        self.check_writable()?;
        self.region[FLAG_OFFSET] = FLAG_INVALID;
        self.invalid_writes += 1;
        Ok(())
    }

    fn write_valid(&mut self, version: u8) -> Result<(), ValidityError> {
        self.check_writable()?;
        self.region = Validity::valid(version).to_region();
        self.valid_writes += 1;
        Ok(())
    }
}
