//! Reading and writing lockfile bytes.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Persistence for lockfiles.
pub trait LockStorage {
    /// Read the lockfile at `path`, or `None` if there is none.
    ///
    /// # Errors
    ///
    /// Returns an error for any failure other than the file being absent.
    fn read_lock(&self, path: &Path) -> io::Result<Option<Vec<u8>>>;

    /// Replace the lockfile at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes cannot be stored.
    fn write_lock(&self, path: &Path, bytes: &[u8]) -> io::Result<()>;
}

/// Lockfiles on the local filesystem.
///
/// Writes go to a sibling temporary file that is renamed over the target, so
/// a failed write never leaves a truncated lockfile behind.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsStorage;

impl LockStorage for FsStorage {
    fn read_lock(&self, path: &Path) -> io::Result<Option<Vec<u8>>> {
        match fs::read(path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn write_lock(&self, path: &Path, bytes: &[u8]) -> io::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut temp = path.as_os_str().to_owned();
        temp.push(".tmp");
        let temp = PathBuf::from(temp);
        fs::write(&temp, bytes)?;
        fs::rename(&temp, path)
    }
}

/// Lockfiles kept in memory, keyed by path.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    files: Mutex<BTreeMap<PathBuf, Vec<u8>>>,
    writes: Mutex<usize>,
}

impl MemoryStorage {
    /// Create empty storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a lockfile.
    #[must_use]
    pub fn with_lock(self, path: impl Into<PathBuf>, content: &str) -> Self {
        if let Ok(mut files) = self.files.lock() {
            files.insert(path.into(), content.as_bytes().to_vec());
        }
        self
    }

    /// Current content at `path` as text.
    #[must_use]
    pub fn contents(&self, path: &Path) -> Option<String> {
        let files = self.files.lock().ok()?;
        files
            .get(path)
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    }

    /// Number of writes performed.
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.writes.lock().map(|w| *w).unwrap_or_default()
    }
}

fn poisoned() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "storage lock poisoned")
}

impl LockStorage for MemoryStorage {
    fn read_lock(&self, path: &Path) -> io::Result<Option<Vec<u8>>> {
        let files = self.files.lock().map_err(|_| poisoned())?;
        Ok(files.get(path).cloned())
    }

    fn write_lock(&self, path: &Path, bytes: &[u8]) -> io::Result<()> {
        let mut files = self.files.lock().map_err(|_| poisoned())?;
        files.insert(path.to_path_buf(), bytes.to_vec());
        *self.writes.lock().map_err(|_| poisoned())? += 1;
        Ok(())
    }
}
