//! Durable storage for the guest (anonymous) cart.
//!
//! The guest cart is a single record: a JSON array of [`CartLine`]s. It is
//! written on every guest mutation and read once when the engine starts.
//! [`FileGuestStore`] keeps it in a file; [`MemoryGuestStore`] keeps it in
//! memory for tests and embedders without a writable disk.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{debug, instrument};

use crate::model::CartLine;

/// Errors that can occur reading or writing the guest cart.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored record could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The in-memory store's lock was poisoned by a panicking writer.
    #[error("Guest store lock poisoned")]
    Poisoned,
}

/// Persistence interface for the guest cart.
pub trait GuestCartStore: Send + Sync {
    /// Read the stored lines. A missing record is an empty cart.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the record exists but cannot be read.
    fn load(&self) -> Result<Vec<CartLine>, StoreError>;

    /// Replace the stored lines.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the record cannot be written.
    fn save(&self, lines: &[CartLine]) -> Result<(), StoreError>;

    /// Delete the stored record.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the record exists but cannot be removed.
    fn clear(&self) -> Result<(), StoreError>;
}

/// Guest cart stored as a JSON file.
///
/// Writes go to a sibling temporary file that is then renamed over the
/// record, so a crash mid-write never leaves a truncated cart behind.
#[derive(Debug, Clone)]
pub struct FileGuestStore {
    path: PathBuf,
}

impl FileGuestStore {
    /// Store the guest cart at `path`. Parent directories are created on the
    /// first write.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(std::ffi::OsStr::to_os_string)
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl GuestCartStore for FileGuestStore {
    #[instrument(skip(self), fields(path = %self.path.display()))]
    fn load(&self) -> Result<Vec<CartLine>, StoreError> {
        match fs::read(&self.path) {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(Vec::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No guest cart on disk");
                Ok(Vec::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self, lines), fields(path = %self.path.display(), lines = lines.len()))]
    fn save(&self, lines: &[CartLine]) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let bytes = serde_json::to_vec_pretty(lines)?;
        let temp = self.temp_path();
        fs::write(&temp, bytes)?;
        fs::rename(&temp, &self.path)?;
        Ok(())
    }

    #[instrument(skip(self), fields(path = %self.path.display()))]
    fn clear(&self) -> Result<(), StoreError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Guest cart kept in memory.
///
/// Clones share the same record, so a test can keep a handle and inspect
/// what the engine persisted.
#[derive(Debug, Clone, Default)]
pub struct MemoryGuestStore {
    record: Arc<Mutex<Option<Vec<CartLine>>>>,
}

impl MemoryGuestStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that already holds `lines`.
    #[must_use]
    pub fn with_lines(lines: Vec<CartLine>) -> Self {
        Self {
            record: Arc::new(Mutex::new(Some(lines))),
        }
    }

    /// Whether a record exists (an empty saved cart still counts).
    #[must_use]
    pub fn has_record(&self) -> bool {
        self.record.lock().is_ok_and(|guard| guard.is_some())
    }
}

impl GuestCartStore for MemoryGuestStore {
    fn load(&self) -> Result<Vec<CartLine>, StoreError> {
        let guard = self.record.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(guard.clone().unwrap_or_default())
    }

    fn save(&self, lines: &[CartLine]) -> Result<(), StoreError> {
        let mut guard = self.record.lock().map_err(|_| StoreError::Poisoned)?;
        *guard = Some(lines.to_vec());
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        let mut guard = self.record.lock().map_err(|_| StoreError::Poisoned)?;
        *guard = None;
        Ok(())
    }
}
