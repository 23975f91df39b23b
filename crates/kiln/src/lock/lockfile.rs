//! File-presence advisory locks.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

/// An advisory lock backed by the existence of a file.
///
/// The file itself is the lock: `try_acquire` creates it exclusively and
/// `release` removes it. There is no in-memory ownership state, so any
/// process (including one recovering after a crash) can release it.
#[derive(Debug, Clone)]
pub struct FileLock {
    path: PathBuf,
}

impl FileLock {
    /// Create a handle for the lock file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The lock file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically create the lock file.
    ///
    /// Returns `true` iff the file did not already exist. Failure has no
    /// side effect.
    #[must_use]
    pub fn try_acquire(&self) -> bool {
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(_) => {
                tracing::debug!(path = %self.path.display(), "Lock acquired");
                true
            }
            Err(_) => false,
        }
    }

    /// Remove the lock file.
    ///
    /// Idempotent: releasing a lock that is not held is not an error.
    pub fn release(&self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!(path = %self.path.display(), "Lock released"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                tracing::warn!(path = %self.path.display(), %err, "Failed to remove lock file");
            }
        }
    }

    /// Whether the lock file currently exists.
    ///
    /// Non-atomic existence check, for status reporting only.
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.path.exists()
    }
}
