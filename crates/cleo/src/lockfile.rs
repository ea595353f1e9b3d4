//! Cross-process mutual exclusion around the shared JSON files.
//!
//! Every mutable document (task board, context bus, usage log, mailboxes) has
//! one designated lock path; writers acquire the lock around the full
//! read-modify-write cycle. Uses OS advisory locks via `fs2`, so two runs on
//! the same working directory exclude each other.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use fs2::FileExt as _;

static DEGRADED_WARNED: AtomicBool = AtomicBool::new(false);

/// Scoped exclusive lock on a sentinel file. Released on drop.
pub struct LockGuard {
    file: Option<File>,
    path: PathBuf,
}

impl LockGuard {
    /// Acquire an exclusive lock, blocking until it is available.
    ///
    /// If the sentinel file cannot be created or locked (unsupported
    /// filesystem, permissions), this warns loudly once and returns a
    /// degraded no-op guard: single-process use keeps working, concurrent
    /// runs are undefined.
    pub fn acquire(path: &Path) -> Self {
        match Self::try_acquire(path) {
            Ok(guard) => guard,
            Err(e) => {
                if !DEGRADED_WARNED.swap(true, Ordering::SeqCst) {
                    tracing::warn!(
                        lock = %path.display(),
                        error = %e,
                        "file lock unavailable; state files are NOT process-safe"
                    );
                }
                Self {
                    file: None,
                    path: path.to_path_buf(),
                }
            }
        }
    }

    fn try_acquire(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;
        file.lock_exclusive()?;
        Ok(Self {
            file: Some(file),
            path: path.to_path_buf(),
        })
    }

    /// Whether a real OS lock is held (false in degraded mode).
    pub fn is_locked(&self) -> bool {
        self.file.is_some()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            // Unlock errors are unrecoverable here; the fd close releases
            // the advisory lock anyway.
            let _ = fs2::FileExt::unlock(&file);
        }
    }
}
