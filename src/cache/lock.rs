//! Cross-process mutual exclusion over a cache directory.
//!
//! The lock is an exclusive advisory lock on `<cache>/.lock`. The file itself
//! stays in place; the lock is released when the [`DirectoryLock`] is dropped,
//! or by the OS if the holding process dies.

use std::{
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

use fs2::FileExt;
use log::warn;

use crate::error::{CatalogError, Result};

pub const LOCK_FILE: &str = ".lock";
pub const DEFAULT_RETRIES: u32 = 20;
pub const DEFAULT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub struct DirectoryLock {
    path: PathBuf,
    file: File,
}

impl DirectoryLock {
    /// Lock `dir` with the default retry budget.
    pub fn acquire(dir: &Path) -> Result<Self> {
        Self::acquire_with(dir, DEFAULT_RETRIES, DEFAULT_BACKOFF)
    }

    /// Lock `dir`, trying up to `retries` times and sleeping `backoff`
    /// between attempts.
    ///
    /// Returns `LockTimeout` once the budget is spent.
    pub fn acquire_with(dir: &Path, retries: u32, backoff: Duration) -> Result<Self> {
        let path = dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| CatalogError::io(&path, e))?;
        let attempts = retries.max(1);
        let start = Instant::now();

        for attempt in 1..=attempts {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    catalog_debug!(
                        2,
                        "Locked {} after {} ms",
                        path.display(),
                        start.elapsed().as_millis()
                    );
                    return Ok(Self { path, file });
                }
                Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                    catalog_debug!(1, "{} is locked (attempt {attempt}/{attempts})", path.display());
                    if attempt < attempts {
                        thread::sleep(backoff);
                    }
                }
                Err(e) => return Err(CatalogError::io(&path, e)),
            }
        }
        Err(CatalogError::LockTimeout { path, attempts })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DirectoryLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!("Failed to release lock {}: {e}", self.path.display());
        }
    }
}
