//! Repository lock for mutating operations
//!
//! An advisory exclusive `flock` on `<store>/lock` via `fs2`. Acquisition
//! never waits: a held lock fails immediately with [`Error::LockHeld`] and
//! the caller decides whether to retry. The OS releases the lock if the
//! process dies.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::error::{Error, Result};

pub const LOCK_FILE: &str = "lock";

/// Exclusive repository lock, released when dropped
#[derive(Debug)]
pub struct RepoLock {
    file: File,
    path: PathBuf,
}

impl RepoLock {
    pub fn acquire(store_dir: &Path) -> Result<Self> {
        let path = store_dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(RepoLock { file, path }),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                tracing::warn!("Repository lock {} is held by another process", path.display());
                Err(Error::LockHeld(path))
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RepoLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}
