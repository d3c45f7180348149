use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

use fs2::FileExt;

#[derive(thiserror::Error, Debug)]
pub enum LockError {
    #[error("lock already held")]
    AlreadyLocked,
    #[error("lock I/O error: {0}")]
    Io(#[from] io::Error),
}

/// An advisory exclusive flock on a well-known file. Released on drop.
#[derive(Debug)]
pub struct FileLock {
    file: File,
}

impl FileLock {
    fn open(path: &Path) -> io::Result<File> {
        OpenOptions::new().write(true).create(true).open(path)
    }

    /// Block until the lock is acquired. Callers on the async runtime must
    /// wrap this in `spawn_blocking`.
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        let file = Self::open(path)?;
        file.lock_exclusive()?;
        Ok(Self { file })
    }

    pub fn try_acquire(path: &Path) -> Result<Self, LockError> {
        let file = Self::open(path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Self { file }),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                Err(LockError::AlreadyLocked)
            }
            Err(e) => Err(LockError::Io(e)),
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}
