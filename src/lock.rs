//! Exclusive lock on the index directory.
//!
//! The snapshot is rewritten wholesale on every mutation, so only one
//! process may own a base directory at a time. Uses flock() advisory
//! locking; the lock is released when the file handle is dropped.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

/// Lock file name placed in the base directory
const LOCK_FILE_NAME: &str = "review-index.lock";

/// A held directory lock that releases on drop
pub struct IndexLock {
    #[allow(dead_code)]
    file: File,
}

impl IndexLock {
    /// Acquire the lock on `base_path` without waiting.
    /// Fails with `WouldBlock` if another process holds it.
    pub fn try_acquire(base_path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(base_path.join(LOCK_FILE_NAME))?;

        Self::try_lock_exclusive(&file)?;

        Ok(IndexLock { file })
    }

    #[cfg(unix)]
    fn try_lock_exclusive(file: &File) -> io::Result<()> {
        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if result != 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock
                || err.raw_os_error() == Some(libc::EWOULDBLOCK)
            {
                return Err(io::Error::new(
                    io::ErrorKind::WouldBlock,
                    "Review index is locked by another process",
                ));
            }
            return Err(err);
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn try_lock_exclusive(_file: &File) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(unix)]
impl Drop for IndexLock {
    fn drop(&mut self) {
        unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(unix)]
    fn test_second_acquire_fails_until_release() {
        let dir = tempfile::tempdir().unwrap();

        let first = IndexLock::try_acquire(dir.path()).unwrap();

        let second = IndexLock::try_acquire(dir.path());
        assert_eq!(second.err().unwrap().kind(), io::ErrorKind::WouldBlock);

        drop(first);
        assert!(IndexLock::try_acquire(dir.path()).is_ok());
    }

    #[test]
    fn test_creates_lock_file() {
        let dir = tempfile::tempdir().unwrap();
        let _lock = IndexLock::try_acquire(dir.path()).unwrap();
        assert!(dir.path().join(LOCK_FILE_NAME).exists());
    }
}
