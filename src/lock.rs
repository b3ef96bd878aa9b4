//! Advisory file lock on the data directory.
//!
//! The snapshot is owned by exactly one process: `serve` holds the lock for
//! its lifetime and the one-shot CLI commands hold it per invocation.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

const LOCK_FILE_NAME: &str = "roomsearch.lock";

/// Exclusive ownership of a data directory, released on drop.
pub struct FileLock {
    file: File,
}

impl FileLock {
    /// Take the lock without waiting. Fails with `WouldBlock` when another
    /// roomsearch process owns `base_path`.
    pub fn try_acquire(base_path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(base_path.join(LOCK_FILE_NAME))?;

        let lock = FileLock { file };
        lock.flock(Operation::Exclusive).map_err(|e| match e.kind() {
            io::ErrorKind::WouldBlock => io::Error::new(
                io::ErrorKind::WouldBlock,
                format!("{} is in use by another roomsearch process", base_path.display()),
            ),
            _ => e,
        })?;

        Ok(lock)
    }
}

#[derive(Clone, Copy)]
enum Operation {
    Exclusive,
    Unlock,
}

#[cfg(unix)]
impl FileLock {
    fn flock(&self, op: Operation) -> io::Result<()> {
        use std::os::unix::io::AsRawFd;

        let flags = match op {
            Operation::Exclusive => libc::LOCK_EX | libc::LOCK_NB,
            Operation::Unlock => libc::LOCK_UN,
        };
        // EWOULDBLOCK maps to ErrorKind::WouldBlock
        if unsafe { libc::flock(self.file.as_raw_fd(), flags) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

#[cfg(not(unix))]
impl FileLock {
    fn flock(&self, _op: Operation) -> io::Result<()> {
        let _ = &self.file;
        Ok(())
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = self.flock(Operation::Unlock) {
            log::warn!("Failed to release data directory lock: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(unix)]
    fn test_second_owner_is_refused_until_release() {
        let dir = tempfile::tempdir().unwrap();

        let first = FileLock::try_acquire(dir.path()).unwrap();

        let err = FileLock::try_acquire(dir.path())
            .err()
            .expect("data directory should already be owned");
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        assert!(err.to_string().contains("another roomsearch process"));

        drop(first);
        assert!(FileLock::try_acquire(dir.path()).is_ok());
    }

    #[test]
    fn test_missing_directory_is_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(FileLock::try_acquire(&dir.path().join("nope")).is_err());
    }
}
