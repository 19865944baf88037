//! Directory locks
//!
//! `flock(2)` on a `.lock` file inside the directory. The lock belongs to
//! the open file description, so it is released when the guard drops and
//! two guards in the same process exclude each other just like two
//! processes do.

use objectio_common::{Error, Result};
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const LOCK_FILE: &str = ".lock";
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Held lock on a directory; released on drop
#[derive(Debug)]
pub struct DirLock {
    _file: File,
    path: PathBuf,
}

impl DirLock {
    /// Lock file path
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Take the exclusive lock on `dir`, polling until `timeout` elapses.
///
/// Fails with [`Error::LockTimeout`] if another holder keeps it longer.
pub fn lock_path(dir: &Path, timeout: Duration) -> Result<DirLock> {
    let path = dir.join(LOCK_FILE);
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)?;

    let deadline = Instant::now() + timeout;
    loop {
        let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if ret == 0 {
            return Ok(DirLock { _file: file, path });
        }

        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EWOULDBLOCK) {
            return Err(Error::DiskIo(err));
        }
        if Instant::now() >= deadline {
            return Err(Error::LockTimeout {
                path: dir.to_path_buf(),
                timeout,
            });
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_excludes_second_holder() {
        let dir = tempfile::tempdir().unwrap();
        let held = lock_path(dir.path(), Duration::from_millis(100)).unwrap();
        assert_eq!(held.path(), dir.path().join(".lock"));

        let err = lock_path(dir.path(), Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, Error::LockTimeout { .. }));
        assert!(err.is_retryable());

        drop(held);
        lock_path(dir.path(), Duration::from_millis(50)).unwrap();
    }

    #[test]
    fn test_lock_waits_for_release() {
        let dir = tempfile::tempdir().unwrap();
        let held = lock_path(dir.path(), Duration::ZERO).unwrap();
        let path = dir.path().to_path_buf();
        let waiter = std::thread::spawn(move || lock_path(&path, Duration::from_secs(5)).is_ok());
        std::thread::sleep(Duration::from_millis(50));
        drop(held);
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_lock_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let err = lock_path(&dir.path().join("absent"), Duration::ZERO).unwrap_err();
        assert!(matches!(err, Error::DiskIo(_)));
    }
}
