//! Advisory lock on the item store directory.
//!
//! The daemon holds it for its whole lifetime; a standalone CLI command holds
//! it for one operation. A CLI talking to the daemon over HTTP skips it.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

const LOCK_FILE_NAME: &str = "itemmatch.lock";

/// Held lock, released on drop.
pub struct StoreLock {
    #[allow(dead_code)]
    file: File,
}

impl StoreLock {
    /// Fails with `WouldBlock` when another process holds the lock.
    pub fn try_acquire(base_path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(base_path.join(LOCK_FILE_NAME))?;

        try_lock_exclusive(&file)?;

        Ok(StoreLock { file })
    }
}

#[cfg(unix)]
fn try_lock_exclusive(file: &File) -> io::Result<()> {
    let fd = file.as_raw_fd();
    let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
    if result != 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock
            || err.raw_os_error() == Some(libc::EWOULDBLOCK)
            || err.raw_os_error() == Some(libc::EAGAIN)
        {
            return Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                "item store is locked by another process (daemon or CLI)",
            ));
        }
        return Err(err);
    }
    Ok(())
}

// no protection outside unix
#[cfg(not(unix))]
fn try_lock_exclusive(_file: &File) -> io::Result<()> {
    Ok(())
}

#[cfg(unix)]
impl Drop for StoreLock {
    fn drop(&mut self) {
        let fd = self.file.as_raw_fd();
        unsafe { libc::flock(fd, libc::LOCK_UN) };
    }
}

pub enum LockGuard {
    Held(StoreLock),
    /// Operations go to a remote daemon, which holds its own lock.
    Skipped,
}

impl LockGuard {
    pub fn acquire_if_local(base_path: &Path, remote: bool) -> io::Result<Self> {
        if remote {
            Ok(LockGuard::Skipped)
        } else {
            StoreLock::try_acquire(base_path).map(LockGuard::Held)
        }
    }
}
