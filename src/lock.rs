//! Exclusive advisory lock on a database directory.
//!
//! Held for the lifetime of a session so that two processes never load,
//! append to and save the same pair of files concurrently. The lock is tied
//! to the open file description and released when the guard is dropped or
//! the process exits.

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

const LOCK_FILE: &str = ".lock";

#[derive(Debug)]
pub struct DatabaseLock {
    file: File,
    dir: PathBuf,
    path: PathBuf,
}

impl DatabaseLock {
    /// Try to take the lock, failing with `DatabaseLocked` if it is held.
    pub fn try_acquire(dir: &Path) -> Result<Self> {
        Self::acquire_with(dir, false)
    }

    /// Block until the lock is available.
    pub fn acquire(dir: &Path) -> Result<Self> {
        Self::acquire_with(dir, true)
    }

    fn acquire_with(dir: &Path, wait: bool) -> Result<Self> {
        std::fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))?;
        let path = dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| Error::io(&path, e))?;

        let mut op = libc::LOCK_EX;
        if !wait {
            op |= libc::LOCK_NB;
        }
        loop {
            let ret = unsafe { libc::flock(file.as_raw_fd(), op) };
            if ret == 0 {
                break;
            }
            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EWOULDBLOCK) => return Err(Error::DatabaseLocked(dir.to_path_buf())),
                _ => return Err(Error::io(&path, err)),
            }
        }

        log::debug!("locked {}", path.display());
        Ok(Self {
            file,
            dir: dir.to_path_buf(),
            path,
        })
    }

    /// The database directory this lock guards.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DatabaseLock {
    fn drop(&mut self) {
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
        log::debug!("unlocked {}", self.path.display());
    }
}
