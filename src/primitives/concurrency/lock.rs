#![allow(unsafe_code)]

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use crate::types::{Result, StoreError};

/// Process-level writer lock for one store directory.
///
/// The store is single-writer; holding this lock keeps a second process from
/// opening the same partitions for writing. The lock is released on drop.
pub struct StoreLock {
    file: File,
    path: PathBuf,
}

impl StoreLock {
    /// Acquires the lock file at `path` without blocking.
    ///
    /// Fails with `ResourceExhausted` when another process holds it.
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(StoreError::from)?;
        if file.metadata()?.len() < 1 {
            file.set_len(1)?;
        }
        if !lock_writer_slot(&file).map_err(StoreError::from)? {
            return Err(StoreError::exhausted(format!(
                "store lock {} held by another process",
                path.display()
            )));
        }
        Ok(Self { file, path })
    }

    /// Returns the lock file path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if let Err(_err) = unlock_writer_slot(&self.file) {
            #[cfg(debug_assertions)]
            eprintln!("failed to unlock {}: {:?}", self.path.display(), _err);
        }
    }
}

#[cfg(unix)]
fn lock_writer_slot(file: &File) -> io::Result<bool> {
    unix::lock_region(file, 0, 1, libc::F_WRLCK)
}

#[cfg(unix)]
fn unlock_writer_slot(file: &File) -> io::Result<()> {
    unix::lock_region(file, 0, 1, libc::F_UNLCK).map(|_| ())
}

#[cfg(not(unix))]
fn lock_writer_slot(_file: &File) -> io::Result<bool> {
    Ok(true)
}

#[cfg(not(unix))]
fn unlock_writer_slot(_file: &File) -> io::Result<()> {
    Ok(())
}

#[cfg(unix)]
mod unix {
    use std::fs::File;
    use std::io;
    use std::os::unix::io::AsRawFd;

    pub fn lock_region(file: &File, start: u64, len: u64, l_type: libc::c_int) -> io::Result<bool> {
        let fd = file.as_raw_fd();
        let mut flock: libc::flock = unsafe { std::mem::zeroed() };
        flock.l_type = l_type as _;
        flock.l_whence = libc::SEEK_SET as _;
        flock.l_start = start as libc::off_t;
        flock.l_len = len as libc::off_t;
        loop {
            let res = unsafe { libc::fcntl(fd, libc::F_SETLK, &mut flock) };
            if res == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) | Some(libc::EACCES) => return Ok(false),
                _ => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn lock_reacquires_after_drop() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.lock");
        let lock = StoreLock::acquire(&path)?;
        assert_eq!(lock.path(), path.as_path());
        drop(lock);
        let again = StoreLock::acquire(&path)?;
        drop(again);
        Ok(())
    }
}
