#![allow(unsafe_code)]

use std::ops::{Deref, DerefMut};

use tracing::debug;

/// Heap buffer backing one cached tile, optionally locked into RAM.
pub struct TileBuf {
    data: Box<[u8]>,
    locked: bool,
}

impl TileBuf {
    /// Allocates a zeroed buffer; `mlock` requests that it stays resident.
    pub fn zeroed(len: usize, mlock: bool) -> Self {
        let data = vec![0u8; len].into_boxed_slice();
        let locked = mlock && lock_pages(&data);
        Self { data, locked }
    }

    /// Returns true when the pages are locked in memory.
    pub fn is_locked(&self) -> bool {
        self.locked
    }
}

impl Deref for TileBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for TileBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for TileBuf {
    fn drop(&mut self) {
        if self.locked {
            unlock_pages(&self.data);
        }
    }
}

#[cfg(unix)]
fn lock_pages(data: &[u8]) -> bool {
    if data.is_empty() {
        return false;
    }
    let rc = unsafe { libc::mlock(data.as_ptr().cast(), data.len()) };
    if rc != 0 {
        debug!(
            len = data.len(),
            error = %std::io::Error::last_os_error(),
            "tile.mlock_failed"
        );
        return false;
    }
    true
}

#[cfg(unix)]
fn unlock_pages(data: &[u8]) {
    let _ = unsafe { libc::munlock(data.as_ptr().cast(), data.len()) };
}

#[cfg(not(unix))]
fn lock_pages(data: &[u8]) -> bool {
    debug!(len = data.len(), "tile.mlock_unsupported");
    false
}

#[cfg(not(unix))]
fn unlock_pages(_data: &[u8]) {}
