#![forbid(unsafe_code)]

//! Shared identifiers, error type and checksums.

use std::fmt;
use std::io;

mod checksum;

pub use checksum::{compute_crc32, range_crc32};

/// Logical key of the partitioned map.
pub type SmapId = u64;

/// Store-wide checkpoint counter.
///
/// The horizon names the last externally consistent state: the state the
/// store goes back to when its backup is restored.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct Horizon(pub u64);

impl Horizon {
    /// Returns the generation that follows this horizon.
    pub fn next(self) -> Horizon {
        Horizon(self.0.saturating_add(1))
    }
}

impl fmt::Display for Horizon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors returned by the store, its partitions and the checkpoint protocol.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    /// Malformed id, out-of-range index or offset, bad option value.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Filesystem failure; the OS error code is kept on the inner error.
    #[error("IO: {0}")]
    Io(#[from] io::Error),
    /// On-disk metadata is inconsistent.
    #[error("format: {0}")]
    Format(String),
    /// Out-of-order checkpoint call, unauthorized horizon change, double free.
    #[error("protocol violation: {0}")]
    Protocol(String),
    /// Partition table full or allocation cannot be satisfied.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    /// An exclusive insert found the entry already present.
    #[error("already exists: {0}")]
    Exists(String),
    /// A status callback returned a nonzero value.
    #[error("status callback aborted with {0}")]
    Callback(i32),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;

impl StoreError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        StoreError::InvalidArgument(msg.into())
    }

    pub(crate) fn format(msg: impl Into<String>) -> Self {
        StoreError::Format(msg.into())
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        StoreError::Protocol(msg.into())
    }

    pub(crate) fn exhausted(msg: impl Into<String>) -> Self {
        StoreError::ResourceExhausted(msg.into())
    }

    /// Returns the underlying OS error code for I/O failures.
    pub fn os_code(&self) -> Option<i32> {
        match self {
            StoreError::Io(err) => err.raw_os_error(),
            _ => None,
        }
    }

    /// Produces an equivalent error value.
    ///
    /// Completion tokens hand the same failure to every waiter; `io::Error`
    /// is not `Clone`, so the copy keeps the kind, OS code and message.
    pub fn duplicate(&self) -> StoreError {
        match self {
            StoreError::InvalidArgument(msg) => StoreError::InvalidArgument(msg.clone()),
            StoreError::Io(err) => match err.raw_os_error() {
                Some(code) => StoreError::Io(io::Error::from_raw_os_error(code)),
                None => StoreError::Io(io::Error::new(err.kind(), err.to_string())),
            },
            StoreError::Format(msg) => StoreError::Format(msg.clone()),
            StoreError::Protocol(msg) => StoreError::Protocol(msg.clone()),
            StoreError::ResourceExhausted(msg) => StoreError::ResourceExhausted(msg.clone()),
            StoreError::Exists(msg) => StoreError::Exists(msg.clone()),
            StoreError::Callback(code) => StoreError::Callback(*code),
        }
    }
}

/// Reads a big-endian `u64` at `at`; callers guarantee the bounds.
pub(crate) fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[at..at + 8]);
    u64::from_be_bytes(raw)
}

/// Reads a big-endian `u32` at `at`; callers guarantee the bounds.
pub(crate) fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[at..at + 4]);
    u32::from_be_bytes(raw)
}
