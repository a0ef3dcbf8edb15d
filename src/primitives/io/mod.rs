#![forbid(unsafe_code)]

use std::{
    fs::{File, OpenOptions},
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
};

use tracing::trace;

use crate::types::{Result, StoreError};

/// Trait for performing positioned file I/O operations.
pub trait FileIo: Send + Sync + 'static {
    /// Reads bytes from the file at the specified offset into the buffer.
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()>;
    /// Writes bytes to the file at the specified offset from the buffer.
    fn write_at(&self, off: u64, src: &[u8]) -> Result<()>;
    /// Synchronizes all file data and metadata to disk.
    fn sync_all(&self) -> Result<()>;
    /// Returns the current length of the file in bytes.
    fn len(&self) -> Result<u64>;
    /// Returns true if the file is empty.
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
    /// Truncates or extends the file to the specified length.
    fn truncate(&self, len: u64) -> Result<()>;
}

/// How a backing file is opened.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OpenMode {
    /// The file must already exist.
    Existing,
    /// The file is created when missing.
    Create,
}

/// Single positioned read or write; short transfers are retried by the
/// callers below.
mod positioned {
    use std::fs::File;
    use std::io;

    #[cfg(unix)]
    pub fn read(file: &File, dst: &mut [u8], off: u64) -> io::Result<usize> {
        std::os::unix::fs::FileExt::read_at(file, dst, off)
    }

    #[cfg(unix)]
    pub fn write(file: &File, src: &[u8], off: u64) -> io::Result<usize> {
        std::os::unix::fs::FileExt::write_at(file, src, off)
    }

    #[cfg(windows)]
    pub fn read(file: &File, dst: &mut [u8], off: u64) -> io::Result<usize> {
        std::os::windows::fs::FileExt::seek_read(file, dst, off)
    }

    #[cfg(windows)]
    pub fn write(file: &File, src: &[u8], off: u64) -> io::Result<usize> {
        std::os::windows::fs::FileExt::seek_write(file, src, off)
    }

    #[cfg(not(any(unix, windows)))]
    pub fn read(_file: &File, _dst: &mut [u8], _off: u64) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "positioned reads unsupported"))
    }

    #[cfg(not(any(unix, windows)))]
    pub fn write(_file: &File, _src: &[u8], _off: u64) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "positioned writes unsupported"))
    }
}

/// Standard file I/O implementation using `Arc<File>`.
#[derive(Clone)]
pub struct StdFileIo {
    inner: Arc<File>,
}

impl StdFileIo {
    /// Creates a new StdFileIo from an existing File handle.
    pub fn new(file: File) -> Self {
        Self {
            inner: Arc::new(file),
        }
    }

    /// Opens a file for read-write access according to `mode`.
    pub fn open(path: impl AsRef<Path>, mode: OpenMode) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(mode == OpenMode::Create)
            .truncate(false)
            .open(path)
            .map_err(StoreError::from)?;
        Ok(Self::new(file))
    }

    fn file(&self) -> &File {
        &self.inner
    }

    fn read_exact(&self, mut off: u64, mut dst: &mut [u8]) -> io::Result<()> {
        while !dst.is_empty() {
            match positioned::read(self.file(), dst, off)? {
                0 => {
                    return Err(io::Error::new(
                        ErrorKind::UnexpectedEof,
                        "read past end of file",
                    ))
                }
                n => {
                    dst = &mut std::mem::take(&mut dst)[n..];
                    off += n as u64;
                }
            }
        }
        Ok(())
    }

    fn write_all(&self, mut off: u64, mut src: &[u8]) -> io::Result<()> {
        while !src.is_empty() {
            match positioned::write(self.file(), src, off)? {
                0 => {
                    return Err(io::Error::new(
                        ErrorKind::WriteZero,
                        "positioned write stalled",
                    ))
                }
                n => {
                    src = &src[n..];
                    off += n as u64;
                }
            }
        }
        Ok(())
    }
}

impl FileIo for StdFileIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        self.read_exact(off, dst).map_err(StoreError::from)
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        self.write_all(off, src).map_err(StoreError::from)
    }

    fn sync_all(&self) -> Result<()> {
        trace!("io.sync_all");
        self.file().sync_all().map_err(StoreError::from)
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file().metadata().map_err(StoreError::from)?.len())
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.file().set_len(len).map_err(StoreError::from)
    }
}

/// Open handle on a directory, used to make entry creation and removal durable.
///
/// Directory-entry durability and file-content durability are separate on
/// common filesystems; this handle only covers the former.
#[derive(Clone, Debug)]
pub struct DirHandle {
    path: PathBuf,
    file: Option<Arc<File>>,
}

impl DirHandle {
    /// Opens `path`, creating it (and its parents) when missing.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&path)?;
        let file = open_dir_file(&path)?;
        Ok(Self {
            path,
            file: file.map(Arc::new),
        })
    }

    /// Returns the directory path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flushes directory metadata to disk.
    pub fn sync(&self) -> Result<()> {
        trace!(path = %self.path.display(), "io.dir_sync");
        match &self.file {
            Some(file) => file.sync_all().map_err(StoreError::from),
            None => Ok(()),
        }
    }
}

#[cfg(unix)]
fn open_dir_file(path: &Path) -> Result<Option<File>> {
    Ok(Some(File::open(path)?))
}

#[cfg(not(unix))]
fn open_dir_file(_path: &Path) -> Result<Option<File>> {
    Ok(None)
}

/// Removes a file, treating "already gone" as success.
pub fn remove_file_if_exists(path: &Path) -> Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(StoreError::from(err)),
    }
}
