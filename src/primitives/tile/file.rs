#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{
    lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard},
    Mutex, RawRwLock,
};
use tracing::{debug, trace};

use super::buffer::TileBuf;
use super::pool::{TileCell, TilePool};
use crate::primitives::io::{FileIo, OpenMode, StdFileIo};
use crate::status::{report, StatusFn};
use crate::types::Result;

/// Shared read lease on a cached tile; the tile stays resident while held.
pub struct TileRef {
    tile: u64,
    guard: ArcRwLockReadGuard<RawRwLock, TileBuf>,
}

impl TileRef {
    /// Tile number within its file.
    pub fn tile(&self) -> u64 {
        self.tile
    }

    /// Returns the tile contents.
    pub fn data(&self) -> &[u8] {
        &self.guard
    }
}

/// Exclusive lease on a cached tile, already registered as dirty.
pub struct TileMut {
    guard: ArcRwLockWriteGuard<RawRwLock, TileBuf>,
}

impl TileMut {
    /// Returns the tile contents.
    pub fn data(&self) -> &[u8] {
        &self.guard
    }

    /// Returns the tile contents for modification.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.guard
    }
}

/// Copy of a dirty tile taken at a checkpoint fence.
///
/// The image keeps its tile pinned until it has been written, so the pool
/// cannot drop the tile and re-read stale bytes from the file in between.
pub struct TileImage {
    /// Tile number within its file.
    pub tile: u64,
    /// Tile contents at the fence.
    pub bytes: Box<[u8]>,
    pin: TileCell,
}

/// Dirty tile images of one file, ready to be written outside the writer.
pub struct ImageBatch {
    io: Arc<dyn FileIo>,
    tile_size: u64,
    images: Vec<TileImage>,
}

impl ImageBatch {
    /// Number of tiles in the batch.
    pub fn len(&self) -> usize {
        self.images.len()
    }

    /// Returns true when there is nothing to write.
    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Writes every image at its tile offset and releases its pin.
    ///
    /// On failure the batch keeps the images that were not written, so it
    /// can be retried or handed back with [`TiledFile::requeue`].
    pub fn write(&mut self) -> Result<usize> {
        let mut written = 0;
        let mut outcome = Ok(());
        for image in &self.images {
            if let Err(err) = self.io.write_at(image.tile * self.tile_size, &image.bytes) {
                outcome = Err(err);
                break;
            }
            written += 1;
        }
        self.images.drain(..written);
        outcome.map(|()| written)
    }
}

/// Per-file counters.
#[derive(Default, Clone, Debug)]
pub struct TiledFileStats {
    /// Tiles written back to the file.
    pub tile_writes: u64,
    /// Tiles currently dirty.
    pub dirty: u64,
    /// Physical file length.
    pub len: u64,
}

struct FileState {
    dirty: BTreeMap<u64, TileCell>,
    len: u64,
    tile_writes: u64,
}

/// A file accessed through the shared tile pool.
///
/// Dirty tiles are held by the file (and therefore pinned in the pool) until
/// they are written by [`TiledFile::flush`] or handed to a checkpoint through
/// [`TiledFile::take_dirty`].
pub struct TiledFile {
    id: u64,
    pool: TilePool,
    io: Arc<dyn FileIo>,
    path: PathBuf,
    state: Mutex<FileState>,
}

impl TiledFile {
    /// Opens `path` and attaches it to `pool`.
    pub fn open(pool: &TilePool, path: impl AsRef<Path>, mode: OpenMode) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let io: Arc<dyn FileIo> = Arc::new(StdFileIo::open(&path, mode)?);
        let len = io.len()?;
        let id = pool.register_file();
        debug!(file = id, path = %path.display(), len, "tile.file_open");
        Ok(Self {
            id,
            pool: pool.clone(),
            io,
            path,
            state: Mutex::new(FileState {
                dirty: BTreeMap::new(),
                len,
                tile_writes: 0,
            }),
        })
    }

    /// Returns the file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the tile size of the owning pool.
    pub fn tile_size(&self) -> usize {
        self.pool.tile_size()
    }

    /// Returns the physical file length.
    pub fn len(&self) -> u64 {
        self.state.lock().len
    }

    /// Returns true when the file has no bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a handle on the underlying file for background I/O.
    pub fn io(&self) -> Arc<dyn FileIo> {
        Arc::clone(&self.io)
    }

    /// Returns the number of dirty tiles.
    pub fn dirty_count(&self) -> usize {
        self.state.lock().dirty.len()
    }

    fn cell(&self, tile: u64) -> Result<TileCell> {
        let len = self.state.lock().len;
        let tile_size = self.pool.tile_size() as u64;
        let io = &self.io;
        self.pool.fetch(self.id, tile, |buf| {
            let start = tile * tile_size;
            if start >= len {
                return Ok(());
            }
            let avail = (len - start).min(tile_size) as usize;
            io.read_at(start, &mut buf[..avail])
        })
    }

    /// Pins `tile` for reading.
    pub fn read_ref(&self, tile: u64) -> Result<TileRef> {
        let cell = self.cell(tile)?;
        Ok(TileRef {
            tile,
            guard: cell.read_arc(),
        })
    }

    /// Pins `tile` for writing and marks it dirty.
    pub fn write_ref(&self, tile: u64) -> Result<TileMut> {
        let cell = self.cell(tile)?;
        self.state
            .lock()
            .dirty
            .entry(tile)
            .or_insert_with(|| Arc::clone(&cell));
        Ok(TileMut {
            guard: cell.write_arc(),
        })
    }

    /// Copies bytes at `off` into `dst`; bytes past the file end read as zero.
    pub fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        let tile_size = self.pool.tile_size() as u64;
        let mut done = 0usize;
        while done < dst.len() {
            let pos = off + done as u64;
            let within = (pos % tile_size) as usize;
            let take = (tile_size as usize - within).min(dst.len() - done);
            let lease = self.read_ref(pos / tile_size)?;
            dst[done..done + take].copy_from_slice(&lease.data()[within..within + take]);
            done += take;
        }
        Ok(())
    }

    /// Copies `src` into the cached tiles at `off`.
    pub fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        let tile_size = self.pool.tile_size() as u64;
        let mut done = 0usize;
        while done < src.len() {
            let pos = off + done as u64;
            let within = (pos % tile_size) as usize;
            let take = (tile_size as usize - within).min(src.len() - done);
            let mut lease = self.write_ref(pos / tile_size)?;
            lease.data_mut()[within..within + take].copy_from_slice(&src[done..done + take]);
            done += take;
        }
        Ok(())
    }

    /// Writes zeros over `len` bytes at `off`.
    pub fn zero_range(&self, off: u64, len: u64) -> Result<()> {
        let tile_size = self.pool.tile_size() as u64;
        let end = off + len;
        let mut pos = off;
        while pos < end {
            let within = (pos % tile_size) as usize;
            let take = (tile_size - within as u64).min(end - pos) as usize;
            let mut lease = self.write_ref(pos / tile_size)?;
            lease.data_mut()[within..within + take].fill(0);
            pos += take as u64;
        }
        Ok(())
    }

    /// Moves the dirty set out as images; later writes start a new dirty set.
    pub fn take_dirty(&self) -> ImageBatch {
        let dirty = std::mem::take(&mut self.state.lock().dirty);
        let images = dirty
            .into_iter()
            .map(|(tile, cell)| {
                let bytes = Box::<[u8]>::from(&cell.read()[..]);
                TileImage {
                    tile,
                    bytes,
                    pin: cell,
                }
            })
            .collect::<Vec<_>>();
        trace!(file = self.id, tiles = images.len(), "tile.take_dirty");
        ImageBatch {
            io: Arc::clone(&self.io),
            tile_size: self.pool.tile_size() as u64,
            images,
        }
    }

    /// Returns the tiles of an unwritten batch to the dirty set.
    pub fn requeue(&self, batch: ImageBatch) {
        let mut state = self.state.lock();
        for image in batch.images {
            state.dirty.entry(image.tile).or_insert(image.pin);
        }
    }

    /// Writes every dirty tile back to the file.
    ///
    /// Tiles that were not written stay dirty when an error is returned.
    pub fn flush(&self) -> Result<usize> {
        let tile_size = self.pool.tile_size() as u64;
        let mut pending = std::mem::take(&mut self.state.lock().dirty);
        let mut written = 0usize;
        while let Some((tile, cell)) = pending.pop_first() {
            let outcome = {
                let guard = cell.read();
                self.io.write_at(tile * tile_size, &guard)
            };
            if let Err(err) = outcome {
                let mut state = self.state.lock();
                state.dirty.insert(tile, cell);
                state.dirty.append(&mut pending);
                return Err(err);
            }
            written += 1;
        }
        let mut state = self.state.lock();
        state.tile_writes += written as u64;
        state.len = state.len.max(self.io.len()?);
        Ok(written)
    }

    /// Flushes file contents to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.io.sync_all()
    }

    /// Forgets every cached and dirty tile; the next read comes from disk.
    pub fn discard(&self) -> Result<()> {
        let mut state = self.state.lock();
        let dropped = state.dirty.len();
        state.dirty.clear();
        self.pool.drop_tiles(self.id, 0);
        state.len = self.io.len()?;
        debug!(file = self.id, dropped, "tile.discard");
        Ok(())
    }

    /// Sets the physical length, dropping cached tiles past a shrunk end.
    pub fn set_len(&self, len: u64) -> Result<()> {
        let tile_size = self.pool.tile_size() as u64;
        let mut state = self.state.lock();
        if len < state.len {
            let first = len.div_ceil(tile_size);
            state.dirty.retain(|tile, _| *tile < first);
            self.pool.drop_tiles(self.id, first);
        }
        self.io.truncate(len)?;
        state.len = len;
        Ok(())
    }

    /// Returns the per-file counters.
    pub fn stats(&self) -> TiledFileStats {
        let state = self.state.lock();
        TiledFileStats {
            tile_writes: state.tile_writes,
            dirty: state.dirty.len() as u64,
            len: state.len,
        }
    }

    /// Reports per-file counters under `<prefix>.*`.
    pub fn status(&self, prefix: &str, cb: &mut StatusFn<'_>) -> Result<()> {
        let stats = self.stats();
        report(cb, &format!("{prefix}.file-size"), stats.len)?;
        report(cb, &format!("{prefix}.dirty-tiles"), stats.dirty)?;
        report(cb, &format!("{prefix}.tile-writes"), stats.tile_writes)
    }
}

impl Drop for TiledFile {
    fn drop(&mut self) {
        self.pool.drop_tiles(self.id, 0);
    }
}
