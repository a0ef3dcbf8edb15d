#![forbid(unsafe_code)]

use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, trace};

use super::freelist::Freelist;
use super::header::{PartitionHeader, HEADER_LEN};
use crate::options::StoreOptions;
use crate::primitives::io::{FileIo, OpenMode};
use crate::primitives::tile::{ImageBatch, TilePool, TileRef, TiledFile};
use crate::status::{report, StatusFn};
use crate::types::{Result, StoreError};

/// Pinned view of partition bytes that lie within a single tile.
///
/// The tile stays resident while the chunk is alive; the borrow on the
/// partition keeps writers out until it is dropped.
pub struct Chunk<'a> {
    lease: TileRef,
    start: usize,
    len: usize,
    _partition: PhantomData<&'a Partition>,
}

impl Chunk<'_> {
    /// Returns the chunk bytes.
    pub fn data(&self) -> &[u8] {
        &self.lease.data()[self.start..self.start + self.len]
    }

    /// Number of bytes in the chunk.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true for an empty chunk.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// One backing file of the partitioned map.
///
/// Offsets are partition-local and exclude the header. The virtual size
/// counts bytes in use; the file is kept at least `HEADER_LEN` + virtual
/// size long and grows in `grow_increment` steps.
pub struct Partition {
    index: u32,
    path: PathBuf,
    file: Option<TiledFile>,
    size: u64,
    generation: u64,
    freelist: Freelist,
    touched: bool,
    options: Arc<StoreOptions>,
}

impl Partition {
    /// Creates a closed partition for `path`.
    pub fn new(index: u32, path: impl AsRef<Path>, options: Arc<StoreOptions>) -> Self {
        Self {
            index,
            path: path.as_ref().to_path_buf(),
            file: None,
            size: 0,
            generation: 0,
            freelist: Freelist::new(),
            touched: false,
            options,
        }
    }

    /// Opens the backing file and derives the virtual size from its header.
    ///
    /// A new or empty file under [`OpenMode::Create`] gets a fresh header
    /// stamped with `generation`.
    pub fn open(&mut self, pool: &TilePool, mode: OpenMode, generation: u64) -> Result<()> {
        if self.file.is_some() {
            return Ok(());
        }
        let file = TiledFile::open(pool, &self.path, mode)?;
        if file.is_empty() {
            if mode == OpenMode::Existing {
                return Err(StoreError::format(format!(
                    "partition {} is empty",
                    self.path.display()
                )));
            }
            let len = self
                .options
                .round_to_increment(HEADER_LEN + self.options.init_map_bytes);
            file.set_len(len)?;
            let header = self.header_with(0, generation);
            file.write_at(0, &header.encode())?;
            file.flush()?;
            self.size = 0;
            self.generation = generation;
            debug!(partition = self.index, len, "smap.partition.create");
        } else {
            let header = self.read_header(&file)?;
            self.size = header.virtual_size;
            self.generation = header.generation;
            debug!(
                partition = self.index,
                size = self.size,
                generation = self.generation,
                "smap.partition.open"
            );
        }
        self.file = Some(file);
        self.touched = true;
        Ok(())
    }

    fn header_with(&self, virtual_size: u64, generation: u64) -> PartitionHeader {
        PartitionHeader {
            tile_size: self.options.tile_size as u32,
            index: self.index,
            virtual_size,
            generation,
        }
    }

    fn read_header(&self, file: &TiledFile) -> Result<PartitionHeader> {
        let mut raw = [0u8; HEADER_LEN as usize];
        file.read_at(0, &mut raw)?;
        let header = PartitionHeader::decode(&raw)?;
        if header.index != self.index {
            return Err(StoreError::format(format!(
                "{} holds partition {}, expected {}",
                self.path.display(),
                header.index,
                self.index
            )));
        }
        if header.tile_size as usize != self.options.tile_size {
            return Err(StoreError::format(format!(
                "{} was written with tile size {}, store uses {}",
                self.path.display(),
                header.tile_size,
                self.options.tile_size
            )));
        }
        if HEADER_LEN + header.virtual_size > file.len() {
            return Err(StoreError::format(format!(
                "{} virtual size {} exceeds file length {}",
                self.path.display(),
                header.virtual_size,
                file.len()
            )));
        }
        Ok(header)
    }

    /// Partition index.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns true while the tile handle is held.
    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Bytes in use.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Generation stamped into the header by the last fence.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Physical data capacity beyond the header.
    pub fn capacity(&self) -> Result<u64> {
        Ok(self.file()?.len().saturating_sub(HEADER_LEN))
    }

    /// Returns the freelist.
    pub fn freelist(&self) -> &Freelist {
        &self.freelist
    }

    pub(crate) fn replace_freelist(&mut self, freelist: Freelist) {
        self.freelist = freelist;
    }

    /// True when the file may differ from its last backed-up image.
    pub(crate) fn is_touched(&self) -> bool {
        self.touched
    }

    pub(crate) fn set_touched(&mut self, touched: bool) {
        self.touched = touched;
    }

    fn file(&self) -> Result<&TiledFile> {
        self.file
            .as_ref()
            .ok_or_else(|| StoreError::protocol(format!("partition {} is not open", self.index)))
    }

    pub(crate) fn io(&self) -> Result<Arc<dyn FileIo>> {
        Ok(self.file()?.io())
    }

    fn check_range(&self, offset: u64, len: u64) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(StoreError::invalid(format!(
                "range [{offset}, +{len}) outside partition {} of size {}",
                self.index, self.size
            ))),
        }
    }

    /// Reads the big-endian word at `offset`.
    pub fn get(&self, offset: u64) -> Result<u64> {
        let mut raw = [0u8; 8];
        self.read(offset, &mut raw)?;
        Ok(u64::from_be_bytes(raw))
    }

    /// Reads `dst.len()` bytes at `offset`.
    pub fn read(&self, offset: u64, dst: &mut [u8]) -> Result<()> {
        self.check_range(offset, dst.len() as u64)?;
        self.file()?.read_at(HEADER_LEN + offset, dst)
    }

    /// Pins the tile holding `offset` and returns up to `len` bytes of it.
    pub fn get_chunk(&self, offset: u64, len: u64) -> Result<Chunk<'_>> {
        self.check_range(offset, len.max(1))?;
        let tile_size = self.options.tile_size as u64;
        let pos = HEADER_LEN + offset;
        let start = (pos % tile_size) as usize;
        let take = (tile_size - start as u64).min(len) as usize;
        let lease = self.file()?.read_ref(pos / tile_size)?;
        Ok(Chunk {
            lease,
            start,
            len: take,
            _partition: PhantomData,
        })
    }

    /// Writes the big-endian word `value` at `offset`.
    pub fn put(&mut self, offset: u64, value: u64) -> Result<()> {
        self.mem_to_file(offset, &value.to_be_bytes())
    }

    /// Writes `bytes` at `offset`, extending the virtual size when needed.
    pub fn mem_to_file(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        let end = self.check_limit(offset, bytes.len() as u64)?;
        self.grow(end)?;
        let file = self.file()?;
        if offset > self.size {
            file.zero_range(HEADER_LEN + self.size, offset - self.size)?;
        }
        file.write_at(HEADER_LEN + offset, bytes)?;
        if end > self.size {
            trace!(partition = self.index, from = self.size, to = end, "smap.partition.extend");
            self.size = end;
        }
        Ok(())
    }

    fn check_limit(&self, offset: u64, len: u64) -> Result<u64> {
        match offset.checked_add(len) {
            Some(end) if end <= self.options.max_partition_bytes => Ok(end),
            _ => Err(StoreError::exhausted(format!(
                "partition {} cannot grow past {} bytes",
                self.index, self.options.max_partition_bytes
            ))),
        }
    }

    /// Moves `n` bytes from `src` to `dst`; the ranges may overlap.
    pub fn copy(&mut self, dst: u64, src: u64, n: u64) -> Result<()> {
        self.check_range(src, n)?;
        if n == 0 || dst == src {
            return Ok(());
        }
        let step = self.options.tile_size as u64;
        let mut buf = vec![0u8; step.min(n) as usize];
        if dst < src {
            let mut done = 0;
            while done < n {
                let take = step.min(n - done);
                let part = &mut buf[..take as usize];
                self.read(src + done, part)?;
                self.mem_to_file(dst + done, part)?;
                done += take;
            }
        } else {
            let mut left = n;
            while left > 0 {
                let take = step.min(left);
                left -= take;
                let part = &mut buf[..take as usize];
                self.read(src + left, part)?;
                self.mem_to_file(dst + left, part)?;
            }
        }
        Ok(())
    }

    /// Ensures physical capacity for a virtual size of `target`.
    pub fn grow(&mut self, target: u64) -> Result<()> {
        let needed = HEADER_LEN + target;
        let file = self.file()?;
        if needed <= file.len() {
            return Ok(());
        }
        let len = self.options.round_to_increment(needed);
        file.set_len(len)?;
        self.touched = true;
        debug!(partition = self.index, len, "smap.partition.grow");
        Ok(())
    }

    /// Reserves `size` bytes, reusing freed space before extending.
    pub fn alloc(&mut self, size: u64) -> Result<u64> {
        if size == 0 {
            return Err(StoreError::invalid("allocation of zero bytes"));
        }
        if let Some(offset) = self.freelist.take_best_fit(size) {
            trace!(partition = self.index, offset, size, "smap.alloc.reuse");
            return Ok(offset);
        }
        let offset = self.size;
        let end = self.check_limit(offset, size)?;
        self.grow(end)?;
        self.size = end;
        trace!(partition = self.index, offset, size, "smap.alloc.extend");
        Ok(offset)
    }

    /// Returns `[offset, offset + size)` to the freelist.
    pub fn free(&mut self, offset: u64, size: u64) -> Result<()> {
        self.check_range(offset, size)?;
        self.freelist.insert(offset, size)
    }

    /// Shrinks the virtual size to `size`; the dropped bytes read as zero.
    pub fn truncate(&mut self, size: u64) -> Result<()> {
        if size > self.size {
            return Err(StoreError::invalid(format!(
                "truncate to {size} would grow partition {} of size {}",
                self.index, self.size
            )));
        }
        self.file()?
            .zero_range(HEADER_LEN + size, self.size - size)?;
        self.freelist.truncate(size);
        self.size = size;
        Ok(())
    }

    /// Stamps the header for `generation` and takes the dirty tiles.
    pub(crate) fn fence(&mut self, generation: u64) -> Result<ImageBatch> {
        let header = self.header_with(self.size, generation);
        let file = self.file()?;
        file.write_at(0, &header.encode())?;
        let batch = file.take_dirty();
        self.generation = generation;
        Ok(batch)
    }

    /// Hands a fenced batch back and rewrites the header with `generation`.
    pub(crate) fn unfence(&mut self, batch: ImageBatch, generation: u64) -> Result<()> {
        self.touched = true;
        let Some(file) = &self.file else {
            return Ok(());
        };
        file.requeue(batch);
        let header = self.header_with(self.size, generation);
        file.write_at(0, &header.encode())?;
        self.generation = generation;
        Ok(())
    }

    /// Rewrites the header with `generation` and makes it durable.
    pub(crate) fn stamp(&mut self, generation: u64) -> Result<()> {
        let header = self.header_with(self.size, generation);
        let file = self.file()?;
        file.write_at(0, &header.encode())?;
        file.flush()?;
        file.sync()?;
        self.generation = generation;
        debug!(partition = self.index, generation, "smap.partition.stamp");
        Ok(())
    }

    /// Physical file length, header included.
    pub(crate) fn file_len(&self) -> Result<u64> {
        Ok(self.file()?.len())
    }

    /// Drops cached state and re-reads the header from disk.
    pub(crate) fn reload(&mut self) -> Result<()> {
        let file = self.file()?;
        file.discard()?;
        let header = self.read_header(file)?;
        self.size = header.virtual_size;
        self.generation = header.generation;
        self.touched = true;
        debug!(partition = self.index, size = self.size, "smap.partition.reload");
        Ok(())
    }

    /// Flushes dirty tiles and releases the tile handle. Idempotent.
    pub fn finish(&mut self) -> Result<()> {
        let Some(file) = self.file.as_ref() else {
            return Ok(());
        };
        let header = self.header_with(self.size, self.generation);
        file.write_at(0, &header.encode())?;
        let written = file.flush()?;
        file.sync()?;
        if written > 0 {
            self.touched = true;
        }
        self.file = None;
        debug!(partition = self.index, written, "smap.partition.finish");
        Ok(())
    }

    /// Drops the tile handle without writing anything.
    pub(crate) fn abandon(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = file.discard();
        }
    }

    /// Reports `path` and `size` under `<prefix>`.
    pub fn status(&self, prefix: &str, cb: &mut StatusFn<'_>) -> Result<()> {
        report(cb, &format!("{prefix}.path"), self.path.display())?;
        report(cb, &format!("{prefix}.size"), self.size)?;
        if let Some(file) = &self.file {
            file.status(prefix, cb)?;
        }
        Ok(())
    }
}
