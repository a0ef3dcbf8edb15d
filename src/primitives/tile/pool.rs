#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use tracing::trace;

use super::buffer::TileBuf;
use crate::status::{report, StatusFn};
use crate::types::Result;

/// Shared cell for one cached tile. A strong count above one means pinned.
pub(crate) type TileCell = Arc<RwLock<TileBuf>>;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
struct TileKey {
    file: u64,
    tile: u64,
}

/// Counters for the shared tile pool.
#[derive(Default, Clone, Debug)]
pub struct TilePoolStats {
    /// Lookups served from the cache.
    pub hits: u64,
    /// Lookups that loaded the tile from its file.
    pub misses: u64,
    /// Tiles dropped to stay within capacity.
    pub evictions: u64,
    /// Tiles currently resident.
    pub resident: u64,
    /// Tiles that could not be locked in memory.
    pub mlock_failures: u64,
}

struct PoolState {
    cache: LruCache<TileKey, TileCell>,
    stats: TilePoolStats,
}

struct PoolShared {
    tile_size: usize,
    capacity: usize,
    mlock: bool,
    next_file: AtomicU64,
    state: Mutex<PoolState>,
}

/// Cache of fixed-size file tiles shared by every partition of a store.
///
/// Capacity is soft: a tile is only evicted when it is the least recently
/// used one that nothing pins, so the pool can run over capacity while many
/// tiles are dirty or borrowed.
#[derive(Clone)]
pub struct TilePool {
    shared: Arc<PoolShared>,
}

impl TilePool {
    /// Creates a pool of `capacity` tiles of `tile_size` bytes.
    pub fn new(tile_size: usize, capacity: usize, mlock: bool) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                tile_size,
                capacity: capacity.max(1),
                mlock,
                next_file: AtomicU64::new(1),
                state: Mutex::new(PoolState {
                    cache: LruCache::unbounded(),
                    stats: TilePoolStats::default(),
                }),
            }),
        }
    }

    /// Returns the tile size in bytes.
    pub fn tile_size(&self) -> usize {
        self.shared.tile_size
    }

    /// Returns the soft capacity in tiles.
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Returns a snapshot of the pool counters.
    pub fn stats(&self) -> TilePoolStats {
        let state = self.shared.state.lock();
        let mut stats = state.stats.clone();
        stats.resident = state.cache.len() as u64;
        stats
    }

    pub(crate) fn register_file(&self) -> u64 {
        self.shared.next_file.fetch_add(1, Ordering::Relaxed)
    }

    /// Returns the cached tile, loading it through `load` on a miss.
    ///
    /// The pool lock is released while `load` runs, so a miss in one file
    /// does not stall lookups in the others. When two callers miss the same
    /// tile, the first insert wins and the other buffer is dropped.
    pub(crate) fn fetch<F>(&self, file: u64, tile: u64, load: F) -> Result<TileCell>
    where
        F: FnOnce(&mut [u8]) -> Result<()>,
    {
        let key = TileKey { file, tile };
        {
            let mut state = self.shared.state.lock();
            if let Some(cell) = state.cache.get(&key) {
                let cell = Arc::clone(cell);
                state.stats.hits += 1;
                return Ok(cell);
            }
        }

        let mut buf = TileBuf::zeroed(self.shared.tile_size, self.shared.mlock);
        let mlock_failed = self.shared.mlock && !buf.is_locked();
        load(&mut buf)?;

        let mut state = self.shared.state.lock();
        if mlock_failed {
            state.stats.mlock_failures += 1;
        }
        state.stats.misses += 1;
        if let Some(raced) = state.cache.get(&key) {
            trace!(file, tile, "tile.load_raced");
            return Ok(Arc::clone(raced));
        }
        let cell: TileCell = Arc::new(RwLock::new(buf));
        state.cache.put(key, Arc::clone(&cell));
        self.evict_unpinned(&mut state);
        Ok(cell)
    }

    fn evict_unpinned(&self, state: &mut PoolState) {
        while state.cache.len() > self.shared.capacity {
            let victim = state
                .cache
                .iter()
                .rev()
                .find(|(_, cell)| Arc::strong_count(cell) == 1)
                .map(|(key, _)| *key);
            let Some(key) = victim else {
                break;
            };
            state.cache.pop(&key);
            state.stats.evictions += 1;
            trace!(file = key.file, tile = key.tile, "tile.evict");
        }
    }

    /// Drops every cached tile of `file` at or beyond `first_tile`.
    pub(crate) fn drop_tiles(&self, file: u64, first_tile: u64) {
        let mut state = self.shared.state.lock();
        let keys: Vec<TileKey> = state
            .cache
            .iter()
            .filter(|(key, _)| key.file == file && key.tile >= first_tile)
            .map(|(key, _)| *key)
            .collect();
        for key in keys {
            state.cache.pop(&key);
        }
    }

    /// Reports pool counters under `<prefix>.tile.*`.
    pub fn status(&self, prefix: &str, cb: &mut StatusFn<'_>) -> Result<()> {
        let stats = self.stats();
        report(cb, &format!("{prefix}.tile.size"), self.tile_size())?;
        report(cb, &format!("{prefix}.tile.capacity"), self.capacity())?;
        report(cb, &format!("{prefix}.tile.resident"), stats.resident)?;
        report(cb, &format!("{prefix}.tile.hits"), stats.hits)?;
        report(cb, &format!("{prefix}.tile.misses"), stats.misses)?;
        report(cb, &format!("{prefix}.tile.evictions"), stats.evictions)?;
        if self.shared.mlock {
            report(cb, &format!("{prefix}.tile.mlock-failures"), stats.mlock_failures)?;
        }
        Ok(())
    }
}
