#![forbid(unsafe_code)]

//! The partitioned map store: partition table, shared tile pool, horizon
//! and the single-writer entry points.

mod map;
mod status;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::checkpoint::{
    partition_file_name, scan_partitions, BackupDir, CheckpointMarker, CheckpointPhase,
    Coordinator, Manifest,
};
use crate::options::StoreOptions;
use crate::primitives::concurrency::{DirSyncContext, StoreLock};
use crate::primitives::io::{remove_file_if_exists, DirHandle, OpenMode};
use crate::primitives::tile::TilePool;
use crate::smap::{Partition, Route, Router, PARTITIONS_MAX};
use crate::types::{Horizon, Result, SmapId, StoreError};

/// What recovery found before the partitions were loaded.
struct Recovered {
    manifest: Option<Manifest>,
    marker: Option<CheckpointMarker>,
    restored: bool,
}

/// A partitioned, mostly-append map from ids to byte ranges.
///
/// Mutating calls take `&mut self`: the store has exactly one writer. Reads
/// take `&self` and go through the tile pool's own locking.
pub struct Store {
    pub(crate) dir: PathBuf,
    pub(crate) options: Arc<StoreOptions>,
    pub(crate) router: Router,
    pub(crate) pool: TilePool,
    pub(crate) partitions: Vec<Option<Partition>>,
    pub(crate) partition_count: usize,
    pub(crate) horizon: Horizon,
    opening: bool,
    pub(crate) backup_enabled: bool,
    pub(crate) backup: BackupDir,
    pub(crate) dir_handle: DirHandle,
    pub(crate) dir_sync: DirSyncContext,
    pub(crate) checkpoint: Coordinator,
    closed: bool,
    _lock: StoreLock,
}

impl Store {
    /// Opens (or creates) the store in `dir`.
    ///
    /// An incomplete checkpoint left by a crash is rolled back here: committed
    /// backup deltas are replayed, uncommitted ones dropped, and a leftover
    /// checkpoint marker restores the partition files from the backup. The
    /// horizon of an unfinished cycle is the one its marker recorded.
    pub fn open(dir: impl AsRef<Path>, options: StoreOptions) -> Result<Self> {
        options.validate()?;
        let dir = dir.as_ref().to_path_buf();
        let dir_handle = DirHandle::open(&dir)?;
        let lock = StoreLock::acquire(dir.join(format!("{}lock", options.basename)))?;
        let router = Router::new(options.ids_per_partition)?;
        let pool = TilePool::new(options.tile_size, options.cache_tiles, options.mlock);
        let backup = BackupDir::new(&dir, &options.basename, options.tile_size);
        let backup_enabled = options.backup;
        let mut partitions = Vec::with_capacity(PARTITIONS_MAX);
        partitions.resize_with(PARTITIONS_MAX, || None);
        let mut store = Self {
            dir,
            options: Arc::new(options),
            router,
            pool,
            partitions,
            partition_count: 0,
            horizon: Horizon::default(),
            opening: true,
            backup_enabled,
            backup,
            dir_handle,
            dir_sync: DirSyncContext::new(),
            checkpoint: Coordinator::default(),
            closed: false,
            _lock: lock,
        };
        let recovered = store.recover()?;
        store.load_partitions()?;
        let horizon = store.recovered_horizon(&recovered);
        store.set_horizon(horizon)?;
        if recovered.marker.is_some() {
            store.close_interrupted_cycle()?;
        }
        store.drop_stale_backup(recovered.manifest.as_ref())?;
        store.opening = false;
        info!(
            dir = %store.dir.display(),
            partitions = store.partition_count,
            horizon = %store.horizon,
            backup = store.backup_enabled,
            "store.open"
        );
        Ok(store)
    }

    fn recover(&mut self) -> Result<Recovered> {
        let manifest = self.backup.recover()?;
        let marker = self.backup.load_marker()?;
        let mut restored = false;
        if let Some(marker) = marker {
            warn!(
                horizon = marker.horizon,
                backup = marker.backup,
                "store.recover.incomplete_checkpoint"
            );
            match &manifest {
                Some(manifest) if marker.backup && manifest.horizon >= marker.horizon => {
                    let tiles = self.backup.restore_main(manifest)?;
                    info!(tiles, horizon = manifest.horizon, "store.recover.restored");
                    restored = true;
                }
                _ if marker.backup => warn!("store.recover.marker_without_backup"),
                _ => {}
            }
        }
        Ok(Recovered {
            manifest,
            marker,
            restored,
        })
    }

    /// The committed horizon: a restored backup, else the marker of an
    /// unfinished cycle, else the newest generation the files carry.
    fn recovered_horizon(&self, recovered: &Recovered) -> Horizon {
        let manifest_horizon = recovered.manifest.as_ref().map(|m| m.horizon);
        let horizon = match recovered.marker {
            Some(marker) if recovered.restored => {
                marker.horizon.max(manifest_horizon.unwrap_or(0))
            }
            Some(marker) => marker.horizon,
            None => self
                .partitions
                .iter()
                .flatten()
                .map(Partition::generation)
                .chain(manifest_horizon)
                .max()
                .unwrap_or(0),
        };
        Horizon(horizon)
    }

    /// Rewrites every header with the recovered horizon, then drops the
    /// marker, so the next open derives the same horizon from the files.
    fn close_interrupted_cycle(&mut self) -> Result<()> {
        let horizon = self.horizon.0;
        for part in self.partitions.iter_mut().flatten() {
            part.stamp(horizon)?;
        }
        self.backup.remove_marker()?;
        self.dir_handle.sync()
    }

    /// Removes a backup that no longer describes the horizon.
    fn drop_stale_backup(&mut self, manifest: Option<&Manifest>) -> Result<()> {
        let Some(manifest) = manifest else {
            return Ok(());
        };
        if !self.backup_enabled || !self.backup.exists() {
            return Ok(());
        }
        let present = scan_partitions(&self.dir, &self.options.basename)?;
        let missing = present.iter().any(|index| manifest.partition(*index).is_none());
        if missing || manifest.horizon < self.horizon.0 {
            warn!(
                backup_horizon = manifest.horizon,
                horizon = %self.horizon,
                "store.recover.stale_backup"
            );
            self.backup.remove()?;
        }
        Ok(())
    }

    fn load_partitions(&mut self) -> Result<()> {
        let generation = self.horizon.0;
        for index in scan_partitions(&self.dir, &self.options.basename)? {
            let slot = index as usize;
            if slot >= PARTITIONS_MAX {
                warn!(partition = index, "store.open.partition_out_of_range");
                continue;
            }
            let mut part = Partition::new(index, self.partition_path(index), Arc::clone(&self.options));
            part.open(&self.pool, OpenMode::Existing, generation)?;
            self.partitions[slot] = Some(part);
            self.partition_count = self.partition_count.max(slot + 1);
        }
        Ok(())
    }

    /// Store directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Options the store was opened with.
    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    /// Shared tile pool.
    pub fn pool(&self) -> &TilePool {
        &self.pool
    }

    /// The last externally consistent generation.
    pub fn horizon(&self) -> Horizon {
        self.horizon
    }

    /// Overrides the horizon; only valid while the store is opening.
    pub fn set_horizon(&mut self, horizon: Horizon) -> Result<()> {
        if !self.opening {
            return Err(StoreError::protocol(
                "the horizon can only be set while the store is opening",
            ));
        }
        debug!(from = %self.horizon, to = %horizon, "store.set_horizon");
        self.horizon = horizon;
        Ok(())
    }

    /// One past the highest occupied partition index.
    pub fn partition_count(&self) -> usize {
        self.partition_count
    }

    /// Returns true when backups are kept.
    pub fn backup_enabled(&self) -> bool {
        self.backup_enabled
    }

    /// Current checkpoint phase.
    pub fn checkpoint_phase(&self) -> CheckpointPhase {
        self.checkpoint.phase()
    }

    /// Routes `id` to its partition and slot.
    pub fn route(&self, id: SmapId) -> Result<Route> {
        self.router.route(id)
    }

    /// Path of partition `index`.
    pub fn partition_path(&self, index: u32) -> PathBuf {
        self.dir.join(partition_file_name(&self.options.basename, index))
    }

    /// Returns partition `index` if it is occupied.
    pub fn partition(&self, index: u32) -> Option<&Partition> {
        self.partitions.get(index as usize)?.as_ref()
    }

    /// Returns partition `index`, creating and opening it when needed.
    pub fn partition_mut(&mut self, index: u32) -> Result<&mut Partition> {
        let slot = index as usize;
        if slot >= PARTITIONS_MAX {
            return Err(StoreError::exhausted(format!(
                "partition {index} beyond table of {PARTITIONS_MAX}"
            )));
        }
        let created = self.partitions[slot].is_none();
        if created {
            let part = Partition::new(index, self.partition_path(index), Arc::clone(&self.options));
            self.partitions[slot] = Some(part);
        }
        let generation = self.horizon.0;
        let index_len = self.options.index_region_len();
        let Some(part) = self.partitions[slot].as_mut() else {
            return Err(StoreError::protocol(format!("partition {index} vanished")));
        };
        if !part.is_open() {
            let opened = part.open(&self.pool, OpenMode::Create, generation).and_then(|()| {
                if part.size() == 0 {
                    part.alloc(index_len)?;
                }
                Ok(())
            });
            if let Err(err) = opened {
                if created {
                    self.partitions[slot] = None;
                }
                return Err(err);
            }
        }
        if slot >= self.partition_count {
            self.partition_count = slot + 1;
            info!(partition = index, count = self.partition_count, "store.partition_count");
        }
        self.partitions[slot]
            .as_mut()
            .ok_or_else(|| StoreError::protocol(format!("partition {index} vanished")))
    }

    /// Reserves `size` bytes in partition `index`.
    pub fn alloc(&mut self, index: u32, size: u64) -> Result<u64> {
        self.partition_mut(index)?.alloc(size)
    }

    /// Returns `[offset, offset + size)` of partition `index` to its freelist.
    pub fn free(&mut self, index: u32, offset: u64, size: u64) -> Result<()> {
        match self.partitions.get_mut(index as usize).and_then(Option::as_mut) {
            Some(part) => part.free(offset, size),
            None => Err(StoreError::invalid(format!("partition {index} is not occupied"))),
        }
    }

    /// Enables or disables backups; only between checkpoints.
    pub fn set_backup(&mut self, enabled: bool) -> Result<()> {
        self.settle_checkpoint()?;
        if self.checkpoint.phase() != CheckpointPhase::Live {
            return Err(StoreError::protocol(format!(
                "backups cannot be toggled while the checkpoint is {}",
                self.checkpoint.phase()
            )));
        }
        if enabled && !self.backup_enabled {
            self.backup.remove()?;
            for part in self.partitions.iter_mut().flatten() {
                part.set_touched(true);
            }
        }
        self.backup_enabled = enabled;
        info!(enabled, "store.set_backup");
        Ok(())
    }

    /// Drops every partition and the backup, leaving an empty store.
    pub fn truncate(&mut self) -> Result<()> {
        self.settle_checkpoint()?;
        if self.checkpoint.phase() != CheckpointPhase::Live {
            return Err(StoreError::protocol(format!(
                "truncate is not allowed while the checkpoint is {}",
                self.checkpoint.phase()
            )));
        }
        self.dir_sync.wait()?;
        for slot in self.partitions.iter_mut() {
            if let Some(mut part) = slot.take() {
                part.abandon();
                remove_file_if_exists(part.path())?;
            }
        }
        self.partition_count = 0;
        self.checkpoint.forget_freelists();
        self.backup.remove()?;
        self.backup.remove_marker()?;
        self.dir_handle.sync()?;
        info!(dir = %self.dir.display(), "store.truncate");
        Ok(())
    }

    /// Flushes every partition and releases the store.
    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let mut first_err = None;
        if let Err(err) = self.settle_checkpoint() {
            first_err.get_or_insert(err);
        }
        self.requeue_unwritten();
        if self.checkpoint.phase() != CheckpointPhase::Live {
            warn!(phase = %self.checkpoint.phase(), "store.close.checkpoint_incomplete");
        }
        if let Err(err) = self.dir_sync.wait() {
            first_err.get_or_insert(err);
        }
        for part in self.partitions.iter_mut().flatten() {
            if let Err(err) = part.finish() {
                warn!(partition = part.index(), error = %err, "store.close.finish_failed");
                first_err.get_or_insert(err);
            }
        }
        info!(dir = %self.dir.display(), horizon = %self.horizon, "store.close");
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Deletes every file of the store, including its backup.
    pub fn destroy(mut self) -> Result<()> {
        self.closed = true;
        if let Err(err) = self.settle_checkpoint() {
            warn!(error = %err, "store.destroy.pending_checkpoint_failed");
        }
        let _ = self.dir_sync.wait();
        for slot in self.partitions.iter_mut() {
            if let Some(mut part) = slot.take() {
                part.abandon();
            }
        }
        for index in scan_partitions(&self.dir, &self.options.basename)? {
            remove_file_if_exists(&self.partition_path(index))?;
        }
        self.backup.remove()?;
        self.backup.remove_marker()?;
        remove_file_if_exists(&self.dir.join(format!("{}lock", self.options.basename)))?;
        self.dir_handle.sync()?;
        info!(dir = %self.dir.display(), "store.destroy");
        Ok(())
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!(error = %err, "store.drop.close_failed");
        }
    }
}
