#![forbid(unsafe_code)]

//! Multi-phase checkpoint and backup protocol.
//!
//! A cycle moves the store through `start_writes`, `finish_writes`,
//! `sync_backup`, `finish_backup` and `sync_directory`. Every phase can run
//! on a background thread; the next phase call settles the previous one and
//! reports its failure. A failed phase leaves the cycle failed: every call
//! but `rollback` is then refused. `rollback` returns the store to its
//! horizon from any phase before the backup is committed.

mod backup;
mod state;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

pub use backup::{
    partition_file_name, scan_partitions, BackupDir, CheckpointMarker, DeltaRecord, Manifest,
    ManifestPartition, MANIFEST_FILE,
};
pub use state::{CheckpointOp, CheckpointPhase};

use crate::primitives::concurrency::Completion;
use crate::primitives::io::{remove_file_if_exists, DirHandle, FileIo, OpenMode};
use crate::primitives::tile::{ImageBatch, TilePool};
use crate::smap::{Freelist, Partition, PARTITIONS_MAX};
use crate::store::Store;
use crate::types::{Horizon, Result, StoreError};

/// A partition captured at the fence.
struct FencedPartition {
    index: u32,
    io: Arc<dyn FileIo>,
    len: u64,
    needs_backup: bool,
}

enum PhaseEffect {
    Nothing,
    Commit,
}

struct PendingPhase {
    op: CheckpointOp,
    completion: Completion,
    effect: PhaseEffect,
}

/// Checkpoint bookkeeping owned by the store.
#[derive(Default)]
pub(crate) struct Coordinator {
    phase: CheckpointPhase,
    pending: Option<PendingPhase>,
    generation: Horizon,
    fenced: Arc<Vec<FencedPartition>>,
    backup_active: bool,
    writes_hard: bool,
    backup_hard: bool,
    deltas: Arc<Mutex<Vec<DeltaRecord>>>,
    unwritten: Arc<Mutex<Vec<(u32, ImageBatch)>>>,
    failed: bool,
    fence_freelists: HashMap<u32, Freelist>,
    horizon_freelists: HashMap<u32, Freelist>,
}

impl Coordinator {
    pub(crate) fn phase(&self) -> CheckpointPhase {
        self.phase
    }

    pub(crate) fn forget_freelists(&mut self) {
        self.fence_freelists.clear();
        self.horizon_freelists.clear();
    }

    fn horizon_freelist(&self, index: u32) -> Freelist {
        self.horizon_freelists.get(&index).cloned().unwrap_or_default()
    }

    fn reset(&mut self) {
        self.phase = CheckpointPhase::Live;
        self.pending = None;
        self.fenced = Arc::new(Vec::new());
        self.deltas.lock().clear();
        self.unwritten.lock().clear();
        self.failed = false;
        self.fence_freelists.clear();
        self.writes_hard = false;
        self.backup_hard = false;
    }
}

impl Store {
    /// Waits for the running phase and applies its outcome.
    pub(crate) fn settle_checkpoint(&mut self) -> Result<()> {
        let Some(pending) = self.checkpoint.pending.take() else {
            return Ok(());
        };
        if let Err(err) = pending.completion.wait() {
            self.fail_phase(pending.op, &err);
            return Err(err);
        }
        if let PhaseEffect::Commit = pending.effect {
            self.commit_generation();
        }
        Ok(())
    }

    /// Marks the cycle failed; from here on only `rollback` is accepted.
    fn fail_phase(&mut self, op: CheckpointOp, err: &StoreError) {
        warn!(op = ?op, error = %err, "checkpoint.phase_failed");
        match op {
            CheckpointOp::FinishBackup => {
                self.checkpoint.phase = CheckpointPhase::BackupSyncing;
                self.checkpoint.failed = true;
            }
            CheckpointOp::StartWrites | CheckpointOp::FinishWrites | CheckpointOp::SyncBackup => {
                self.checkpoint.failed = true;
            }
            CheckpointOp::SyncDirectory | CheckpointOp::RemoveBackup | CheckpointOp::Rollback => {}
        }
    }

    fn commit_generation(&mut self) {
        let generation = self.checkpoint.generation;
        self.horizon = generation;
        self.checkpoint.horizon_freelists = std::mem::take(&mut self.checkpoint.fence_freelists);
        info!(horizon = %generation, "checkpoint.finish_backup.committed");
    }

    fn begin_phase(&mut self, op: CheckpointOp) -> Result<CheckpointPhase> {
        self.settle_checkpoint()?;
        if self.checkpoint.failed {
            return Err(StoreError::protocol(format!(
                "{op:?} is not allowed after a failed checkpoint phase; roll back first"
            )));
        }
        self.checkpoint.phase.transition(op)
    }

    /// Returns true when a phase of the current cycle has failed.
    pub fn checkpoint_failed(&self) -> bool {
        self.checkpoint.failed
    }

    fn track_phase(
        &mut self,
        op: CheckpointOp,
        completion: Result<Completion>,
        effect: PhaseEffect,
        block: bool,
    ) -> Result<Completion> {
        let completion = match completion {
            Ok(completion) => completion,
            Err(err) => {
                self.fail_phase(op, &err);
                return Err(err);
            }
        };
        self.checkpoint.pending = Some(PendingPhase {
            op,
            completion: completion.clone(),
            effect,
        });
        if block {
            self.settle_checkpoint()?;
        }
        Ok(completion)
    }

    /// Returns true while a phase is still running in the background.
    pub fn checkpoint_pending(&self) -> bool {
        self.checkpoint
            .pending
            .as_ref()
            .is_some_and(|pending| !pending.completion.is_complete())
    }

    /// Waits for any background phase and directory sync.
    pub fn checkpoint_wait(&mut self) -> Result<()> {
        self.settle_checkpoint()?;
        self.dir_sync.wait()
    }

    /// Fences the next generation and writes its dirty tiles to the
    /// partition files. Writes issued afterwards belong to the generation
    /// after it.
    pub fn start_writes(&mut self, hard_sync: bool, block: bool) -> Result<Completion> {
        let next = self.begin_phase(CheckpointOp::StartWrites)?;
        let generation = self.horizon.next();
        let backup_active = self.backup_enabled;
        let marker = CheckpointMarker {
            horizon: self.horizon.0,
            backup: backup_active,
        };
        self.backup.create_marker(marker, hard_sync)?;

        let mut fenced = Vec::new();
        let mut batches = Vec::new();
        let mut freelists = HashMap::new();
        let mut failure = None;
        for part in self.partitions[..self.partition_count].iter_mut().flatten() {
            match fence_partition(part, &self.pool, generation) {
                Ok((entry, batch)) => {
                    freelists.insert(entry.index, part.freelist().clone());
                    fenced.push(entry);
                    batches.push((part.index(), batch));
                }
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }
        if let Some(err) = failure {
            let horizon = self.horizon.0;
            for (index, batch) in batches {
                if let Some(part) = self.partitions[index as usize].as_mut() {
                    if let Err(unfence_err) = part.unfence(batch, horizon) {
                        warn!(partition = index, error = %unfence_err, "checkpoint.unfence_failed");
                    }
                }
            }
            self.backup.remove_marker()?;
            return Err(err);
        }

        let tiles: usize = batches.iter().map(|(_, batch)| batch.len()).sum();
        debug!(
            generation = %generation,
            partitions = fenced.len(),
            tiles,
            "checkpoint.start_writes.applied"
        );
        self.checkpoint.phase = next;
        self.checkpoint.generation = generation;
        self.checkpoint.fenced = Arc::new(fenced);
        self.checkpoint.backup_active = backup_active;
        self.checkpoint.writes_hard = false;
        self.checkpoint.backup_hard = false;
        self.checkpoint.deltas.lock().clear();
        self.checkpoint.fence_freelists = freelists;
        *self.checkpoint.unwritten.lock() = batches;

        let unwritten = Arc::clone(&self.checkpoint.unwritten);
        let completion = Completion::run("start-writes", block, move || {
            let mut batches = unwritten.lock();
            for (_, batch) in batches.iter_mut() {
                batch.write()?;
            }
            batches.clear();
            Ok(())
        });
        self.track_phase(CheckpointOp::StartWrites, completion, PhaseEffect::Nothing, block)
    }

    /// Declares the fenced writes complete; with `hard_sync` the partition
    /// files are fsynced first.
    pub fn finish_writes(&mut self, hard_sync: bool, block: bool) -> Result<Completion> {
        let next = self.begin_phase(CheckpointOp::FinishWrites)?;
        self.checkpoint.phase = next;
        self.checkpoint.writes_hard = hard_sync;
        let fenced = Arc::clone(&self.checkpoint.fenced);
        let completion = Completion::run("finish-writes", block, move || {
            if hard_sync {
                for part in fenced.iter() {
                    part.io.sync_all()?;
                }
            }
            Ok(())
        });
        debug!(hard_sync, "checkpoint.finish_writes");
        self.track_phase(CheckpointOp::FinishWrites, completion, PhaseEffect::Nothing, block)
    }

    /// Journals every changed tile range that differs from the backup.
    pub fn sync_backup(&mut self, hard_sync: bool, block: bool) -> Result<Completion> {
        let next = self.begin_phase(CheckpointOp::SyncBackup)?;
        self.checkpoint.phase = next;
        self.checkpoint.backup_hard = hard_sync;
        if !self.checkpoint.backup_active {
            debug!("checkpoint.sync_backup.disabled");
            let completion = Ok(Completion::ready(Ok(())));
            return self.track_phase(
                CheckpointOp::SyncBackup,
                completion,
                PhaseEffect::Nothing,
                block,
            );
        }
        let backup = self.backup.clone();
        let fenced = Arc::clone(&self.checkpoint.fenced);
        let deltas = Arc::clone(&self.checkpoint.deltas);
        let generation = self.checkpoint.generation;
        let completion = Completion::run("sync-backup", block, move || {
            let mut written = Vec::new();
            for part in fenced.iter().filter(|part| part.needs_backup) {
                written.push(backup.write_delta(
                    part.index,
                    generation.0,
                    part.io.as_ref(),
                    part.len,
                    hard_sync,
                )?);
            }
            debug!(deltas = written.len(), "checkpoint.sync_backup.journaled");
            *deltas.lock() = written;
            Ok(())
        });
        self.track_phase(CheckpointOp::SyncBackup, completion, PhaseEffect::Nothing, block)
    }

    /// Commits the cycle and advances the horizon by one generation.
    ///
    /// Removing the checkpoint marker is the commit point; with backups the
    /// manifest is renamed in first. With `hard_sync`, fsyncs skipped by
    /// earlier phases are performed before the commit.
    pub fn finish_backup(&mut self, hard_sync: bool, block: bool) -> Result<Completion> {
        let next = self.begin_phase(CheckpointOp::FinishBackup)?;
        self.checkpoint.phase = next;
        let catch_up_writes = hard_sync && !self.checkpoint.writes_hard;
        let catch_up_backup = hard_sync && !self.checkpoint.backup_hard;
        let backup_active = self.checkpoint.backup_active;
        let backup = self.backup.clone();
        let fenced = Arc::clone(&self.checkpoint.fenced);
        let deltas = Arc::clone(&self.checkpoint.deltas);
        let generation = self.checkpoint.generation;
        let root = self.dir_handle.clone();
        let completion = Completion::run("finish-backup", block, move || {
            if catch_up_writes {
                for part in fenced.iter() {
                    part.io.sync_all()?;
                }
            }
            if backup_active {
                let records = deltas.lock().clone();
                if catch_up_backup {
                    for record in &records {
                        backup.sync_delta(record)?;
                    }
                }
                let mut manifest = Manifest {
                    horizon: generation.0,
                    partitions: fenced
                        .iter()
                        .map(|part| ManifestPartition {
                            index: part.index,
                            len: part.len,
                        })
                        .collect(),
                    deltas: records,
                    ..Manifest::default()
                };
                backup.store_manifest(&manifest, hard_sync)?;
                backup.roll_forward(&mut manifest, hard_sync)?;
            }
            backup.remove_marker()?;
            if hard_sync {
                root.sync()?;
            }
            Ok(())
        });
        self.track_phase(CheckpointOp::FinishBackup, completion, PhaseEffect::Commit, block)
    }

    /// Syncs the store (and backup) directory. From `BackupFinished` this
    /// completes the cycle.
    pub fn sync_directory(&mut self, hard_sync: bool, block: bool) -> Result<Completion> {
        let previous = self.checkpoint.phase;
        let next = self.begin_phase(CheckpointOp::SyncDirectory)?;
        let mut dirs = vec![self.dir_handle.clone()];
        if self.backup.path().is_dir() {
            dirs.push(DirHandle::open(self.backup.path())?);
        }
        let completion = self.dir_sync.submit(dirs, hard_sync, block)?;
        self.checkpoint.phase = next;
        if previous == CheckpointPhase::BackupFinished {
            info!(horizon = %self.horizon, hard_sync, "checkpoint.cycle_complete");
            self.checkpoint.reset();
        }
        self.track_phase(CheckpointOp::SyncDirectory, Ok(completion), PhaseEffect::Nothing, block)
    }

    /// Deletes the backup; the next `sync_backup` writes a full copy.
    pub fn remove_backup(&mut self) -> Result<()> {
        self.begin_phase(CheckpointOp::RemoveBackup)?;
        self.backup.remove()?;
        for part in self.partitions.iter_mut().flatten() {
            part.set_touched(true);
        }
        Ok(())
    }

    /// Returns the store to its horizon. Blocking.
    ///
    /// A no-op between checkpoints. Without a backup the partition files keep
    /// the fenced images: writes made after the fence are discarded, the
    /// fence-time freelists are reinstated and partitions created after the
    /// fence are deleted.
    pub fn rollback(&mut self) -> Result<()> {
        if let Err(err) = self.settle_checkpoint() {
            warn!(error = %err, "checkpoint.rollback.pending_failed");
        }
        let phase = self.checkpoint.phase;
        phase.transition(CheckpointOp::Rollback)?;
        if phase == CheckpointPhase::Live {
            debug!("checkpoint.rollback.noop");
            return Ok(());
        }
        self.dir_sync.wait()?;

        let manifest = if self.checkpoint.backup_active {
            self.backup.recover()?
        } else {
            None
        };
        match manifest {
            Some(manifest) => {
                for part in self.partitions.iter_mut().flatten() {
                    part.abandon();
                }
                let tiles = self.backup.restore_main(&manifest)?;
                self.backup.remove_marker()?;
                if manifest.horizon > self.horizon.0 {
                    self.commit_generation();
                }
                self.reload_partitions()?;
                info!(tiles, horizon = %self.horizon, "checkpoint.rollback.restored");
            }
            None => {
                warn!(phase = %phase, "checkpoint.rollback.without_backup");
                self.rollback_to_fence()?;
            }
        }
        self.checkpoint.reset();
        Ok(())
    }

    /// Settles the store on the fenced images, the only earlier state the
    /// files can return to without a backup.
    fn rollback_to_fence(&mut self) -> Result<()> {
        {
            let mut unwritten = self.checkpoint.unwritten.lock();
            for (_, batch) in unwritten.iter_mut() {
                batch.write()?;
            }
            unwritten.clear();
        }
        let fenced: Vec<u32> = self.checkpoint.fenced.iter().map(|part| part.index).collect();
        let horizon = self.horizon.0;
        for slot in 0..PARTITIONS_MAX {
            let Some(part) = self.partitions[slot].as_mut() else {
                continue;
            };
            let index = part.index();
            if !fenced.contains(&index) {
                part.abandon();
                remove_file_if_exists(part.path())?;
                self.partitions[slot] = None;
                info!(partition = index, "checkpoint.rollback.partition_dropped");
                continue;
            }
            part.open(&self.pool, OpenMode::Existing, horizon)?;
            part.reload()?;
            let mut freelist = self
                .checkpoint
                .fence_freelists
                .remove(&index)
                .unwrap_or_default();
            freelist.truncate(part.size());
            part.replace_freelist(freelist.clone());
            part.stamp(horizon)?;
            self.checkpoint.horizon_freelists.insert(index, freelist);
        }
        self.partition_count = fenced.iter().max().map_or(0, |index| *index as usize + 1);
        self.backup.remove_marker()?;
        self.dir_handle.sync()
    }

    /// Hands fenced images that a failed `start_writes` left unwritten back
    /// to their partitions.
    pub(crate) fn requeue_unwritten(&mut self) {
        let batches = std::mem::take(&mut *self.checkpoint.unwritten.lock());
        for (index, batch) in batches {
            if batch.is_empty() {
                continue;
            }
            warn!(partition = index, tiles = batch.len(), "checkpoint.requeue_unwritten");
            let generation = self.checkpoint.generation.0;
            if let Some(part) = self.partitions.get_mut(index as usize).and_then(Option::as_mut) {
                if let Err(err) = part.unfence(batch, generation) {
                    warn!(partition = index, error = %err, "checkpoint.unfence_failed");
                }
            }
        }
    }

    fn reload_partitions(&mut self) -> Result<()> {
        let present = scan_partitions(&self.dir, &self.options.basename)?;
        for slot in 0..PARTITIONS_MAX {
            let index = slot as u32;
            if present.binary_search(&index).is_err() {
                if let Some(part) = self.partitions[slot].take() {
                    info!(partition = part.index(), "checkpoint.rollback.partition_dropped");
                }
                continue;
            }
            let part = self.partitions[slot].get_or_insert_with(|| {
                Partition::new(
                    index,
                    self.dir.join(partition_file_name(&self.options.basename, index)),
                    Arc::clone(&self.options),
                )
            });
            part.open(&self.pool, OpenMode::Existing, self.horizon.0)?;
            part.replace_freelist(self.checkpoint.horizon_freelist(index));
        }
        self.partition_count = present
            .iter()
            .filter(|index| (**index as usize) < PARTITIONS_MAX)
            .max()
            .map_or(0, |index| *index as usize + 1);
        Ok(())
    }

    /// Runs a complete blocking cycle.
    pub fn checkpoint(&mut self, hard_sync: bool) -> Result<()> {
        self.start_writes(hard_sync, true)?;
        self.finish_writes(hard_sync, true)?;
        self.sync_backup(hard_sync, true)?;
        self.finish_backup(hard_sync, true)?;
        self.sync_directory(hard_sync, true)?;
        Ok(())
    }
}

fn fence_partition(
    part: &mut Partition,
    pool: &TilePool,
    generation: Horizon,
) -> Result<(FencedPartition, ImageBatch)> {
    if !part.is_open() {
        part.open(pool, OpenMode::Existing, generation.0)?;
    }
    let touched = part.is_touched();
    let io = part.io()?;
    let len = part.file_len()?;
    let batch = part.fence(generation.0)?;
    let entry = FencedPartition {
        index: part.index(),
        io,
        len,
        needs_backup: touched || !batch.is_empty(),
    };
    part.set_touched(false);
    Ok((entry, batch))
}
