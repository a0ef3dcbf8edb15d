#![forbid(unsafe_code)]

use std::fmt;

use crate::types::{Result, StoreError};

/// Where the store is in the checkpoint cycle.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub enum CheckpointPhase {
    /// No checkpoint in progress.
    #[default]
    Live,
    /// The generation is fenced and its tiles are being written.
    WritesStarted,
    /// All fenced tiles are written.
    WritesFinished,
    /// Changed tiles are being copied into the backup.
    BackupSyncing,
    /// The backup is committed and the horizon advanced.
    BackupFinished,
}

/// Checkpoint calls that move the phase.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CheckpointOp {
    /// Fence a generation.
    StartWrites,
    /// Declare fenced writes complete.
    FinishWrites,
    /// Copy changed ranges into the backup.
    SyncBackup,
    /// Commit the backup and advance the horizon.
    FinishBackup,
    /// Sync directory metadata.
    SyncDirectory,
    /// Delete the backup.
    RemoveBackup,
    /// Return to the horizon.
    Rollback,
}

impl CheckpointPhase {
    /// Stable lower-case name used in logs and status output.
    pub fn as_str(self) -> &'static str {
        match self {
            CheckpointPhase::Live => "live",
            CheckpointPhase::WritesStarted => "writes-started",
            CheckpointPhase::WritesFinished => "writes-finished",
            CheckpointPhase::BackupSyncing => "backup-syncing",
            CheckpointPhase::BackupFinished => "backup-finished",
        }
    }

    /// Returns the phase after `op`, or a protocol error if `op` is not
    /// allowed from this phase.
    pub fn transition(self, op: CheckpointOp) -> Result<CheckpointPhase> {
        use CheckpointOp as Op;
        use CheckpointPhase as P;
        let next = match (self, op) {
            (P::Live, Op::StartWrites) => P::WritesStarted,
            (P::WritesStarted, Op::FinishWrites) => P::WritesFinished,
            (P::WritesFinished, Op::SyncBackup) => P::BackupSyncing,
            (P::BackupSyncing, Op::FinishBackup) => P::BackupFinished,
            (P::BackupFinished, Op::SyncDirectory) => P::Live,
            (P::Live | P::WritesFinished | P::BackupSyncing, Op::SyncDirectory) => self,
            (P::Live | P::BackupFinished, Op::RemoveBackup) => self,
            (P::WritesStarted | P::WritesFinished | P::BackupSyncing, Op::Rollback) => P::Live,
            (P::Live, Op::Rollback) => P::Live,
            _ => {
                return Err(StoreError::protocol(format!(
                    "{op:?} is not allowed while the checkpoint is {}",
                    self.as_str()
                )))
            }
        };
        Ok(next)
    }
}

impl fmt::Display for CheckpointPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
