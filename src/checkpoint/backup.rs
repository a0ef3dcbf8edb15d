#![forbid(unsafe_code)]

//! On-disk backup: shadow copies of every partition as of the horizon, a
//! JSON manifest, per-cycle delta journals and the checkpoint marker.
//!
//! A cycle first writes one delta journal per changed partition, then
//! commits them by renaming a manifest that lists them. Only after the
//! rename are the deltas applied to the shadows, so a crash either loses
//! the whole cycle (uncommitted deltas are deleted at open) or replays it
//! (committed deltas are applied again).

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::primitives::io::{remove_file_if_exists, DirHandle, FileIo, OpenMode, StdFileIo};
use crate::types::{compute_crc32, range_crc32, read_u32, read_u64, Result, StoreError};

/// Name of the manifest inside the backup directory.
pub const MANIFEST_FILE: &str = "manifest.json";

const MANIFEST_VERSION: u32 = 1;
const DELTA_MAGIC: [u8; 8] = *b"PMAPDLTA";
const DELTA_VERSION: u32 = 1;
const DELTA_HEADER_LEN: usize = 48;
const DELTA_RECORD_HEADER: usize = 16;
const DELTA_MARK: &str = ".delta-";

/// Committed backup state.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Format version.
    pub version: u32,
    /// Horizon the shadows represent once `deltas` are applied.
    pub horizon: u64,
    /// Tile size of every shadow and delta.
    pub tile_size: usize,
    /// Partitions that existed at the horizon, with their file lengths.
    pub partitions: Vec<ManifestPartition>,
    /// Committed deltas not yet applied to the shadows.
    pub deltas: Vec<DeltaRecord>,
}

/// Contents of the checkpoint marker.
///
/// The marker exists from `start_writes` until the cycle commits. While it
/// exists, partition headers may already carry the next generation, so the
/// committed horizon is taken from here.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMarker {
    /// Horizon committed when the cycle started.
    pub horizon: u64,
    /// Whether the cycle journals into the backup.
    pub backup: bool,
}

/// One partition file recorded in the manifest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestPartition {
    /// Partition index.
    pub index: u32,
    /// Physical file length at the horizon.
    pub len: u64,
}

/// One delta journal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaRecord {
    /// Partition index.
    pub index: u32,
    /// File name inside the backup directory.
    pub file: String,
    /// Number of tiles in the journal.
    pub tiles: u64,
    /// Partition file length the shadow is cut to.
    pub len: u64,
}

impl Manifest {
    /// Returns the recorded length of partition `index`.
    pub fn partition(&self, index: u32) -> Option<ManifestPartition> {
        self.partitions.iter().copied().find(|p| p.index == index)
    }
}

/// File name of partition `index`.
pub fn partition_file_name(basename: &str, index: u32) -> String {
    format!("{basename}{index:04}")
}

/// Lists partition indices present in `dir`, ascending.
pub fn scan_partitions(dir: &Path, basename: &str) -> Result<Vec<u32>> {
    let mut found = Vec::new();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(found),
        Err(err) => return Err(err.into()),
    };
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let Some(digits) = name.strip_prefix(basename) else {
            continue;
        };
        if digits.len() == 4 && digits.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(index) = digits.parse::<u32>() {
                found.push(index);
            }
        }
    }
    found.sort_unstable();
    Ok(found)
}

/// Compares `src` against `dst` tile by tile and calls `on_diff` with every
/// tile of `src` whose bytes differ. Bytes past either length read as zero.
fn diff_tiles<F>(
    src: &dyn FileIo,
    src_len: u64,
    dst: Option<(&dyn FileIo, u64)>,
    tile_size: usize,
    mut on_diff: F,
) -> Result<u64>
where
    F: FnMut(u64, &[u8]) -> Result<()>,
{
    let tile = tile_size as u64;
    let mut src_buf = vec![0u8; tile_size];
    let mut dst_buf = vec![0u8; tile_size];
    let mut changed = 0;
    for tile_no in 0..src_len.div_ceil(tile) {
        let off = tile_no * tile;
        let avail = (src_len - off).min(tile) as usize;
        src.read_at(off, &mut src_buf[..avail])?;
        dst_buf[..avail].fill(0);
        if let Some((dst, dst_len)) = dst {
            if off < dst_len {
                let have = ((dst_len - off).min(avail as u64)) as usize;
                dst.read_at(off, &mut dst_buf[..have])?;
            }
        }
        if src_buf[..avail] != dst_buf[..avail] {
            on_diff(tile_no, &src_buf[..avail])?;
            changed += 1;
        }
    }
    Ok(changed)
}

/// Handle on the backup directory of one store.
#[derive(Clone, Debug)]
pub struct BackupDir {
    root: PathBuf,
    dir: PathBuf,
    basename: String,
    tile_size: usize,
}

impl BackupDir {
    /// Describes the backup of the store in `root`; nothing is created yet.
    pub fn new(root: impl AsRef<Path>, basename: &str, tile_size: usize) -> Self {
        let root = root.as_ref().to_path_buf();
        let dir = root.join(format!("{basename}backup"));
        Self {
            root,
            dir,
            basename: basename.to_string(),
            tile_size,
        }
    }

    /// Backup directory path.
    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Path of the checkpoint marker in the store directory.
    pub fn marker_path(&self) -> PathBuf {
        self.root.join(format!("{}checkpoint", self.basename))
    }

    fn manifest_path(&self) -> PathBuf {
        self.dir.join(MANIFEST_FILE)
    }

    /// Shadow copy of partition `index`.
    pub fn shadow_path(&self, index: u32) -> PathBuf {
        self.dir.join(partition_file_name(&self.basename, index))
    }

    fn main_path(&self, index: u32) -> PathBuf {
        self.root.join(partition_file_name(&self.basename, index))
    }

    /// Returns true when a committed manifest exists.
    pub fn exists(&self) -> bool {
        self.manifest_path().is_file()
    }

    /// Returns true when a checkpoint marker is present.
    pub fn has_marker(&self) -> bool {
        self.marker_path().is_file()
    }

    /// Writes the marker that flags a checkpoint in progress.
    ///
    /// The contents are synced before the rename, so a marker that exists is
    /// always readable; `hard_sync` also makes its directory entry durable.
    pub fn create_marker(&self, marker: CheckpointMarker, hard_sync: bool) -> Result<()> {
        let bytes = serde_json::to_vec(&marker)
            .map_err(|err| StoreError::format(format!("checkpoint marker: {err}")))?;
        let tmp = self.root.join(format!("{}checkpoint.tmp", self.basename));
        remove_file_if_exists(&tmp)?;
        let io = StdFileIo::open(&tmp, OpenMode::Create)?;
        io.write_at(0, &bytes)?;
        io.sync_all()?;
        drop(io);
        fs::rename(&tmp, self.marker_path())?;
        if hard_sync {
            DirHandle::open(&self.root)?.sync()?;
        }
        debug!(
            path = %self.marker_path().display(),
            horizon = marker.horizon,
            backup = marker.backup,
            "backup.marker_create"
        );
        Ok(())
    }

    /// Reads the marker left by an unfinished cycle.
    pub fn load_marker(&self) -> Result<Option<CheckpointMarker>> {
        let raw = match fs::read(self.marker_path()) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|err| StoreError::format(format!("checkpoint marker: {err}")))
    }

    /// Removes the marker; returns whether it existed.
    pub fn remove_marker(&self) -> Result<bool> {
        remove_file_if_exists(&self.marker_path())
    }

    /// Reads the manifest, if one was committed.
    pub fn load_manifest(&self) -> Result<Option<Manifest>> {
        let raw = match fs::read(self.manifest_path()) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let manifest: Manifest = serde_json::from_slice(&raw)
            .map_err(|err| StoreError::format(format!("backup manifest: {err}")))?;
        if manifest.version != MANIFEST_VERSION {
            return Err(StoreError::format(format!(
                "unsupported backup manifest version {}",
                manifest.version
            )));
        }
        if manifest.tile_size != self.tile_size {
            return Err(StoreError::format(format!(
                "backup tile size {} differs from store tile size {}",
                manifest.tile_size, self.tile_size
            )));
        }
        Ok(Some(manifest))
    }

    /// Atomically replaces the manifest: temp file, fsync, rename.
    pub fn store_manifest(&self, manifest: &Manifest, hard_sync: bool) -> Result<()> {
        let dir = DirHandle::open(&self.dir)?;
        let mut manifest = manifest.clone();
        manifest.version = MANIFEST_VERSION;
        manifest.tile_size = self.tile_size;
        let bytes = serde_json::to_vec_pretty(&manifest)
            .map_err(|err| StoreError::format(format!("backup manifest: {err}")))?;
        let tmp = self.dir.join(format!("{MANIFEST_FILE}.tmp"));
        remove_file_if_exists(&tmp)?;
        let io = StdFileIo::open(&tmp, OpenMode::Create)?;
        io.write_at(0, &bytes)?;
        io.sync_all()?;
        drop(io);
        fs::rename(&tmp, self.manifest_path())?;
        if hard_sync {
            dir.sync()?;
        }
        debug!(
            horizon = manifest.horizon,
            partitions = manifest.partitions.len(),
            deltas = manifest.deltas.len(),
            "backup.manifest_commit"
        );
        Ok(())
    }

    /// Journals every tile of `main` that differs from the shadow.
    ///
    /// A partition without a shadow is compared against zeros, which makes
    /// the journal a full copy of its non-zero tiles.
    pub fn write_delta(
        &self,
        index: u32,
        generation: u64,
        main: &dyn FileIo,
        len: u64,
        hard_sync: bool,
    ) -> Result<DeltaRecord> {
        DirHandle::open(&self.dir)?;
        let file = format!(
            "{}{DELTA_MARK}{generation}",
            partition_file_name(&self.basename, index)
        );
        let path = self.dir.join(&file);
        remove_file_if_exists(&path)?;
        let journal = StdFileIo::open(&path, OpenMode::Create)?;
        let shadow = match StdFileIo::open(self.shadow_path(index), OpenMode::Existing) {
            Ok(io) => Some(io),
            Err(StoreError::Io(err)) if err.kind() == ErrorKind::NotFound => None,
            Err(err) => return Err(err),
        };
        let shadow_len = match &shadow {
            Some(io) => io.len()?,
            None => 0,
        };
        let tile = self.tile_size as u64;
        let mut at = DELTA_HEADER_LEN as u64;
        let tiles = diff_tiles(
            main,
            len,
            shadow.as_ref().map(|io| (io as &dyn FileIo, shadow_len)),
            self.tile_size,
            |tile_no, bytes| {
                let mut head = [0u8; DELTA_RECORD_HEADER];
                head[0..8].copy_from_slice(&tile_no.to_be_bytes());
                let crc = range_crc32(index, tile_no * tile, bytes);
                head[8..12].copy_from_slice(&crc.to_be_bytes());
                head[12..16].copy_from_slice(&(bytes.len() as u32).to_be_bytes());
                journal.write_at(at, &head)?;
                journal.write_at(at + DELTA_RECORD_HEADER as u64, bytes)?;
                at += (DELTA_RECORD_HEADER + bytes.len()) as u64;
                Ok(())
            },
        )?;
        journal.write_at(0, &self.delta_header(index, len, tiles))?;
        if hard_sync {
            journal.sync_all()?;
        }
        debug!(partition = index, generation, tiles, len, "backup.delta_write");
        Ok(DeltaRecord {
            index,
            file,
            tiles,
            len,
        })
    }

    fn delta_header(&self, index: u32, len: u64, tiles: u64) -> [u8; DELTA_HEADER_LEN] {
        let mut buf = [0u8; DELTA_HEADER_LEN];
        buf[0..8].copy_from_slice(&DELTA_MAGIC);
        buf[8..12].copy_from_slice(&DELTA_VERSION.to_be_bytes());
        buf[12..16].copy_from_slice(&index.to_be_bytes());
        buf[16..20].copy_from_slice(&(self.tile_size as u32).to_be_bytes());
        buf[24..32].copy_from_slice(&len.to_be_bytes());
        buf[32..40].copy_from_slice(&tiles.to_be_bytes());
        let crc = compute_crc32(&[&buf[..40]]);
        buf[40..44].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    /// Fsyncs a delta journal written without hard sync.
    pub fn sync_delta(&self, record: &DeltaRecord) -> Result<()> {
        StdFileIo::open(self.dir.join(&record.file), OpenMode::Existing)?.sync_all()
    }

    /// Applies a committed delta journal to its shadow. Idempotent.
    pub fn apply_delta(&self, record: &DeltaRecord, hard_sync: bool) -> Result<()> {
        let journal = StdFileIo::open(self.dir.join(&record.file), OpenMode::Existing)?;
        let mut head = [0u8; DELTA_HEADER_LEN];
        journal.read_at(0, &mut head)?;
        if head[0..8] != DELTA_MAGIC || read_u32(&head, 8) != DELTA_VERSION {
            return Err(StoreError::format(format!("{} is not a delta journal", record.file)));
        }
        if read_u32(&head, 40) != compute_crc32(&[&head[..40]]) {
            return Err(StoreError::format(format!("{} header checksum mismatch", record.file)));
        }
        let index = read_u32(&head, 12);
        let len = read_u64(&head, 24);
        let tiles = read_u64(&head, 32);
        if index != record.index || read_u32(&head, 16) as usize != self.tile_size {
            return Err(StoreError::format(format!(
                "{} does not belong to partition {}",
                record.file, record.index
            )));
        }
        let shadow = StdFileIo::open(self.shadow_path(index), OpenMode::Create)?;
        let tile = self.tile_size as u64;
        let mut at = DELTA_HEADER_LEN as u64;
        let mut bytes = vec![0u8; self.tile_size];
        for _ in 0..tiles {
            let mut rec = [0u8; DELTA_RECORD_HEADER];
            journal.read_at(at, &mut rec)?;
            let tile_no = read_u64(&rec, 0);
            let crc = read_u32(&rec, 8);
            let avail = read_u32(&rec, 12) as usize;
            if avail > self.tile_size {
                return Err(StoreError::format(format!("{} record too long", record.file)));
            }
            let payload = &mut bytes[..avail];
            journal.read_at(at + DELTA_RECORD_HEADER as u64, payload)?;
            if range_crc32(index, tile_no * tile, payload) != crc {
                return Err(StoreError::format(format!(
                    "{} tile {tile_no} checksum mismatch",
                    record.file
                )));
            }
            shadow.write_at(tile_no * tile, payload)?;
            at += (DELTA_RECORD_HEADER + avail) as u64;
        }
        shadow.truncate(len)?;
        if hard_sync {
            shadow.sync_all()?;
        }
        debug!(partition = index, tiles, len, "backup.delta_apply");
        Ok(())
    }

    /// Deletes every delta journal in the backup directory.
    pub fn discard_deltas(&self) -> Result<usize> {
        let mut removed = 0;
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err.into()),
        };
        for entry in entries {
            let entry = entry?;
            let is_delta = entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.contains(DELTA_MARK));
            if is_delta && remove_file_if_exists(&entry.path())? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Applies the committed deltas listed in `manifest`, then clears them
    /// from the manifest and deletes every journal.
    pub fn roll_forward(&self, manifest: &mut Manifest, hard_sync: bool) -> Result<()> {
        for record in &manifest.deltas {
            self.apply_delta(record, hard_sync)?;
        }
        if !manifest.deltas.is_empty() {
            manifest.deltas.clear();
            self.store_manifest(manifest, hard_sync)?;
        }
        self.discard_deltas()?;
        Ok(())
    }

    /// Brings the backup to a clean committed state after a restart.
    pub fn recover(&self) -> Result<Option<Manifest>> {
        let Some(mut manifest) = self.load_manifest()? else {
            let stray = self.discard_deltas()?;
            if stray > 0 {
                warn!(stray, "backup.recover.uncommitted_without_manifest");
            }
            return Ok(None);
        };
        if !manifest.deltas.is_empty() {
            warn!(
                horizon = manifest.horizon,
                deltas = manifest.deltas.len(),
                "backup.recover.roll_forward"
            );
        }
        self.roll_forward(&mut manifest, true)?;
        Ok(Some(manifest))
    }

    /// Rewrites the partition files of the store to match the shadows.
    ///
    /// Partition files absent from the manifest were created after the
    /// horizon and are deleted.
    pub fn restore_main(&self, manifest: &Manifest) -> Result<u64> {
        for index in scan_partitions(&self.root, &self.basename)? {
            if manifest.partition(index).is_none() {
                remove_file_if_exists(&self.main_path(index))?;
                info!(partition = index, "backup.restore.remove_new_partition");
            }
        }
        let mut restored = 0;
        for entry in &manifest.partitions {
            let main = StdFileIo::open(self.main_path(entry.index), OpenMode::Create)?;
            let main_len = main.len()?;
            let shadow = match StdFileIo::open(self.shadow_path(entry.index), OpenMode::Existing) {
                Ok(io) => Some(io),
                Err(StoreError::Io(err)) if err.kind() == ErrorKind::NotFound => None,
                Err(err) => return Err(err),
            };
            let tile = self.tile_size as u64;
            let tiles = match &shadow {
                Some(shadow) => diff_tiles(
                    shadow,
                    entry.len,
                    Some((&main as &dyn FileIo, main_len)),
                    self.tile_size,
                    |tile_no, bytes| main.write_at(tile_no * tile, bytes),
                )?,
                None => {
                    warn!(partition = entry.index, "backup.restore.shadow_missing");
                    0
                }
            };
            main.truncate(entry.len)?;
            main.sync_all()?;
            restored += tiles;
            debug!(partition = entry.index, tiles, len = entry.len, "backup.restore.partition");
        }
        DirHandle::open(&self.root)?.sync()?;
        Ok(restored)
    }

    /// Deletes the backup directory.
    pub fn remove(&self) -> Result<()> {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        DirHandle::open(&self.root)?.sync()?;
        info!(path = %self.dir.display(), "backup.remove");
        Ok(())
    }
}
