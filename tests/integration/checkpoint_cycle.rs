#![allow(missing_docs)]

use std::fs;
use std::path::Path;
use std::sync::Once;

use partmap::checkpoint::{partition_file_name, Manifest, MANIFEST_FILE};
use partmap::{CheckpointPhase, Horizon, Result, Store, StoreError, StoreOptions};
use tempfile::tempdir;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

fn options(backup: bool) -> StoreOptions {
    StoreOptions {
        tile_size: 256,
        grow_increment: 1024,
        init_map_bytes: 1024,
        ids_per_partition: 2,
        cache_tiles: 16,
        backup,
        ..StoreOptions::default()
    }
}

fn manifest(dir: &Path) -> Manifest {
    let raw = fs::read(dir.join("smapbackup").join(MANIFEST_FILE)).expect("manifest");
    serde_json::from_slice(&raw).expect("manifest json")
}

#[test]
fn two_partitions_reach_the_backup() -> Result<()> {
    init_tracing();
    let dir = tempdir().expect("tmpdir");
    let mut store = Store::open(dir.path(), options(true))?;
    store.put(0, b"left")?;
    store.put(3, b"right")?;
    assert_eq!(store.partition_count(), 2);

    store.start_writes(true, true)?;
    assert_eq!(store.checkpoint_phase(), CheckpointPhase::WritesStarted);
    assert!(dir.path().join("smapcheckpoint").exists());
    store.finish_writes(true, true)?;
    store.sync_backup(true, true)?;
    store.finish_backup(true, true)?;
    assert_eq!(store.horizon(), Horizon(1));
    assert!(!dir.path().join("smapcheckpoint").exists());
    store.sync_directory(true, true)?;
    assert_eq!(store.checkpoint_phase(), CheckpointPhase::Live);

    let manifest = manifest(dir.path());
    assert_eq!(manifest.horizon, 1);
    assert!(manifest.deltas.is_empty());
    let indices: Vec<u32> = manifest.partitions.iter().map(|p| p.index).collect();
    assert_eq!(indices, vec![0, 1]);
    for entry in &manifest.partitions {
        let name = partition_file_name("smap", entry.index);
        let main = fs::read(dir.path().join(&name)).expect("main");
        let shadow = fs::read(dir.path().join("smapbackup").join(&name)).expect("shadow");
        assert_eq!(main.len() as u64, entry.len);
        assert_eq!(main, shadow, "partition {}", entry.index);
    }
    let strays = fs::read_dir(dir.path().join("smapbackup"))
        .expect("backup dir")
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().contains(".delta-"))
        .count();
    assert_eq!(strays, 0);
    store.close()
}

#[test]
fn incremental_cycles_track_only_changes() -> Result<()> {
    init_tracing();
    let dir = tempdir().expect("tmpdir");
    let mut store = Store::open(dir.path(), options(true))?;
    store.put(0, &[1u8; 400])?;
    store.put(2, &[2u8; 400])?;
    store.checkpoint(true)?;

    store.put(2, &[3u8; 400])?;
    store.checkpoint(false)?;
    assert_eq!(store.horizon(), Horizon(2));
    let shadow = fs::read(
        dir.path()
            .join("smapbackup")
            .join(partition_file_name("smap", 1)),
    )
    .expect("shadow");
    assert!(shadow.windows(400).any(|w| w.iter().all(|b| *b == 3)));
    assert_eq!(manifest(dir.path()).horizon, 2);
    store.close()?;

    let store = Store::open(dir.path(), options(true))?;
    assert_eq!(store.horizon(), Horizon(2));
    assert_eq!(store.get(2)?, Some(vec![3u8; 400]));
    store.close()
}

#[test]
fn phases_out_of_order_are_protocol_errors() -> Result<()> {
    init_tracing();
    let dir = tempdir().expect("tmpdir");
    let mut store = Store::open(dir.path(), options(true))?;
    store.put(1, b"x")?;
    assert!(matches!(
        store.sync_backup(true, true),
        Err(StoreError::Protocol(_))
    ));
    assert!(matches!(
        store.finish_backup(true, true),
        Err(StoreError::Protocol(_))
    ));
    store.start_writes(false, true)?;
    assert!(matches!(
        store.sync_backup(true, true),
        Err(StoreError::Protocol(_))
    ));
    assert!(matches!(store.truncate(), Err(StoreError::Protocol(_))));
    store.finish_writes(false, true)?;
    store.sync_directory(false, true)?;
    assert_eq!(store.checkpoint_phase(), CheckpointPhase::WritesFinished);
    store.sync_backup(false, true)?;
    store.finish_backup(false, true)?;
    assert!(matches!(
        store.start_writes(false, true),
        Err(StoreError::Protocol(_))
    ));
    store.sync_directory(false, true)?;
    assert_eq!(store.horizon(), Horizon(1));
    store.close()
}

#[test]
fn rollback_returns_to_horizon() -> Result<()> {
    init_tracing();
    let dir = tempdir().expect("tmpdir");
    let mut store = Store::open(dir.path(), options(true))?;
    store.put(0, b"stable")?;
    store.put(2, b"other")?;
    store.checkpoint(true)?;

    store.put(0, b"volatile-and-longer")?;
    store.remove(2)?;
    store.put(9, b"far away")?;
    store.start_writes(true, false)?;
    store.finish_writes(true, false)?;
    store.sync_backup(true, false)?;
    store.rollback()?;

    assert_eq!(store.checkpoint_phase(), CheckpointPhase::Live);
    assert_eq!(store.horizon(), Horizon(1));
    assert_eq!(store.get(0)?, Some(b"stable".to_vec()));
    assert_eq!(store.get(2)?, Some(b"other".to_vec()));
    assert_eq!(store.get(9)?, None);
    assert_eq!(store.partition_count(), 2);
    assert!(!dir.path().join("smapcheckpoint").exists());

    store.put(0, b"next")?;
    store.checkpoint(true)?;
    store.close()?;

    let store = Store::open(dir.path(), options(true))?;
    assert_eq!(store.horizon(), Horizon(2));
    assert_eq!(store.get(0)?, Some(b"next".to_vec()));
    assert_eq!(store.get(2)?, Some(b"other".to_vec()));
    store.close()
}

#[test]
fn enabling_backup_starts_from_scratch() -> Result<()> {
    init_tracing();
    let dir = tempdir().expect("tmpdir");
    let mut store = Store::open(dir.path(), options(false))?;
    store.put(0, b"before")?;
    store.checkpoint(true)?;
    assert!(!dir.path().join("smapbackup").exists());

    store.set_backup(true)?;
    assert!(store.backup_enabled());
    store.checkpoint(true)?;
    let manifest = manifest(dir.path());
    assert_eq!(manifest.horizon, 2);
    assert_eq!(manifest.partitions.len(), 1);

    store.remove_backup()?;
    assert!(!dir.path().join("smapbackup").exists());
    store.set_backup(false)?;
    store.close()
}

#[test]
fn rollback_without_backup_keeps_allocator_consistent() -> Result<()> {
    init_tracing();
    let dir = tempdir().expect("tmpdir");
    let single = || StoreOptions {
        ids_per_partition: 4,
        ..options(false)
    };
    let mut store = Store::open(dir.path(), single())?;
    store.put(0, b"aaaa")?;
    store.put(0, b"bbbbbbbb")?;
    store.checkpoint(true)?;
    store.put(1, b"cccc")?;
    store.start_writes(true, true)?;
    store.rollback()?;
    assert_eq!(store.checkpoint_phase(), CheckpointPhase::Live);
    assert_eq!(store.horizon(), Horizon(1));

    store.put(2, b"dddd")?;
    assert_eq!(store.get(0)?, Some(b"bbbbbbbb".to_vec()));
    assert_eq!(store.get(1)?, Some(b"cccc".to_vec()));
    assert_eq!(store.get(2)?, Some(b"dddd".to_vec()));
    store.close()?;

    let store = Store::open(dir.path(), single())?;
    assert_eq!(store.horizon(), Horizon(1));
    assert_eq!(store.get(1)?, Some(b"cccc".to_vec()));
    assert_eq!(store.get(2)?, Some(b"dddd".to_vec()));
    store.close()
}

#[test]
fn failed_backup_sync_blocks_commit_until_rollback() -> Result<()> {
    init_tracing();
    let dir = tempdir().expect("tmpdir");
    let backup_dir = dir.path().join("smapbackup");
    let mut store = Store::open(dir.path(), options(true))?;
    store.put(0, b"pending")?;
    store.start_writes(true, true)?;
    store.finish_writes(true, true)?;

    let _ = fs::remove_dir_all(&backup_dir);
    fs::write(&backup_dir, b"not a directory").expect("block backup dir");
    assert!(store.sync_backup(true, true).is_err());
    assert!(store.checkpoint_failed());
    assert!(matches!(
        store.finish_backup(true, true),
        Err(StoreError::Protocol(_))
    ));
    assert!(matches!(
        store.sync_directory(true, true),
        Err(StoreError::Protocol(_))
    ));
    assert_eq!(store.horizon(), Horizon(0));
    assert!(dir.path().join("smapcheckpoint").exists());

    fs::remove_file(&backup_dir).expect("unblock backup dir");
    store.rollback()?;
    assert!(!store.checkpoint_failed());
    assert_eq!(store.checkpoint_phase(), CheckpointPhase::Live);
    assert_eq!(store.horizon(), Horizon(0));

    store.checkpoint(true)?;
    assert_eq!(store.horizon(), Horizon(1));
    assert_eq!(manifest(dir.path()).horizon, 1);
    assert!(backup_dir.join(partition_file_name("smap", 0)).exists());
    assert_eq!(store.get(0)?, Some(b"pending".to_vec()));
    store.close()
}
