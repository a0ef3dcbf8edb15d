#![allow(missing_docs)]

use std::fs;
use std::path::Path;
use std::sync::Once;

use partmap::checkpoint::MANIFEST_FILE;
use partmap::{Horizon, Result, Store, StoreOptions};
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
        ids_per_partition: 4,
        cache_tiles: 16,
        backup,
        ..StoreOptions::default()
    }
}

/// Leaks the store so nothing is flushed, as if the process died.
fn crash(store: Store) {
    std::mem::forget(store);
}

fn delta_files(dir: &Path) -> usize {
    fs::read_dir(dir.join("smapbackup"))
        .map(|entries| {
            entries
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.file_name().to_string_lossy().contains(".delta-"))
                .count()
        })
        .unwrap_or(0)
}

#[test]
fn crash_after_writes_restores_horizon() -> Result<()> {
    init_tracing();
    let dir = tempdir().expect("tmpdir");
    let mut store = Store::open(dir.path(), options(true))?;
    store.put(1, b"committed")?;
    store.checkpoint(true)?;
    store.put(1, b"uncommitted")?;
    store.put(6, b"new partition")?;
    store.start_writes(true, true)?;
    store.finish_writes(true, true)?;
    crash(store);
    assert!(dir.path().join("smapcheckpoint").exists());

    let store = Store::open(dir.path(), options(true))?;
    assert!(!dir.path().join("smapcheckpoint").exists());
    assert_eq!(store.horizon(), Horizon(1));
    assert_eq!(store.get(1)?, Some(b"committed".to_vec()));
    assert_eq!(store.get(6)?, None);
    assert_eq!(store.partition_count(), 1);
    assert!(!dir.path().join("smap0001").exists());
    store.close()
}

#[test]
fn uncommitted_deltas_are_discarded() -> Result<()> {
    init_tracing();
    let dir = tempdir().expect("tmpdir");
    let mut store = Store::open(dir.path(), options(true))?;
    store.put(0, &[5u8; 300])?;
    store.checkpoint(true)?;
    store.put(0, &[6u8; 300])?;
    store.start_writes(true, true)?;
    store.finish_writes(true, true)?;
    store.sync_backup(true, true)?;
    assert!(delta_files(dir.path()) > 0);
    crash(store);

    let store = Store::open(dir.path(), options(true))?;
    assert_eq!(delta_files(dir.path()), 0);
    assert_eq!(store.horizon(), Horizon(1));
    assert_eq!(store.get(0)?, Some(vec![5u8; 300]));
    store.close()
}

#[test]
fn crash_after_commit_keeps_new_horizon() -> Result<()> {
    init_tracing();
    let dir = tempdir().expect("tmpdir");
    let mut store = Store::open(dir.path(), options(true))?;
    store.put(2, b"first")?;
    store.checkpoint(true)?;
    store.put(2, b"again")?;
    store.start_writes(true, true)?;
    store.put(3, b"after fence")?;
    store.finish_writes(true, true)?;
    store.sync_backup(true, true)?;
    store.finish_backup(true, true)?;
    crash(store);

    let mut store = Store::open(dir.path(), options(true))?;
    assert_eq!(store.horizon(), Horizon(2));
    assert_eq!(store.get(2)?, Some(b"again".to_vec()));
    assert_eq!(store.get(3)?, None);

    store.put(2, b"third")?;
    store.start_writes(true, true)?;
    store.finish_writes(true, true)?;
    store.rollback()?;
    assert_eq!(store.get(2)?, Some(b"again".to_vec()));
    store.close()
}

#[test]
fn stale_backup_is_dropped_at_open() -> Result<()> {
    init_tracing();
    let dir = tempdir().expect("tmpdir");
    let mut store = Store::open(dir.path(), options(true))?;
    store.put(0, b"zero")?;
    store.checkpoint(true)?;
    store.close()?;

    let mut store = Store::open(dir.path(), options(false))?;
    store.put(8, b"unbacked")?;
    store.checkpoint(true)?;
    store.close()?;

    let mut store = Store::open(dir.path(), options(true))?;
    assert!(!dir.path().join("smapbackup").join(MANIFEST_FILE).exists());
    assert_eq!(store.horizon(), Horizon(2));
    store.checkpoint(true)?;
    assert!(dir.path().join("smapbackup").join(MANIFEST_FILE).exists());
    assert_eq!(store.get(8)?, Some(b"unbacked".to_vec()));
    store.close()
}

#[test]
fn crash_without_backup_keeps_fenced_files() -> Result<()> {
    init_tracing();
    let dir = tempdir().expect("tmpdir");
    let mut store = Store::open(dir.path(), options(false))?;
    store.put(1, b"durable")?;
    store.checkpoint(true)?;
    store.put(1, b"lost")?;
    crash(store);

    let store = Store::open(dir.path(), options(false))?;
    assert_eq!(store.horizon(), Horizon(1));
    assert_eq!(store.get(1)?, Some(b"durable".to_vec()));
    store.close()
}

#[test]
fn unfinished_cycle_keeps_committed_horizon() -> Result<()> {
    init_tracing();
    for backup in [false, true] {
        let dir = tempdir().expect("tmpdir");
        let mut store = Store::open(dir.path(), options(backup))?;
        store.put(0, b"fenced")?;
        store.start_writes(true, true)?;
        store.finish_writes(true, true)?;
        drop(store);
        assert!(dir.path().join("smapcheckpoint").exists());

        let store = Store::open(dir.path(), options(backup))?;
        assert_eq!(store.horizon(), Horizon(0), "backup: {backup}");
        assert!(!dir.path().join("smapcheckpoint").exists());
        assert_eq!(store.get(0)?, Some(b"fenced".to_vec()));
        store.close()?;

        let store = Store::open(dir.path(), options(backup))?;
        assert_eq!(store.horizon(), Horizon(0), "backup: {backup}");
        store.close()?;
    }
    Ok(())
}

#[test]
fn crash_mid_cycle_without_backup_keeps_horizon() -> Result<()> {
    init_tracing();
    let dir = tempdir().expect("tmpdir");
    let mut store = Store::open(dir.path(), options(false))?;
    store.put(1, b"one")?;
    store.checkpoint(true)?;
    store.put(1, b"two")?;
    store.start_writes(true, true)?;
    store.finish_writes(true, true)?;
    crash(store);

    let mut store = Store::open(dir.path(), options(false))?;
    assert_eq!(store.horizon(), Horizon(1));
    store.checkpoint(true)?;
    assert_eq!(store.horizon(), Horizon(2));
    store.close()?;

    let store = Store::open(dir.path(), options(false))?;
    assert_eq!(store.horizon(), Horizon(2));
    assert_eq!(store.get(1)?, Some(b"two".to_vec()));
    store.close()
}
