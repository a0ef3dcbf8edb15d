#![allow(missing_docs)]

use partmap::status::collect;
use partmap::{Result, Store, StoreError, StoreOptions};
use tempfile::tempdir;

fn options() -> StoreOptions {
    StoreOptions {
        tile_size: 512,
        grow_increment: 4096,
        init_map_bytes: 4096,
        ids_per_partition: 16,
        cache_tiles: 8,
        ..StoreOptions::default()
    }
}

#[test]
fn values_survive_close_and_reopen() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let big: Vec<u8> = (0..5000u32).map(|i| (i * 7 % 256) as u8).collect();
    {
        let mut store = Store::open(dir.path(), options())?;
        store.put(0, b"zero")?;
        store.put(17, &big)?;
        store.put(40, b"")?;
        store.append(41, b"head-")?;
        store.append(41, b"tail")?;
        store.put(5, b"gone")?;
        assert!(store.remove(5)?);
        store.close()?;
    }

    let store = Store::open(dir.path(), options())?;
    assert_eq!(store.partition_count(), 3);
    assert_eq!(store.get(0)?, Some(b"zero".to_vec()));
    assert_eq!(store.get(17)?, Some(big.clone()));
    assert_eq!(store.get(40)?, Some(Vec::new()));
    assert_eq!(store.get(41)?, Some(b"head-tail".to_vec()));
    assert_eq!(store.get(5)?, None);
    assert_eq!(store.value_len(17)?, Some(big.len() as u64));

    let mut streamed = Vec::new();
    assert!(store.for_each_chunk(17, |chunk| {
        streamed.extend_from_slice(chunk);
        Ok(())
    })?);
    assert_eq!(streamed, big);
    store.close()
}

#[test]
fn small_cache_evicts_and_reloads_tiles() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let mut store = Store::open(dir.path(), options())?;
    for id in 0..64u64 {
        store.put(id, &vec![id as u8; 700])?;
    }
    store.close()?;

    let store = Store::open(dir.path(), options())?;
    for id in (0..64u64).chain(0..64) {
        assert_eq!(store.get(id)?, Some(vec![id as u8; 700]), "id {id}");
    }
    let stats = store.pool().stats();
    assert!(stats.evictions > 0);
    assert!(stats.misses > 64);
    assert!(stats.resident <= 8 + 1);
    store.close()
}

#[test]
fn freed_space_is_reused() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let mut store = Store::open(dir.path(), options())?;
    store.put(1, &[1u8; 100])?;
    store.put(2, &[2u8; 100])?;
    let size = store.partition(0).map(|p| p.size()).unwrap_or(0);
    store.remove(1)?;
    store.put(3, &[3u8; 60])?;
    assert_eq!(store.partition(0).map(|p| p.size()), Some(size));
    assert_eq!(store.get(2)?, Some(vec![2u8; 100]));
    assert_eq!(store.get(3)?, Some(vec![3u8; 60]));
    store.close()
}

#[test]
fn options_load_from_toml() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("store.toml");
    std::fs::write(
        &path,
        "basename = \"kv\"\ntile_size = 1024\nids_per_partition = 4\ninit_map_bytes = 4096\ngrow_increment = 4096\n",
    )
    .expect("write config");
    let options = StoreOptions::load(&path)?;
    assert_eq!(options.basename, "kv");
    assert_eq!(options.tile_size, 1024);

    let mut store = Store::open(dir.path(), options)?;
    store.put(9, b"nine")?;
    assert!(dir.path().join("kv0002").exists());
    store.close()?;

    assert!(matches!(
        StoreOptions::from_toml_str("tile_sise = 4"),
        Err(StoreError::InvalidArgument(_))
    ));
    Ok(())
}

#[test]
fn status_walk_reports_partitions_and_tiles() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let mut store = Store::open(dir.path(), options())?;
    store.put(33, b"x")?;
    let entries = collect(|cb| store.status("kv", cb))?;
    let lookup = |name: &str| {
        entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.clone())
    };
    assert_eq!(lookup("kv.smap.partitions").as_deref(), Some("3"));
    assert_eq!(lookup("kv.smap.horizon").as_deref(), Some("0"));
    assert_eq!(lookup("kv.smap.checkpoint").as_deref(), Some("live"));
    assert_eq!(lookup("kv.smap.partition.2.size").as_deref(), Some("257"));
    assert!(lookup("kv.smap.partition.0.size").is_none());
    assert!(lookup("kv.tile.capacity").is_some());
    store.close()
}

#[test]
fn truncate_then_reuse() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let mut store = Store::open(dir.path(), options())?;
    store.put(100, b"far")?;
    store.truncate()?;
    assert_eq!(store.partition_count(), 0);
    store.put(1, b"near")?;
    store.close()?;

    let store = Store::open(dir.path(), options())?;
    assert_eq!(store.partition_count(), 1);
    assert_eq!(store.get(100)?, None);
    assert_eq!(store.get(1)?, Some(b"near".to_vec()));
    store.destroy()
}
