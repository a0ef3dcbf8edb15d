#![allow(missing_docs)]

use std::collections::HashMap;

use partmap::smap::{Freelist, Router, ID_MAX, PARTITIONS_MAX};
use partmap::{Result, Store, StoreError, StoreOptions};
use proptest::prelude::*;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tempfile::tempdir;

#[derive(Debug, Clone)]
enum AllocOp {
    Alloc(u64),
    Free(usize),
}

fn arb_alloc_op() -> impl Strategy<Value = AllocOp> {
    prop_oneof![
        3 => (1u64..=512).prop_map(AllocOp::Alloc),
        2 => any::<usize>().prop_map(AllocOp::Free),
    ]
}

fn assert_disjoint(freelist: &Freelist, live: &[(u64, u64)], end: u64) {
    let entries: Vec<(u64, u64)> = freelist.entries().collect();
    for pair in entries.windows(2) {
        let (a, a_len) = pair[0];
        let (b, _) = pair[1];
        assert!(a + a_len < b, "free ranges touch or overlap: {pair:?}");
    }
    for &(offset, len) in live {
        assert!(
            !freelist.overlaps(offset, len),
            "live range [{offset}, {}) is also free",
            offset + len
        );
    }
    let live_bytes: u64 = live.iter().map(|(_, len)| len).sum();
    assert_eq!(live_bytes + freelist.free_bytes(), end);
}

proptest! {
    #[test]
    fn prop_freelist_stays_disjoint(ops in prop::collection::vec(arb_alloc_op(), 1..200)) {
        let mut freelist = Freelist::new();
        let mut live: Vec<(u64, u64)> = Vec::new();
        let mut end = 0u64;
        for op in ops {
            match op {
                AllocOp::Alloc(size) => {
                    let offset = freelist.take_best_fit(size).unwrap_or_else(|| {
                        let at = end;
                        end += size;
                        at
                    });
                    live.push((offset, size));
                }
                AllocOp::Free(pick) => {
                    if live.is_empty() {
                        continue;
                    }
                    let (offset, len) = live.swap_remove(pick % live.len());
                    freelist.insert(offset, len).unwrap();
                    prop_assert!(matches!(
                        freelist.insert(offset, len),
                        Err(StoreError::Protocol(_))
                    ));
                }
            }
            assert_disjoint(&freelist, &live, end);
        }
    }

    #[test]
    fn prop_routes_are_stable(ids_per_partition in 1u64..=1 << 20, id in 0u64..=ID_MAX) {
        let router = Router::new(ids_per_partition).unwrap();
        match router.route(id) {
            Ok(route) => {
                prop_assert_eq!(route.partition as u64, id / ids_per_partition);
                prop_assert_eq!(route.slot, id % ids_per_partition);
                prop_assert_eq!(router.first_id(route.partition) + route.slot, id);
                prop_assert_eq!(Router::new(ids_per_partition).unwrap().route(id).unwrap(), route);
            }
            Err(StoreError::ResourceExhausted(_)) => {
                prop_assert!(id / ids_per_partition >= PARTITIONS_MAX as u64);
            }
            Err(other) => prop_assert!(false, "unexpected error {other}"),
        }
    }
}

#[test]
fn seeded_workload_matches_model() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let options = StoreOptions {
        tile_size: 256,
        grow_increment: 2048,
        init_map_bytes: 2048,
        ids_per_partition: 32,
        cache_tiles: 24,
        backup: true,
        ..StoreOptions::default()
    };
    let mut rng = ChaCha8Rng::seed_from_u64(0xDEADBEEF);
    let mut store = Store::open(dir.path(), options.clone())?;
    let mut model: HashMap<u64, Vec<u8>> = HashMap::new();
    let mut committed = model.clone();

    for round in 0..12 {
        for _ in 0..80 {
            let id = rng.gen_range(0..160u64);
            match rng.gen_range(0..10) {
                0..=4 => {
                    let len = rng.gen_range(0..600);
                    let value: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
                    store.put(id, &value)?;
                    model.insert(id, value);
                }
                5..=6 => {
                    let extra: Vec<u8> = (0..rng.gen_range(1..80)).map(|_| rng.gen()).collect();
                    store.append(id, &extra)?;
                    model.entry(id).or_default().extend_from_slice(&extra);
                }
                _ => {
                    assert_eq!(store.remove(id)?, model.remove(&id).is_some());
                }
            }
        }
        if round % 4 == 3 {
            store.start_writes(true, true)?;
            store.finish_writes(true, true)?;
            store.rollback()?;
            model = committed.clone();
        } else {
            store.checkpoint(round % 2 == 0)?;
            committed = model.clone();
        }
        for id in 0..160u64 {
            assert_eq!(store.get(id)?, model.get(&id).cloned(), "round {round} id {id}");
        }
    }
    store.close()?;

    let store = Store::open(dir.path(), options)?;
    for id in 0..160u64 {
        assert_eq!(store.get(id)?, committed.get(&id).cloned(), "after reopen, id {id}");
    }
    store.close()
}
