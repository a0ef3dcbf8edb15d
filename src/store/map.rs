#![forbid(unsafe_code)]

use tracing::{trace, warn};

use super::Store;
use crate::smap::{Partition, Route, ID_MAX, NO_ID, SLOT_LEN};
use crate::types::{read_u64, Result, SmapId, StoreError};

/// Width of one id in an id set value.
const ID_BYTES: usize = 5;

fn encode_id(id: SmapId) -> [u8; ID_BYTES] {
    let mut out = [0u8; ID_BYTES];
    out.copy_from_slice(&id.to_be_bytes()[8 - ID_BYTES..]);
    out
}

fn decode_id(raw: &[u8]) -> SmapId {
    raw.iter().fold(0, |acc, b| (acc << 8) | SmapId::from(*b))
}

/// Returns a range taken for a write that failed; the original error wins.
fn release_failed(part: &mut Partition, offset: u64, len: u64) {
    if let Err(err) = part.free(offset, len) {
        warn!(
            partition = part.index(),
            offset,
            len,
            error = %err,
            "store.release_failed_alloc"
        );
    }
}

/// Decodes the slot of `route`: `(offset, len + 1)`, zero meaning absent.
fn read_slot(part: &Partition, route: Route) -> Result<Option<(u64, u64)>> {
    let mut raw = [0u8; SLOT_LEN as usize];
    part.read(route.slot_offset(), &mut raw)?;
    let offset = read_u64(&raw, 0);
    let encoded = read_u64(&raw, 8);
    if encoded == 0 {
        return Ok(None);
    }
    let len = encoded - 1;
    if offset.checked_add(len).map_or(true, |end| end > part.size()) {
        return Err(StoreError::format(format!(
            "slot {} of partition {} points outside the partition",
            route.slot,
            part.index()
        )));
    }
    Ok(Some((offset, len)))
}

fn write_slot(part: &mut Partition, route: Route, value: Option<(u64, u64)>) -> Result<()> {
    let mut raw = [0u8; SLOT_LEN as usize];
    if let Some((offset, len)) = value {
        raw[0..8].copy_from_slice(&offset.to_be_bytes());
        raw[8..16].copy_from_slice(&(len + 1).to_be_bytes());
    }
    part.mem_to_file(route.slot_offset(), &raw)
}

impl Store {
    /// Stores `value` under `id`, replacing any previous value.
    pub fn put(&mut self, id: SmapId, value: &[u8]) -> Result<()> {
        let route = self.router.route(id)?;
        let part = self.partition_mut(route.partition)?;
        let len = value.len() as u64;
        let old = read_slot(part, route)?;
        if let Some((offset, old_len)) = old {
            if old_len == len {
                if len > 0 {
                    part.mem_to_file(offset, value)?;
                }
                trace!(id, len, "store.put.in_place");
                return Ok(());
            }
        }
        let offset = if len == 0 {
            0
        } else {
            let at = part.alloc(len)?;
            if let Err(err) = part.mem_to_file(at, value) {
                release_failed(part, at, len);
                return Err(err);
            }
            at
        };
        write_slot(part, route, Some((offset, len)))?;
        if let Some((old_offset, old_len)) = old {
            if old_len > 0 {
                part.free(old_offset, old_len)?;
            }
        }
        trace!(id, partition = route.partition, offset, len, "store.put");
        Ok(())
    }

    /// Appends `extra` to the value under `id`, creating it when absent.
    pub fn append(&mut self, id: SmapId, extra: &[u8]) -> Result<()> {
        let route = self.router.route(id)?;
        let old = {
            let part = self.partition_mut(route.partition)?;
            read_slot(part, route)?
        };
        let Some((offset, len)) = old else {
            return self.put(id, extra);
        };
        if extra.is_empty() {
            return Ok(());
        }
        let part = self.partition_mut(route.partition)?;
        let add = extra.len() as u64;
        if len > 0 && offset + len == part.size() {
            part.mem_to_file(offset + len, extra)?;
            write_slot(part, route, Some((offset, len + add)))?;
            trace!(id, len = len + add, "store.append.in_place");
            return Ok(());
        }
        let at = part.alloc(len + add)?;
        let moved = part
            .copy(at, offset, len)
            .and_then(|()| part.mem_to_file(at + len, extra));
        if let Err(err) = moved {
            release_failed(part, at, len + add);
            return Err(err);
        }
        write_slot(part, route, Some((at, len + add)))?;
        if len > 0 {
            part.free(offset, len)?;
        }
        trace!(id, from = offset, to = at, len = len + add, "store.append.relocate");
        Ok(())
    }

    /// Adds `dest` to the id set stored under `source`.
    ///
    /// The set is the value of `source` read as packed five-byte ids. With
    /// `exclusive`, a `dest` already in the set fails with
    /// [`StoreError::Exists`] and nothing is written.
    pub fn add(&mut self, source: SmapId, dest: SmapId, exclusive: bool) -> Result<()> {
        if dest > ID_MAX || dest == NO_ID {
            return Err(StoreError::invalid(format!("id {dest} cannot be added to a set")));
        }
        if exclusive && self.ids(source)?.contains(&dest) {
            return Err(StoreError::Exists(format!("{dest} in the set of {source}")));
        }
        self.append(source, &encode_id(dest))?;
        trace!(source, dest, exclusive, "store.add");
        Ok(())
    }

    /// Returns the id set stored under `source`, in insertion order.
    pub fn ids(&self, source: SmapId) -> Result<Vec<SmapId>> {
        let Some(raw) = self.get(source)? else {
            return Ok(Vec::new());
        };
        if raw.len() % ID_BYTES != 0 {
            return Err(StoreError::format(format!(
                "value of {source} is {} bytes, not a whole number of ids",
                raw.len()
            )));
        }
        Ok(raw.chunks_exact(ID_BYTES).map(decode_id).collect())
    }

    fn locate(&self, id: SmapId) -> Result<Option<(&Partition, u64, u64)>> {
        let route = self.router.route(id)?;
        let Some(part) = self.partition(route.partition) else {
            return Ok(None);
        };
        Ok(read_slot(part, route)?.map(|(offset, len)| (part, offset, len)))
    }

    /// Returns a copy of the value under `id`.
    pub fn get(&self, id: SmapId) -> Result<Option<Vec<u8>>> {
        let Some((part, offset, len)) = self.locate(id)? else {
            return Ok(None);
        };
        let mut buf = vec![0u8; len as usize];
        part.read(offset, &mut buf)?;
        Ok(Some(buf))
    }

    /// Calls `f` with each pinned chunk of the value under `id`, in order.
    ///
    /// Returns false when `id` has no value. An error from `f` stops the walk
    /// and is returned; the chunk pin is released either way.
    pub fn for_each_chunk<F>(&self, id: SmapId, mut f: F) -> Result<bool>
    where
        F: FnMut(&[u8]) -> Result<()>,
    {
        let Some((part, offset, len)) = self.locate(id)? else {
            return Ok(false);
        };
        let end = offset + len;
        let mut pos = offset;
        while pos < end {
            let chunk = part.get_chunk(pos, end - pos)?;
            f(chunk.data())?;
            pos += chunk.len() as u64;
        }
        Ok(true)
    }

    /// Length of the value under `id`.
    pub fn value_len(&self, id: SmapId) -> Result<Option<u64>> {
        Ok(self.locate(id)?.map(|(_, _, len)| len))
    }

    /// Returns true when `id` has a value.
    pub fn contains(&self, id: SmapId) -> Result<bool> {
        Ok(self.locate(id)?.is_some())
    }

    /// Removes the value under `id`; returns whether there was one.
    pub fn remove(&mut self, id: SmapId) -> Result<bool> {
        let route = self.router.route(id)?;
        let Some(part) = self
            .partitions
            .get_mut(route.partition as usize)
            .and_then(Option::as_mut)
        else {
            return Ok(false);
        };
        let Some((offset, len)) = read_slot(part, route)? else {
            return Ok(false);
        };
        write_slot(part, route, None)?;
        if len > 0 {
            part.free(offset, len)?;
        }
        trace!(id, offset, len, "store.remove");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use crate::options::StoreOptions;
    use crate::store::Store;
    use crate::types::{Result, StoreError};
    use tempfile::tempdir;

    fn options() -> StoreOptions {
        StoreOptions {
            tile_size: 256,
            grow_increment: 1024,
            init_map_bytes: 1024,
            ids_per_partition: 4,
            cache_tiles: 16,
            ..StoreOptions::default()
        }
    }

    #[test]
    fn put_get_replace_remove() -> Result<()> {
        let dir = tempdir().unwrap();
        let mut store = Store::open(dir.path(), options())?;
        store.put(1, b"alpha")?;
        store.put(2, b"")?;
        assert_eq!(store.get(1)?, Some(b"alpha".to_vec()));
        assert_eq!(store.get(2)?, Some(Vec::new()));
        assert_eq!(store.get(3)?, None);
        assert_eq!(store.get(100)?, None);

        store.put(1, b"omega")?;
        assert_eq!(store.get(1)?, Some(b"omega".to_vec()));
        store.put(1, b"longer value")?;
        assert_eq!(store.value_len(1)?, Some(12));
        let freed: u64 = store.partition(0).map(|p| p.freelist().free_bytes()).unwrap_or(0);
        assert_eq!(freed, 5);

        assert!(store.remove(1)?);
        assert!(!store.remove(1)?);
        assert!(!store.contains(1)?);
        assert!(store.contains(2)?);
        store.close()
    }

    #[test]
    fn append_in_place_and_relocated() -> Result<()> {
        let dir = tempdir().unwrap();
        let mut store = Store::open(dir.path(), options())?;
        store.append(0, b"ab")?;
        store.append(0, b"cd")?;
        let size_after_tail_appends = store.partition(0).map(|p| p.size()).unwrap_or(0);
        store.put(1, b"zz")?;
        store.append(0, b"ef")?;
        assert_eq!(store.get(0)?, Some(b"abcdef".to_vec()));
        assert_eq!(store.get(1)?, Some(b"zz".to_vec()));
        assert_eq!(size_after_tail_appends, 4 * 16 + 4);
        store.close()
    }

    #[test]
    fn chunks_cover_value_across_tiles() -> Result<()> {
        let dir = tempdir().unwrap();
        let mut store = Store::open(dir.path(), options())?;
        let value: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        store.put(3, &value)?;
        let mut seen = Vec::new();
        let mut chunks = 0;
        assert!(store.for_each_chunk(3, |bytes| {
            chunks += 1;
            seen.extend_from_slice(bytes);
            Ok(())
        })?);
        assert_eq!(seen, value);
        assert!(chunks > 1);
        assert!(!store.for_each_chunk(2, |_| Ok(()))?);

        let err = store
            .for_each_chunk(3, |_| Err(StoreError::Callback(4)))
            .unwrap_err();
        assert!(matches!(err, StoreError::Callback(4)));
        store.put(3, b"after")?;
        store.close()
    }

    #[test]
    fn add_builds_id_sets() -> Result<()> {
        let dir = tempdir().unwrap();
        let mut store = Store::open(dir.path(), options())?;
        store.add(1, 7, false)?;
        store.add(1, (1 << 40) - 1, true)?;
        store.add(1, 7, false)?;
        assert_eq!(store.ids(1)?, vec![7, (1 << 40) - 1, 7]);
        assert_eq!(store.value_len(1)?, Some(15));
        assert!(store.ids(2)?.is_empty());
        store.close()
    }

    #[test]
    fn exclusive_add_rejects_duplicates() -> Result<()> {
        let dir = tempdir().unwrap();
        let mut store = Store::open(dir.path(), options())?;
        store.add(3, 10, true)?;
        store.add(3, 11, true)?;
        assert!(matches!(store.add(3, 10, true), Err(StoreError::Exists(_))));
        assert_eq!(store.ids(3)?, vec![10, 11]);
        assert!(matches!(store.add(3, 1 << 40, false), Err(StoreError::InvalidArgument(_))));

        store.put(5, b"abc")?;
        assert!(matches!(store.ids(5), Err(StoreError::Format(_))));
        store.close()
    }

    #[test]
    fn invalid_ids_are_rejected() -> Result<()> {
        let dir = tempdir().unwrap();
        let mut store = Store::open(dir.path(), options())?;
        assert!(matches!(store.put(u64::MAX, b"x"), Err(StoreError::InvalidArgument(_))));
        assert!(matches!(
            store.put(4 * 1024, b"x"),
            Err(StoreError::ResourceExhausted(_))
        ));
        assert_eq!(store.partition_count(), 0);
        store.close()
    }
}
