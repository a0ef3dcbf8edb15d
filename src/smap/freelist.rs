#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};

use crate::types::{Result, StoreError};

/// Free byte ranges of one partition.
///
/// Entries are pairwise disjoint and adjacent entries are merged on insert.
/// Allocation is best fit: the smallest entry that holds the request, lowest
/// offset on ties.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Freelist {
    by_offset: BTreeMap<u64, u64>,
    by_size: BTreeSet<(u64, u64)>,
}

impl Freelist {
    /// Creates an empty freelist.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of free entries.
    pub fn len(&self) -> usize {
        self.by_offset.len()
    }

    /// Returns true when nothing is free.
    pub fn is_empty(&self) -> bool {
        self.by_offset.is_empty()
    }

    /// Total free bytes.
    pub fn free_bytes(&self) -> u64 {
        self.by_offset.values().sum()
    }

    /// Iterates `(offset, length)` entries in offset order.
    pub fn entries(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.by_offset.iter().map(|(off, len)| (*off, *len))
    }

    fn remove_entry(&mut self, offset: u64, len: u64) {
        self.by_offset.remove(&offset);
        self.by_size.remove(&(len, offset));
    }

    fn add_entry(&mut self, offset: u64, len: u64) {
        self.by_offset.insert(offset, len);
        self.by_size.insert((len, offset));
    }

    /// Returns true when `[offset, offset + len)` intersects a free entry.
    pub fn overlaps(&self, offset: u64, len: u64) -> bool {
        let end = offset + len;
        if let Some((&prev, &prev_len)) = self.by_offset.range(..=offset).next_back() {
            if prev + prev_len > offset {
                return true;
            }
        }
        self.by_offset
            .range(offset..)
            .next()
            .is_some_and(|(&next, _)| next < end)
    }

    /// Removes and returns the offset of a best-fit range of `size` bytes.
    pub fn take_best_fit(&mut self, size: u64) -> Option<u64> {
        let &(len, offset) = self.by_size.range((size, 0)..).next()?;
        self.remove_entry(offset, len);
        if len > size {
            self.add_entry(offset + size, len - size);
        }
        Some(offset)
    }

    /// Returns `[offset, offset + len)` to the free set.
    pub fn insert(&mut self, offset: u64, len: u64) -> Result<()> {
        if len == 0 {
            return Err(StoreError::invalid("free of zero bytes"));
        }
        if self.overlaps(offset, len) {
            return Err(StoreError::protocol(format!(
                "double free of [{offset}, {})",
                offset + len
            )));
        }
        let mut start = offset;
        let mut total = len;
        if let Some((&prev, &prev_len)) = self.by_offset.range(..offset).next_back() {
            if prev + prev_len == offset {
                self.remove_entry(prev, prev_len);
                start = prev;
                total += prev_len;
            }
        }
        if let Some(&next_len) = self.by_offset.get(&(offset + len)) {
            self.remove_entry(offset + len, next_len);
            total += next_len;
        }
        self.add_entry(start, total);
        Ok(())
    }

    /// Drops everything at or beyond `end`, clipping a straddling entry.
    pub fn truncate(&mut self, end: u64) {
        let beyond: Vec<(u64, u64)> = self
            .by_offset
            .range(end..)
            .map(|(off, len)| (*off, *len))
            .collect();
        for (off, len) in beyond {
            self.remove_entry(off, len);
        }
        if let Some((&prev, &prev_len)) = self.by_offset.range(..end).next_back() {
            if prev + prev_len > end {
                self.remove_entry(prev, prev_len);
                self.add_entry(prev, end - prev);
            }
        }
    }
}
