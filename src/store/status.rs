#![forbid(unsafe_code)]

use super::Store;
use crate::status::{report, StatusFn};
use crate::types::Result;

impl Store {
    /// Walks store status: every occupied partition under
    /// `<prefix>.smap.partition.<i>`, then the tile layer.
    pub fn status(&self, prefix: &str, cb: &mut StatusFn<'_>) -> Result<()> {
        report(cb, &format!("{prefix}.smap.horizon"), self.horizon)?;
        report(cb, &format!("{prefix}.smap.checkpoint"), self.checkpoint.phase())?;
        report(cb, &format!("{prefix}.smap.partitions"), self.partition_count)?;
        for (index, part) in self.partitions[..self.partition_count].iter().enumerate() {
            if let Some(part) = part {
                part.status(&format!("{prefix}.smap.partition.{index}"), cb)?;
            }
        }
        self.status_tiles(prefix, cb)
    }

    /// Walks only the tile layer.
    pub fn status_tiles(&self, prefix: &str, cb: &mut StatusFn<'_>) -> Result<()> {
        self.pool.status(prefix, cb)
    }
}
