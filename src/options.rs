#![forbid(unsafe_code)]

//! Store configuration.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::smap::{HEADER_LEN, SLOT_LEN};
use crate::types::{Result, StoreError};

/// Options controlling file layout, growth, caching and backups.
///
/// Every field has a default, so a TOML file only needs to name the values
/// it changes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreOptions {
    /// File name prefix for partitions, the backup directory and the marker.
    pub basename: String,
    /// Physical data capacity given to a freshly created partition.
    pub init_map_bytes: u64,
    /// Step by which partition files grow ahead of their virtual size.
    pub grow_increment: u64,
    /// Number of ids routed to each partition.
    pub ids_per_partition: u64,
    /// Upper bound on a partition's virtual size.
    pub max_partition_bytes: u64,
    /// Tile size in bytes; a power of two.
    pub tile_size: usize,
    /// Soft capacity of the shared tile pool, in tiles.
    pub cache_tiles: usize,
    /// Lock tile buffers into memory.
    pub mlock: bool,
    /// Keep a point-in-time backup for rollback.
    pub backup: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            basename: "smap".to_string(),
            init_map_bytes: 1 << 20,
            grow_increment: 1 << 20,
            ids_per_partition: 1 << 16,
            max_partition_bytes: 1 << 36,
            tile_size: 32 * 1024,
            cache_tiles: 1024,
            mlock: false,
            backup: false,
        }
    }
}

impl StoreOptions {
    /// Parses options from TOML text and validates them.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let options: StoreOptions = toml::from_str(text)
            .map_err(|err| StoreError::invalid(format!("store options: {err}")))?;
        options.validate()?;
        Ok(options)
    }

    /// Loads options from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    /// Rejects zero or mutually inconsistent values.
    pub fn validate(&self) -> Result<()> {
        if self.basename.is_empty() || self.basename.contains(['/', '\\']) {
            return Err(StoreError::invalid(format!(
                "basename {:?} must be a non-empty file name",
                self.basename
            )));
        }
        if !self.tile_size.is_power_of_two() || self.tile_size < HEADER_LEN as usize {
            return Err(StoreError::invalid(format!(
                "tile_size {} must be a power of two of at least {HEADER_LEN}",
                self.tile_size
            )));
        }
        let tile = self.tile_size as u64;
        if self.grow_increment == 0 || self.grow_increment % tile != 0 {
            return Err(StoreError::invalid(format!(
                "grow_increment {} must be a non-zero multiple of tile_size {tile}",
                self.grow_increment
            )));
        }
        if self.init_map_bytes == 0 {
            return Err(StoreError::invalid("init_map_bytes must be non-zero"));
        }
        if self.cache_tiles == 0 {
            return Err(StoreError::invalid("cache_tiles must be non-zero"));
        }
        let index_bytes = self
            .ids_per_partition
            .checked_mul(SLOT_LEN)
            .ok_or_else(|| StoreError::invalid("ids_per_partition overflows the index region"))?;
        if self.ids_per_partition == 0 || index_bytes >= self.max_partition_bytes {
            return Err(StoreError::invalid(format!(
                "ids_per_partition {} does not fit max_partition_bytes {}",
                self.ids_per_partition, self.max_partition_bytes
            )));
        }
        Ok(())
    }

    /// Bytes reserved at offset 0 of each partition for the id slots.
    pub fn index_region_len(&self) -> u64 {
        self.ids_per_partition * SLOT_LEN
    }

    /// Rounds a physical length up to the next growth step.
    pub(crate) fn round_to_increment(&self, len: u64) -> u64 {
        len.div_ceil(self.grow_increment) * self.grow_increment
    }
}
