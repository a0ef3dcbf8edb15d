#![forbid(unsafe_code)]

use crate::types::{Result, SmapId, StoreError};

/// Largest routable id: ids occupy five bytes.
pub const ID_MAX: SmapId = (1 << 40) - 1;
/// The "no id" sentinel.
pub const NO_ID: SmapId = u64::MAX;
/// Size of the partition table.
pub const PARTITIONS_MAX: usize = 1024;
/// Bytes per id slot in a partition's index region.
pub const SLOT_LEN: u64 = 16;

/// Where an id lives.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct Route {
    /// Partition index.
    pub partition: u32,
    /// Slot number inside the partition.
    pub slot: u64,
}

impl Route {
    /// Byte offset of the slot inside the partition.
    pub fn slot_offset(&self) -> u64 {
        self.slot * SLOT_LEN
    }
}

/// Maps ids to partitions using only the static `ids_per_partition`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Router {
    ids_per_partition: u64,
}

impl Router {
    /// Creates a router; `ids_per_partition` must be non-zero.
    pub fn new(ids_per_partition: u64) -> Result<Self> {
        if ids_per_partition == 0 {
            return Err(StoreError::invalid("ids_per_partition must be non-zero"));
        }
        Ok(Self { ids_per_partition })
    }

    /// Ids routed to each partition.
    pub fn ids_per_partition(&self) -> u64 {
        self.ids_per_partition
    }

    /// Resolves `id` to its partition and slot.
    pub fn route(&self, id: SmapId) -> Result<Route> {
        if id == NO_ID {
            return Err(StoreError::invalid("id is the no-id sentinel"));
        }
        if id > ID_MAX {
            return Err(StoreError::invalid(format!("id {id} exceeds {ID_MAX}")));
        }
        let partition = id / self.ids_per_partition;
        if partition >= PARTITIONS_MAX as u64 {
            return Err(StoreError::exhausted(format!(
                "id {id} maps to partition {partition}, table holds {PARTITIONS_MAX}"
            )));
        }
        Ok(Route {
            partition: partition as u32,
            slot: id % self.ids_per_partition,
        })
    }

    /// First id routed to `partition`.
    pub fn first_id(&self, partition: u32) -> SmapId {
        partition as u64 * self.ids_per_partition
    }
}
