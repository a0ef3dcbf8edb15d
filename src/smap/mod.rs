//! Partitioned map building blocks: header, freelist, partition and router.

mod freelist;
mod header;
mod partition;
mod router;

pub use freelist::Freelist;
pub use header::{PartitionHeader, HEADER_LEN};
pub use partition::{Chunk, Partition};
pub use router::{Route, Router, ID_MAX, NO_ID, PARTITIONS_MAX, SLOT_LEN};
