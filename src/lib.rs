//! Partitioned map store with multi-phase checkpoints and an incremental
//! on-disk backup.
//!
//! Ids route to fixed-capacity partitions; each partition is a tiled file
//! holding an index region of `(offset, len)` slots followed by value bytes.
//! All partitions share one tile cache. A checkpoint fences the dirty tiles
//! of every partition, writes them, journals what changed against the backup
//! and commits a new horizon.

#![warn(missing_docs)]

pub mod checkpoint;
pub mod options;
pub mod primitives;
pub mod smap;
pub mod status;
pub mod store;
pub mod types;

pub use checkpoint::CheckpointPhase;
pub use options::StoreOptions;
pub use primitives::concurrency::Completion;
pub use smap::Chunk;
pub use status::StatusFn;
pub use store::Store;
pub use types::{Horizon, Result, SmapId, StoreError};
