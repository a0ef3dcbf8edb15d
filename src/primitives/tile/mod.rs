//! Tile cache shared by all partitions of a store.
//!
//! Files are read and written in fixed-size tiles. A [`TilePool`] caches
//! tiles across files with LRU replacement; a [`TiledFile`] tracks its own
//! dirty tiles and hands them to checkpoints as frozen images.

mod buffer;
mod file;
mod pool;

pub use buffer::TileBuf;
pub use file::{ImageBatch, TileImage, TileMut, TileRef, TiledFile, TiledFileStats};
pub use pool::{TilePool, TilePoolStats};
