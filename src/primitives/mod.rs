//! Low-level primitives for building the storage engine.
//!
//! Includes positioned file I/O, concurrency helpers and the tile cache.

/// Completion tokens, directory sync and the writer lock.
pub mod concurrency;

/// I/O abstractions and utilities.
///
/// Interfaces for reading/writing data and file operations.
pub mod io;

/// Tiled file access through a shared cache.
pub mod tile;
