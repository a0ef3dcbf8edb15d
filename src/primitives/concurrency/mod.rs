//! Completion tokens, the directory-sync context and the store writer lock.

mod completion;
mod lock;

pub use completion::{Completion, DirSyncContext};
pub use lock::StoreLock;
