#![forbid(unsafe_code)]

//! Name/value status walk.
//!
//! Components report `(name, value)` pairs to a caller-supplied callback.
//! A nonzero return from the callback aborts the walk; the code comes back
//! to the caller as [`StoreError::Callback`].

use std::fmt::Display;

use crate::types::{Result, StoreError};

/// Callback receiving one status entry; nonzero aborts the walk.
pub type StatusFn<'a> = dyn FnMut(&str, &str) -> i32 + 'a;

/// Reports one entry, converting an abort into an error.
pub(crate) fn report(cb: &mut StatusFn<'_>, name: &str, value: impl Display) -> Result<()> {
    match cb(name, &value.to_string()) {
        0 => Ok(()),
        code => Err(StoreError::Callback(code)),
    }
}

/// Collects a full walk into a vector; handy for tools and tests.
pub fn collect<F>(walk: F) -> Result<Vec<(String, String)>>
where
    F: FnOnce(&mut StatusFn<'_>) -> Result<()>,
{
    let mut entries = Vec::new();
    walk(&mut |name: &str, value: &str| {
        entries.push((name.to_string(), value.to_string()));
        0
    })?;
    Ok(entries)
}
