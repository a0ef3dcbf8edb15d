#![forbid(unsafe_code)]

use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::primitives::io::DirHandle;
use crate::types::{Result, StoreError};

enum CompletionState {
    Pending,
    Done(Option<StoreError>),
}

struct Shared {
    state: Mutex<CompletionState>,
    cond: Condvar,
}

/// Pollable handle on an operation that may still be running in the background.
///
/// Every clone observes the same outcome; a failure is reported to each
/// waiter.
#[derive(Clone)]
pub struct Completion {
    shared: Arc<Shared>,
}

impl Completion {
    /// Returns a completion that is already resolved with `result`.
    pub fn ready(result: Result<()>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(CompletionState::Done(result.err())),
                cond: Condvar::new(),
            }),
        }
    }

    fn pending() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(CompletionState::Pending),
                cond: Condvar::new(),
            }),
        }
    }

    /// Runs `job` inline when `block` is set, otherwise on a named worker thread.
    pub fn run<F>(name: &str, block: bool, job: F) -> Result<Self>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        if block {
            return Ok(Self::ready(job()));
        }
        let completion = Self::pending();
        let worker = completion.clone();
        let label = name.to_string();
        thread::Builder::new()
            .name(format!("partmap-{name}"))
            .spawn(move || {
                let result = job();
                if let Err(err) = &result {
                    debug!(job = %label, error = %err, "completion.job_failed");
                }
                worker.resolve(result);
            })
            .map_err(StoreError::from)?;
        Ok(completion)
    }

    fn resolve(&self, result: Result<()>) {
        let mut state = self.shared.state.lock();
        *state = CompletionState::Done(result.err());
        self.shared.cond.notify_all();
    }

    /// Returns true once the operation has finished, successfully or not.
    pub fn is_complete(&self) -> bool {
        matches!(*self.shared.state.lock(), CompletionState::Done(_))
    }

    /// Blocks until the operation finishes and returns its outcome.
    pub fn wait(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        loop {
            match &*state {
                CompletionState::Done(None) => return Ok(()),
                CompletionState::Done(Some(err)) => return Err(err.duplicate()),
                CompletionState::Pending => self.shared.cond.wait(&mut state),
            }
        }
    }
}

/// Serializes directory fsyncs for one store.
///
/// At most one operation is outstanding; a new request waits for the previous
/// one before it is issued against the same directories.
#[derive(Default)]
pub struct DirSyncContext {
    outstanding: Mutex<Option<Completion>>,
}

impl DirSyncContext {
    /// Creates an idle context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Issues a sync of `dirs`. With `hard_sync` unset the directories are left
    /// to the OS flush schedule and the completion resolves immediately.
    pub fn submit(&self, dirs: Vec<DirHandle>, hard_sync: bool, block: bool) -> Result<Completion> {
        let mut outstanding = self.outstanding.lock();
        if let Some(previous) = outstanding.take() {
            previous.wait()?;
        }
        if !hard_sync {
            return Ok(Completion::ready(Ok(())));
        }
        let completion = Completion::run("dir-sync", block, move || {
            for dir in &dirs {
                dir.sync()?;
            }
            Ok(())
        })?;
        if !completion.is_complete() {
            *outstanding = Some(completion.clone());
        }
        Ok(completion)
    }

    /// Waits for the outstanding operation, if any.
    pub fn wait(&self) -> Result<()> {
        let previous = self.outstanding.lock().take();
        match previous {
            Some(completion) => completion.wait(),
            None => Ok(()),
        }
    }

    /// Returns true when an operation is still in flight.
    pub fn is_busy(&self) -> bool {
        self.outstanding
            .lock()
            .as_ref()
            .map(|completion| !completion.is_complete())
            .unwrap_or(false)
    }
}
