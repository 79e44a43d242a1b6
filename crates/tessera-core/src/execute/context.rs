//! Bookkeeping for dispatched runs: abort flags and the completion channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::time::{Duration, Instant};

use super::runner::{RunFailure, RunOutput};
use crate::graph::CellId;

/// Shared flag telling a runner the scheduler no longer wants its result.
///
/// The scheduler raises it on cancel, timeout, delete and disable. Runners
/// that can stop early should poll it; those that cannot simply finish and
/// have their result discarded.
///
/// ```
/// use tessera_core::execute::AbortHandle;
///
/// let handle = AbortHandle::new();
/// let seen_by_runner = handle.clone();
/// handle.abort();
/// assert!(seen_by_runner.is_aborted());
/// ```
#[derive(Debug, Clone, Default)]
pub struct AbortHandle {
    aborted: Arc<AtomicBool>,
}

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Relaxed)
    }

    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Relaxed);
    }
}

/// Message that ends the wait for one dispatched cell.
#[derive(Debug)]
pub(crate) enum Completion {
    /// A worker picked the cell up and is calling the runner.
    Started { cell: CellId, at: Instant },
    /// The runner returned.
    Finished {
        cell: CellId,
        result: Result<RunOutput, RunFailure>,
    },
    /// The scheduler settled the cell itself (cancel, delete, disable or a
    /// structural error); any later result is ignored.
    Released { cell: CellId },
}

/// A cell handed to the worker pool.
///
/// It stays `Queued` until a worker reports it started; only then does the
/// timeout clock run.
#[derive(Debug)]
pub(crate) struct InFlight {
    pub tx: Sender<Completion>,
    pub abort: AbortHandle,
    pub started: Option<Instant>,
}

impl InFlight {
    pub fn new(tx: Sender<Completion>, abort: AbortHandle) -> Self {
        Self {
            tx,
            abort,
            started: None,
        }
    }

    /// Time spent in the runner so far, `None` while still waiting for a
    /// worker.
    pub fn running_for(&self) -> Option<Duration> {
        self.started.map(|at| at.elapsed())
    }

    /// Abort the runner and wake the dispatch loop.
    pub fn release(self, cell: CellId) {
        self.abort.abort();
        // The loop may already be gone if the batch ended
        let _ = self.tx.send(Completion::Released { cell });
    }
}
