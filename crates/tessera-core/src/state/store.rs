//! Per-cell execution state, last output and last error.
//!
//! The store is owned by the scheduler and changed only through it. Every
//! state change is pushed to subscribers as it happens.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::mpsc::{self, UnboundedSender};

use super::cell_state::{CellState, ErrorInfo};
use super::subscription::{StateChange, StateSubscription};
use crate::error::{Error, Result};
use crate::execute::RunOutput;
use crate::graph::CellId;

#[derive(Debug)]
struct CellRecord {
    state: CellState,
    last_error: Option<ErrorInfo>,
    /// Output of the most recent successful run.
    output: Option<Arc<RunOutput>>,
    /// Set when the cell was asked to go stale while queued or running.
    restale: bool,
    /// The cell was disabled when a blocking error took over; it goes back
    /// to `Disabled` once unblocked.
    disable_on_unblock: bool,
}

impl CellRecord {
    fn new() -> Self {
        Self {
            state: CellState::Idle,
            last_error: None,
            output: None,
            restale: false,
            disable_on_unblock: false,
        }
    }
}

/// Execution state store.
#[derive(Default)]
pub struct ExecutionStore {
    cells: BTreeMap<CellId, CellRecord>,
    subscribers: Vec<UnboundedSender<StateChange>>,
}

impl ExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a cell in `Idle`. No-op for a known cell.
    pub fn register(&mut self, id: CellId) {
        if self.cells.contains_key(&id) {
            return;
        }
        self.cells.insert(id, CellRecord::new());
        self.emit(id, CellState::Idle);
    }

    /// Stop tracking a cell, discarding its state and output.
    pub fn remove(&mut self, id: CellId) -> bool {
        self.cells.remove(&id).is_some()
    }

    pub fn contains(&self, id: CellId) -> bool {
        self.cells.contains_key(&id)
    }

    pub fn get_state(&self, id: CellId) -> Option<CellState> {
        self.cells.get(&id).map(|r| r.state)
    }

    pub fn last_error(&self, id: CellId) -> Option<&ErrorInfo> {
        self.cells.get(&id).and_then(|r| r.last_error.as_ref())
    }

    /// In error for a reason only an edit can fix.
    pub fn is_blocked(&self, id: CellId) -> bool {
        self.last_error(id).is_some_and(|e| e.kind.blocks_execution())
    }

    pub fn output(&self, id: CellId) -> Option<Arc<RunOutput>> {
        self.cells.get(&id).and_then(|r| r.output.clone())
    }

    fn record_mut(&mut self, id: CellId) -> Result<&mut CellRecord> {
        self.cells.get_mut(&id).ok_or(Error::CellNotFound(id))
    }

    /// Set a state without consulting the transition table.
    pub fn set_state(&mut self, id: CellId, state: CellState) -> Result<()> {
        let record = self.record_mut(id)?;
        if record.state == state {
            return Ok(());
        }
        record.state = state;
        if state != CellState::Error {
            record.last_error = None;
        }
        self.emit(id, state);
        Ok(())
    }

    /// Move a cell along an edge of the state machine.
    ///
    /// Staying in the same state is accepted and does nothing.
    pub fn transition(&mut self, id: CellId, to: CellState) -> Result<()> {
        let from = self.get_state(id).ok_or(Error::CellNotFound(id))?;
        if from == to {
            return Ok(());
        }
        if !from.can_transition_to(to) {
            tracing::warn!("rejected transition for {}: {} -> {}", id, from, to);
            return Err(Error::InvalidTransition { cell: id, from, to });
        }
        self.set_state(id, to)
    }

    /// Mark cells stale after an upstream change.
    ///
    /// Queued and running cells keep their state and are flagged to go stale
    /// once their current run resolves. Disabled cells and cells held in
    /// error by a structural problem are left alone.
    /// Returns the cells whose state actually changed.
    pub fn mark_stale(&mut self, ids: impl IntoIterator<Item = CellId>) -> Vec<CellId> {
        let mut changed = Vec::new();
        for id in ids {
            let Some(record) = self.cells.get_mut(&id) else {
                continue;
            };
            match record.state {
                CellState::Error
                    if record
                        .last_error
                        .as_ref()
                        .is_some_and(|e| e.kind.blocks_execution()) => {}
                CellState::Idle | CellState::Error => {
                    changed.push(id);
                    // Errors are cleared optimistically; the rerun confirms
                    let _ = self.set_state(id, CellState::Stale);
                }
                CellState::Queued | CellState::Running => record.restale = true,
                CellState::Stale | CellState::Disabled => {}
            }
        }
        changed
    }

    /// Put a cell in `Error` regardless of its current state.
    pub fn force_error(&mut self, id: CellId, error: ErrorInfo) -> Result<()> {
        let record = self.record_mut(id)?;
        let changed = record.state != CellState::Error;
        if record.state == CellState::Disabled {
            record.disable_on_unblock = true;
        }
        record.state = CellState::Error;
        record.last_error = Some(error);
        record.restale = false;
        if changed {
            self.emit(id, CellState::Error);
        }
        Ok(())
    }

    /// Keep or drop the request to return to `Disabled` when the cell's
    /// blocking error clears.
    pub fn set_disable_on_unblock(&mut self, id: CellId, disabled: bool) -> Result<()> {
        self.record_mut(id)?.disable_on_unblock = disabled;
        Ok(())
    }

    /// Leave a blocking error: back to `Disabled` if the cell was disabled
    /// before, `Stale` otherwise. Returns the new state.
    pub fn unblock(&mut self, id: CellId) -> Result<CellState> {
        let record = self.record_mut(id)?;
        let next = if std::mem::take(&mut record.disable_on_unblock) {
            CellState::Disabled
        } else {
            CellState::Stale
        };
        self.set_state(id, next)?;
        Ok(next)
    }

    /// Record a failed run: `Running -> Error`.
    pub fn fail(&mut self, id: CellId, error: ErrorInfo) -> Result<()> {
        self.transition(id, CellState::Error)?;
        let record = self.record_mut(id)?;
        record.last_error = Some(error);
        record.restale = false;
        Ok(())
    }

    /// Record a successful run and return the state the cell ends in.
    ///
    /// The output is always kept. The cell ends `Idle`, or `Stale` if it was
    /// invalidated while running.
    pub fn complete(&mut self, id: CellId, output: RunOutput) -> Result<CellState> {
        let record = self.record_mut(id)?;
        record.output = Some(Arc::new(output));
        let next = if std::mem::take(&mut record.restale) {
            CellState::Stale
        } else {
            CellState::Idle
        };
        self.transition(id, next)?;
        Ok(next)
    }

    /// Clear and return the deferred-stale flag.
    pub fn take_restale(&mut self, id: CellId) -> bool {
        self.cells
            .get_mut(&id)
            .is_some_and(|r| std::mem::take(&mut r.restale))
    }

    /// Current state of every cell, ordered by id.
    pub fn snapshot(&self) -> Vec<StateChange> {
        self.cells
            .iter()
            .map(|(&cell, r)| StateChange {
                cell,
                state: r.state,
            })
            .collect()
    }

    /// Open a feed: the current snapshot, then live changes.
    pub fn subscribe(&mut self) -> StateSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        for change in self.snapshot() {
            // Receiver is alive; it is in our hands
            let _ = tx.send(change);
        }
        self.subscribers.push(tx);
        StateSubscription::new(rx)
    }

    fn emit(&mut self, cell: CellId, state: CellState) {
        let change = StateChange { cell, state };
        self.subscribers.retain(|tx| tx.send(change).is_ok());
    }
}
