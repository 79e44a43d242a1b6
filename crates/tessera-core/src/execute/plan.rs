//! Choosing which cells a run touches and in what batches.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::config::RunMode;
use crate::graph::{CellId, GraphEngine};
use crate::state::{CellState, ErrorInfo, ExecutionStore};

/// The cells one run request will dispatch, grouped into batches.
///
/// Building a plan changes nothing; the scheduler queues the batch cells
/// afterwards.
#[derive(Debug, Default)]
pub(crate) struct RunPlan {
    /// Cells to dispatch. A cell only depends on cells of earlier batches or
    /// on cells whose current output can be used as is.
    pub batches: Vec<Vec<CellId>>,
    /// Every cell the plan considered, in the order it will be reported.
    pub scope: Vec<CellId>,
    /// Cells whose output cannot be used by this run, mapped to the cell
    /// that caused it. Blocked and disabled cells map to themselves.
    pub origins: FxHashMap<CellId, CellId>,
    /// Cells skipped because something upstream is unusable.
    pub unavailable: FxHashMap<CellId, ErrorInfo>,
    /// Cells held back only because another run owns them or an input.
    pub deferred: Vec<CellId>,
}

impl RunPlan {
    /// Plan a run of `requested`.
    ///
    /// Stale or failed ancestors are pulled in first. In autorun mode every
    /// descendant is in scope too; in lazy mode only the pulled set is.
    /// A cell in scope runs when it is stale, when its last run failed, or
    /// when something it depends on runs in this plan.
    pub fn build(
        graph: &GraphEngine,
        store: &ExecutionStore,
        requested: &[CellId],
        mode: RunMode,
    ) -> Self {
        let mut pull: FxHashSet<CellId> = requested
            .iter()
            .copied()
            .filter(|&id| graph.contains(id))
            .collect();
        for &id in requested {
            for ancestor in graph.ancestors_of(id) {
                if needs_rerun(store, ancestor) {
                    pull.insert(ancestor);
                }
            }
        }

        let scope_set = match mode {
            RunMode::Autorun => graph.descendants_of(pull.iter().copied()),
            RunMode::Lazy => pull,
        };

        let mut plan = RunPlan::default();
        let mut dirty: FxHashSet<CellId> = FxHashSet::default();
        let mut visited: FxHashSet<CellId> = FxHashSet::default();

        for level in graph.levels_within(&scope_set) {
            let mut batch = Vec::new();
            for cell in level {
                visited.insert(cell);
                plan.scope.push(cell);
                if plan.consider(graph, store, cell, &dirty) {
                    dirty.insert(cell);
                    batch.push(cell);
                }
            }
            if !batch.is_empty() {
                plan.batches.push(batch);
            }
        }

        // Whatever Kahn layering never reached sits on or below a cycle
        let stuck: Vec<CellId> = graph
            .cell_ids()
            .filter(|c| scope_set.contains(c) && !visited.contains(c))
            .collect();
        for cell in stuck {
            plan.scope.push(cell);
            if store.is_blocked(cell) {
                plan.origins.insert(cell, cell);
                continue;
            }
            let origin = graph
                .ancestors_of(cell)
                .into_iter()
                .find(|&a| store.is_blocked(a))
                .unwrap_or(cell);
            plan.origins.insert(cell, origin);
            plan.unavailable.insert(cell, ErrorInfo::unavailable(origin));
        }

        plan
    }

    /// Decide whether `cell` runs, recording why when it cannot.
    fn consider(
        &mut self,
        graph: &GraphEngine,
        store: &ExecutionStore,
        cell: CellId,
        dirty: &FxHashSet<CellId>,
    ) -> bool {
        let Some(state) = store.get_state(cell) else {
            return false;
        };
        // Blocked, disabled, or owned by another run in progress
        if store.is_blocked(cell) || state == CellState::Disabled || state.is_active() {
            self.origins.insert(cell, cell);
            if state.is_active() {
                self.deferred.push(cell);
            }
            return false;
        }

        let mut upstream_runs = false;
        for parent in graph.parents_of(cell) {
            let origin = if let Some(&origin) = self.origins.get(&parent) {
                Some(origin)
            } else if dirty.contains(&parent) {
                upstream_runs = true;
                None
            } else if store.get_state(parent) != Some(CellState::Idle) {
                Some(parent)
            } else {
                None
            };
            if let Some(origin) = origin {
                if store.get_state(origin).is_some_and(CellState::is_active) {
                    self.deferred.push(cell);
                }
                self.origins.insert(cell, origin);
                self.unavailable.insert(cell, ErrorInfo::unavailable(origin));
                return false;
            }
        }

        upstream_runs || needs_rerun(store, cell)
    }

    /// All cells that will be dispatched, in dispatch order.
    pub fn cells(&self) -> impl Iterator<Item = CellId> + '_ {
        self.batches.iter().flatten().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
}

/// Stale, or in error for a reason a rerun could fix.
fn needs_rerun(store: &ExecutionStore, cell: CellId) -> bool {
    match store.get_state(cell) {
        Some(CellState::Stale) => true,
        Some(CellState::Error) => !store.is_blocked(cell),
        _ => false,
    }
}
