//! The reactive scheduler.
//!
//! Ties the dependency graph to the execution store: edits and deletes
//! update the graph, invalidate what depends on them and, in autorun mode,
//! run the affected cells batch by batch on a worker pool.

use std::collections::BTreeSet;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{RunMode, SchedulerConfig};
use crate::error::{Error, Result};
use crate::execute::{
    AbortHandle, Bindings, CellReport, Completion, Dispatch, InFlight, RunFailure, RunOutput,
    RunPlan, RunReport, RunRequest, Runner, run_guarded,
};
use crate::graph::{
    CellId, GraphEngine, GraphSnapshot, NameExtractor, NameSets, RustCellExtractor,
    StructuralStatus,
};
use crate::state::{CellState, ErrorInfo, ErrorKind, ExecutionStore, StateSubscription};

fn lock_error<T>(e: PoisonError<T>) -> Error {
    Error::Execution(format!("scheduler lock poisoned (thread panicked): {}", e))
}

/// What an edit, delete or enable did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EditOutcome {
    /// Structural status of the whole graph after the change.
    pub status: StructuralStatus,
    /// Cells moved to `Stale` by the change.
    pub invalidated: Vec<CellId>,
    /// The run the change triggered, in autorun mode.
    pub report: Option<RunReport>,
}

/// Reactive notebook scheduler.
///
/// All methods take `&self`; the scheduler can be shared between threads and
/// `cancel` can be called while another thread is inside `run`.
pub struct Scheduler {
    notebook: Mutex<Notebook>,
    extractor: Arc<dyn NameExtractor>,
    runner: Arc<dyn Runner>,
    pool: rayon::ThreadPool,
    config: SchedulerConfig,
}

impl Scheduler {
    /// Create a scheduler with the Rust cell extractor.
    pub fn new(config: SchedulerConfig, runner: impl Runner + 'static) -> Result<Self> {
        let mut builder =
            rayon::ThreadPoolBuilder::new().thread_name(|i| format!("tessera-runner-{}", i));
        if let Some(threads) = config.max_parallelism {
            builder = builder.num_threads(threads);
        }
        let pool = builder
            .build()
            .map_err(|e| Error::Execution(format!("failed to start worker pool: {}", e)))?;

        Ok(Self {
            notebook: Mutex::new(Notebook::new(&config.private_prefix)),
            extractor: Arc::new(RustCellExtractor::with_private_prefix(
                config.private_prefix.clone(),
            )),
            runner: Arc::new(runner),
            pool,
            config,
        })
    }

    /// Replace the extractor used by [`Scheduler::on_edit`].
    pub fn with_extractor(mut self, extractor: impl NameExtractor + 'static) -> Self {
        self.extractor = Arc::new(extractor);
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    fn lock(&self) -> Result<MutexGuard<'_, Notebook>> {
        self.notebook.lock().map_err(lock_error)
    }

    /// Register or update a cell from its source.
    ///
    /// A source the extractor rejects leaves the cell in `Error` with kind
    /// `Parse` and no names. The edited cell and everything downstream go
    /// stale; in autorun mode they are run before this returns.
    pub fn on_edit(&self, id: CellId, source: impl Into<String>) -> Result<EditOutcome> {
        let source = source.into();
        let extracted = self.extractor.extract(&source);
        self.apply_edit(id, Some(source), extracted)
    }

    /// Register or update a cell from name sets computed elsewhere.
    pub fn on_edit_names(&self, id: CellId, names: NameSets) -> Result<EditOutcome> {
        self.apply_edit(id, None, Ok(names))
    }

    fn apply_edit(
        &self,
        id: CellId,
        source: Option<String>,
        extracted: Result<NameSets>,
    ) -> Result<EditOutcome> {
        let (status, invalidated, plan) = {
            let mut nb = self.lock()?;
            match source {
                Some(source) => {
                    nb.sources.insert(id, source);
                }
                None => {
                    nb.sources.entry(id).or_default();
                }
            }
            nb.store.register(id);

            let (names, parse_error) = match extracted {
                Ok(names) => (names, None),
                Err(e) => (
                    NameSets::default(),
                    Some(ErrorInfo::new(ErrorKind::Parse, e.to_string())),
                ),
            };

            let former_children = nb.graph.children_of(id);
            let status = nb.graph.upsert_cell(id, names);
            let change = nb.apply_structure(&status)?;

            match parse_error {
                Some(error) => {
                    warn!("{} does not parse: {}", id, error.message);
                    nb.settle(id);
                    nb.store.force_error(id, error)?;
                }
                None if nb.store.is_blocked(id) && !nb.structural.contains(&id) => {
                    nb.store.unblock(id)?;
                }
                None => {}
            }

            // Readers of names the cell no longer defines need a rerun too
            let mut roots = vec![id];
            roots.extend(former_children);
            roots.extend(change.resolved);
            let invalidated = nb.invalidate(
                roots
                    .iter()
                    .copied()
                    .chain(change.violated.iter().copied()),
            );

            let plan = if self.config.is_eager() {
                Some(nb.prepare(&roots, self.config.run_mode)?)
            } else {
                None
            };
            (status, invalidated, plan)
        };

        if !status.is_ok() {
            info!(
                "edit of {} left {} structural violation(s)",
                id,
                status.violations().len()
            );
        }
        let report = plan.map(|p| self.execute(p)).transpose()?;
        Ok(EditOutcome {
            status,
            invalidated,
            report,
        })
    }

    /// Remove a cell. Its former dependents go stale and, in autorun mode,
    /// are run again.
    pub fn on_delete(&self, id: CellId) -> Result<EditOutcome> {
        let (status, invalidated, plan) = {
            let mut nb = self.lock()?;
            let (children, status) = nb.graph.remove_cell(id)?;
            nb.settle(id);
            nb.store.remove(id);
            nb.sources.remove(&id);
            nb.structural.remove(&id);
            debug!("removed {} with {} dependent(s)", id, children.len());

            let change = nb.apply_structure(&status)?;
            let mut roots = children;
            roots.extend(change.resolved.iter().copied());

            let invalidated = nb.invalidate(
                roots
                    .iter()
                    .copied()
                    .chain(change.violated.iter().copied()),
            );
            let plan = if self.config.is_eager() {
                Some(nb.prepare(&roots, self.config.run_mode)?)
            } else {
                None
            };
            (status, invalidated, plan)
        };

        let report = plan.map(|p| self.execute(p)).transpose()?;
        Ok(EditOutcome {
            status,
            invalidated,
            report,
        })
    }

    /// Run the requested cells, their stale ancestors and, in autorun mode,
    /// their descendants. Blocks until every dispatched cell has resolved.
    ///
    /// Running an up-to-date cell dispatches nothing.
    pub fn run(&self, ids: &[CellId]) -> Result<RunReport> {
        let plan = {
            let mut nb = self.lock()?;
            if let Some(&missing) = ids.iter().find(|&&id| !nb.graph.contains(id)) {
                return Err(Error::CellNotFound(missing));
            }
            nb.prepare(ids, self.config.run_mode)?
        };
        info!(
            "run of {} cell(s): {} batch(es) planned",
            ids.len(),
            plan.batches.len()
        );
        self.execute(plan)
    }

    /// Run every stale cell.
    pub fn run_stale(&self) -> Result<RunReport> {
        let stale: Vec<CellId> = {
            let nb = self.lock()?;
            nb.store
                .snapshot()
                .into_iter()
                .filter(|c| c.state == CellState::Stale)
                .map(|c| c.cell)
                .collect()
        };
        self.run(&stale)
    }

    /// Cancel a queued or running cell. Returns whether anything was
    /// cancelled.
    ///
    /// The cell ends in `Error` with kind `Cancelled`; a result the runner
    /// delivers later is discarded.
    pub fn cancel(&self, id: CellId) -> Result<bool> {
        let mut nb = self.lock()?;
        let state = nb.store.get_state(id).ok_or(Error::CellNotFound(id))?;
        nb.cancel(id, state)
    }

    /// Cancel every queued or running cell, returning the cancelled cells.
    pub fn cancel_all(&self) -> Result<Vec<CellId>> {
        let mut nb = self.lock()?;
        let active: Vec<(CellId, CellState)> = nb
            .store
            .snapshot()
            .into_iter()
            .filter(|c| c.state.is_active())
            .map(|c| (c.cell, c.state))
            .collect();

        let mut cancelled = Vec::new();
        for (id, state) in active {
            if nb.cancel(id, state)? {
                cancelled.push(id);
            }
        }
        Ok(cancelled)
    }

    /// Disable or re-enable a cell.
    ///
    /// A disabled cell never runs and its dependents are skipped. Enabling
    /// makes it stale again; autorun mode runs it right away. A cell held in
    /// a structural or parse error keeps that error and comes back disabled
    /// once it clears.
    pub fn set_disabled(&self, id: CellId, disabled: bool) -> Result<EditOutcome> {
        let (status, invalidated, plan) = {
            let mut nb = self.lock()?;
            let state = nb.store.get_state(id).ok_or(Error::CellNotFound(id))?;
            let status = nb.graph.status().clone();

            if disabled {
                // Blocked cells keep their error and are disabled once it clears
                if nb.store.is_blocked(id) {
                    nb.store.set_disable_on_unblock(id, true)?;
                    info!("{} will stay disabled once unblocked", id);
                }
                if state == CellState::Disabled || nb.store.is_blocked(id) {
                    return Ok(EditOutcome {
                        status,
                        invalidated: Vec::new(),
                        report: None,
                    });
                }
                nb.settle(id);
                nb.store.transition(id, CellState::Disabled)?;
                info!("disabled {}", id);
                let children = nb.graph.children_of(id);
                let invalidated = nb.invalidate(children);
                (status, invalidated, None)
            } else {
                nb.store.set_disable_on_unblock(id, false)?;
                if state != CellState::Disabled {
                    return Ok(EditOutcome {
                        status,
                        invalidated: Vec::new(),
                        report: None,
                    });
                }
                nb.store.transition(id, CellState::Stale)?;
                info!("enabled {}", id);
                let mut invalidated = vec![id];
                invalidated.extend(nb.invalidate([id]));
                let plan = if self.config.is_eager() {
                    Some(nb.prepare(&[id], self.config.run_mode)?)
                } else {
                    None
                };
                (status, invalidated, plan)
            }
        };

        let report = plan.map(|p| self.execute(p)).transpose()?;
        Ok(EditOutcome {
            status,
            invalidated,
            report,
        })
    }

    /// Feed of state changes: the current state of every cell, then each
    /// change as it happens.
    pub fn subscribe_state_changes(&self) -> Result<StateSubscription> {
        Ok(self.lock()?.store.subscribe())
    }

    /// Cells, edges and structural status, with each cell's current state.
    pub fn graph_snapshot(&self) -> Result<GraphSnapshot> {
        let nb = self.lock()?;
        let mut snapshot = nb.graph.snapshot();
        for cell in &mut snapshot.cells {
            cell.state = nb.store.get_state(cell.id);
        }
        Ok(snapshot)
    }

    pub fn status(&self) -> Result<StructuralStatus> {
        Ok(self.lock()?.graph.status().clone())
    }

    pub fn state_of(&self, id: CellId) -> Result<CellState> {
        self.lock()?
            .store
            .get_state(id)
            .ok_or(Error::CellNotFound(id))
    }

    pub fn last_error(&self, id: CellId) -> Result<Option<ErrorInfo>> {
        let nb = self.lock()?;
        if !nb.store.contains(id) {
            return Err(Error::CellNotFound(id));
        }
        Ok(nb.store.last_error(id).cloned())
    }

    /// Output of the cell's most recent successful run.
    pub fn output(&self, id: CellId) -> Result<Option<Arc<RunOutput>>> {
        let nb = self.lock()?;
        if !nb.store.contains(id) {
            return Err(Error::CellNotFound(id));
        }
        Ok(nb.store.output(id))
    }

    /// Registered cells in registration order.
    pub fn cell_ids(&self) -> Result<Vec<CellId>> {
        Ok(self.lock()?.graph.cell_ids().collect())
    }

    /// Execute a queued plan, then in autorun mode keep rerunning cells a
    /// concurrent change left stale until nothing is left to pick up.
    fn execute(&self, plan: RunPlan) -> Result<RunReport> {
        let mut report = RunReport::default();
        let mut next = Some(plan);

        while let Some(plan) = next.take() {
            let (part, followups) = self.execute_plan(plan)?;
            report.absorb(part);
            if !self.config.is_eager() || followups.is_empty() {
                break;
            }

            let mut nb = self.lock()?;
            let stale: Vec<CellId> = followups
                .into_iter()
                .filter(|&c| nb.store.get_state(c) == Some(CellState::Stale))
                .collect();
            if stale.is_empty() {
                break;
            }
            let plan = nb.prepare(&stale, self.config.run_mode)?;
            if plan.is_empty() {
                break;
            }
            debug!("picking up {} cell(s) left stale mid-run", stale.len());
            next = Some(plan);
        }

        Ok(report)
    }

    /// Dispatch a plan batch by batch. Returns the report and the cells that
    /// may need another run because something concurrent got in the way.
    fn execute_plan(&self, plan: RunPlan) -> Result<(RunReport, Vec<CellId>)> {
        let RunPlan {
            batches,
            scope,
            mut origins,
            mut unavailable,
            deferred,
        } = plan;
        let planned: FxHashSet<CellId> = batches.iter().flatten().copied().collect();
        let mut dispatches = Vec::new();
        let mut followups = deferred;
        let mut batch_no = 0;

        for batch in &batches {
            let (tx, rx) = mpsc::channel();
            let requests = {
                let mut nb = self.lock()?;
                nb.start_batch(batch, batch_no, &tx, &mut origins, &mut unavailable)?
            };
            if requests.is_empty() {
                continue;
            }
            debug!("batch {}: dispatching {} cell(s)", batch_no, requests.len());

            let mut pending: FxHashSet<CellId> = FxHashSet::default();
            for request in requests {
                pending.insert(request.cell);
                dispatches.push(Dispatch {
                    cell: request.cell,
                    batch: batch_no,
                });
                let runner = Arc::clone(&self.runner);
                let tx = tx.clone();
                self.pool.spawn(move || {
                    // Settled while waiting for a worker
                    if request.abort.is_aborted() {
                        return;
                    }
                    let _ = tx.send(Completion::Started {
                        cell: request.cell,
                        at: Instant::now(),
                    });
                    let result = run_guarded(runner.as_ref(), &request);
                    // Receiver is gone only if the wait was abandoned
                    let _ = tx.send(Completion::Finished {
                        cell: request.cell,
                        result,
                    });
                });
            }

            while !pending.is_empty() {
                let Some(completion) = self.next_completion(&rx, &mut pending, &mut origins)? else {
                    continue;
                };
                let cell = match &completion {
                    Completion::Started { cell, at } => {
                        if pending.contains(cell) {
                            self.lock()?.start(*cell, *at)?;
                        }
                        continue;
                    }
                    Completion::Finished { cell, .. } | Completion::Released { cell } => *cell,
                };
                if !pending.remove(&cell) {
                    debug!("ignoring late completion for {}", cell);
                    continue;
                }

                let mut nb = self.lock()?;
                match completion {
                    Completion::Started { .. } => {}
                    Completion::Released { .. } => {
                        origins.insert(cell, cell);
                    }
                    Completion::Finished { result, .. } => match nb.finish(cell, result)? {
                        Finished::Idle => {
                            let outside: Vec<CellId> = nb
                                .graph
                                .children_of(cell)
                                .into_iter()
                                .filter(|c| !planned.contains(c))
                                .collect();
                            nb.invalidate(outside);
                        }
                        Finished::Superseded => {
                            origins.insert(cell, cell);
                            followups.push(cell);
                        }
                        Finished::Failed | Finished::Discarded => {
                            origins.insert(cell, cell);
                        }
                    },
                }
            }
            batch_no += 1;
        }

        let nb = self.lock()?;
        let cells = scope
            .into_iter()
            .filter_map(|cell| {
                let state = nb.store.get_state(cell)?;
                let error = if state == CellState::Error {
                    nb.store.last_error(cell).cloned()
                } else {
                    unavailable.remove(&cell)
                };
                Some(CellReport { cell, state, error })
            })
            .collect();

        Ok((RunReport { cells, dispatches }, followups))
    }

    /// Wait for the next completion, enforcing the cell timeout.
    ///
    /// Returns `None` when the wait ended because cells timed out; those
    /// cells are settled and dropped from `pending`.
    fn next_completion(
        &self,
        rx: &Receiver<Completion>,
        pending: &mut FxHashSet<CellId>,
        origins: &mut FxHashMap<CellId, CellId>,
    ) -> Result<Option<Completion>> {
        let closed = || Error::Execution("completion channel closed".to_string());

        let Some(limit) = self.config.cell_timeout else {
            return rx.recv().map(Some).map_err(|_| closed());
        };

        let wait = self.lock()?.time_left(pending, limit);
        match rx.recv_timeout(wait) {
            Ok(completion) => Ok(Some(completion)),
            Err(RecvTimeoutError::Timeout) => {
                for cell in self.lock()?.expire(pending, limit)? {
                    pending.remove(&cell);
                    origins.insert(cell, cell);
                }
                Ok(None)
            }
            Err(RecvTimeoutError::Disconnected) => Err(closed()),
        }
    }
}

/// How a finished run was applied.
enum Finished {
    Idle,
    /// Succeeded, but the cell was invalidated while it ran.
    Superseded,
    Failed,
    /// The cell was settled by someone else first.
    Discarded,
}

/// Structural changes from one graph update.
struct StructureChange {
    /// Cells that left every violation.
    resolved: Vec<CellId>,
    /// Cells newly put in error by a violation.
    violated: Vec<CellId>,
}

/// Everything behind the scheduler lock.
struct Notebook {
    graph: GraphEngine,
    store: ExecutionStore,
    sources: FxHashMap<CellId, String>,
    in_flight: FxHashMap<CellId, InFlight>,
    /// Members of the current structural violations.
    structural: BTreeSet<CellId>,
}

impl Notebook {
    fn new(private_prefix: &str) -> Self {
        Self {
            graph: GraphEngine::with_private_prefix(private_prefix),
            store: ExecutionStore::new(),
            sources: FxHashMap::default(),
            in_flight: FxHashMap::default(),
            structural: BTreeSet::new(),
        }
    }

    /// Bring cell states in line with a new structural status.
    fn apply_structure(&mut self, status: &StructuralStatus) -> Result<StructureChange> {
        let members = status.members();
        let mut violated = Vec::new();

        for &cell in &members {
            let Some(violation) = status.violation_for(cell) else {
                continue;
            };
            let error = ErrorInfo::structural(violation);
            if self.store.last_error(cell) == Some(&error) {
                continue;
            }
            warn!("{}: {}", cell, error.message);
            self.settle(cell);
            self.store.force_error(cell, error)?;
            violated.push(cell);
        }

        let resolved: Vec<CellId> = self
            .structural
            .difference(&members)
            .copied()
            .filter(|&c| self.store.contains(c))
            .collect();
        for &cell in &resolved {
            let structural_error = self
                .store
                .last_error(cell)
                .is_some_and(|e| matches!(e.kind, ErrorKind::Cycle | ErrorKind::MultipleDefinition));
            if structural_error && self.store.unblock(cell)? == CellState::Disabled {
                info!("{} stays disabled", cell);
            }
        }
        if !resolved.is_empty() {
            info!("structural violation resolved for {} cell(s)", resolved.len());
        }

        self.structural = members;
        Ok(StructureChange { resolved, violated })
    }

    /// Mark `roots` and everything downstream stale.
    fn invalidate(&mut self, roots: impl IntoIterator<Item = CellId>) -> Vec<CellId> {
        let closure = self.graph.descendants_of(roots);
        let mut ordered: Vec<CellId> = self
            .graph
            .cell_ids()
            .filter(|c| closure.contains(c))
            .collect();
        ordered.retain(|&c| self.store.contains(c));
        let changed = self.store.mark_stale(ordered);
        if !changed.is_empty() {
            debug!("invalidated {} cell(s)", changed.len());
        }
        changed
    }

    /// Build a plan and queue its cells.
    fn prepare(&mut self, requested: &[CellId], mode: RunMode) -> Result<RunPlan> {
        let plan = RunPlan::build(&self.graph, &self.store, requested, mode);
        let cells: Vec<CellId> = plan.cells().collect();
        for cell in cells {
            self.store.mark_stale([cell]);
            self.store.transition(cell, CellState::Queued)?;
        }
        Ok(plan)
    }

    /// Hand the ready cells of a batch to the pool and build their requests.
    /// They stay `Queued` until a worker starts them. Cells that lost an
    /// input since planning go back to `Stale`.
    fn start_batch(
        &mut self,
        batch: &[CellId],
        batch_no: usize,
        tx: &Sender<Completion>,
        origins: &mut FxHashMap<CellId, CellId>,
        unavailable: &mut FxHashMap<CellId, ErrorInfo>,
    ) -> Result<Vec<RunRequest>> {
        let mut requests = Vec::new();

        for &cell in batch {
            match self.store.get_state(cell) {
                Some(CellState::Queued) => {}
                // Cancelled, disabled or broken while waiting
                Some(_) => {
                    origins.insert(cell, cell);
                    continue;
                }
                None => continue,
            }

            let blocker = self.graph.parents_of(cell).into_iter().find_map(|parent| {
                origins.get(&parent).copied().or_else(|| {
                    (self.store.get_state(parent) != Some(CellState::Idle)).then_some(parent)
                })
            });
            if let Some(origin) = blocker {
                debug!("skipping {}: input from {} unavailable", cell, origin);
                self.store.take_restale(cell);
                self.store.transition(cell, CellState::Stale)?;
                origins.insert(cell, origin);
                unavailable.insert(cell, ErrorInfo::unavailable(origin));
                continue;
            }

            let inputs = self.inputs_for(cell);
            let abort = AbortHandle::new();
            self.in_flight
                .insert(cell, InFlight::new(tx.clone(), abort.clone()));
            requests.push(RunRequest {
                cell,
                source: self.sources.get(&cell).cloned().unwrap_or_default(),
                inputs,
                batch: batch_no,
                abort,
            });
        }

        Ok(requests)
    }

    /// Values of a cell's refs from the outputs of their definers.
    fn inputs_for(&self, cell: CellId) -> Bindings {
        let Some(names) = self.graph.names(cell) else {
            return Bindings::new();
        };
        names
            .refs
            .iter()
            .filter_map(|name| {
                let definer = self.graph.definer_of(name.as_str())?;
                let output = self.store.output(definer)?;
                let value = output.bindings.get(name)?;
                Some((name.clone(), value.clone()))
            })
            .collect()
    }

    /// Apply a runner result, unless the cell was settled meanwhile.
    fn finish(
        &mut self,
        cell: CellId,
        result: std::result::Result<RunOutput, RunFailure>,
    ) -> Result<Finished> {
        if self.in_flight.remove(&cell).is_none()
            || self.store.get_state(cell) != Some(CellState::Running)
        {
            warn!("discarding result for {}: no longer running", cell);
            return Ok(Finished::Discarded);
        }

        match result {
            Ok(output) => match self.store.complete(cell, output)? {
                CellState::Idle => Ok(Finished::Idle),
                _ => {
                    debug!("{} finished but was invalidated while running", cell);
                    Ok(Finished::Superseded)
                }
            },
            Err(failure) => {
                warn!("{} failed: {}", cell, failure);
                self.store
                    .fail(cell, ErrorInfo::run_failure(failure.message))?;
                Ok(Finished::Failed)
            }
        }
    }

    /// A worker began running `cell`: `Queued -> Running`, and the timeout
    /// clock starts.
    fn start(&mut self, cell: CellId, at: Instant) -> Result<()> {
        if self.store.get_state(cell) != Some(CellState::Queued) {
            return Ok(());
        }
        let Some(in_flight) = self.in_flight.get_mut(&cell) else {
            return Ok(());
        };
        in_flight.started = Some(at);
        self.store.transition(cell, CellState::Running)
    }

    /// Stop waiting for a running cell: abort its runner and wake the
    /// dispatch loop. No-op for cells that are not in flight.
    fn settle(&mut self, cell: CellId) {
        if let Some(in_flight) = self.in_flight.remove(&cell) {
            in_flight.release(cell);
        }
    }

    fn cancel(&mut self, id: CellId, state: CellState) -> Result<bool> {
        if !state.is_active() {
            return Ok(false);
        }
        self.settle(id);
        self.store.fail(id, ErrorInfo::cancelled())?;
        info!("cancelled {}", id);
        Ok(true)
    }

    /// Time until the oldest started cell hits the limit.
    fn time_left(&self, pending: &FxHashSet<CellId>, limit: Duration) -> Duration {
        pending
            .iter()
            .filter_map(|c| self.in_flight.get(c)?.running_for())
            .map(|elapsed| limit.saturating_sub(elapsed))
            .min()
            .unwrap_or(limit)
    }

    /// Settle every pending cell whose runner ran past the limit. Cells
    /// still waiting for a worker never expire.
    fn expire(&mut self, pending: &FxHashSet<CellId>, limit: Duration) -> Result<Vec<CellId>> {
        let expired: Vec<CellId> = pending
            .iter()
            .copied()
            .filter(|c| {
                self.in_flight
                    .get(c)
                    .and_then(InFlight::running_for)
                    .is_some_and(|elapsed| elapsed >= limit)
            })
            .collect();

        for &cell in &expired {
            if let Some(in_flight) = self.in_flight.remove(&cell) {
                in_flight.abort.abort();
            }
            warn!("{} timed out after {}ms", cell, limit.as_millis());
            self.store.fail(cell, ErrorInfo::timeout(limit))?;
        }
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Name;

    fn id(n: usize) -> CellId {
        CellId::new(n)
    }

    /// Cells written as `refs -> defs`.
    fn arrow_names(source: &str) -> Result<NameSets> {
        let (refs, defs) = source
            .split_once("->")
            .ok_or_else(|| Error::parse("missing ->"))?;
        NameSets::public(refs.split_whitespace(), defs.split_whitespace())
    }

    /// Binds every def to one more than the sum of the inputs.
    fn arrow_runner(request: &RunRequest) -> std::result::Result<RunOutput, RunFailure> {
        let (_, defs) = request.source.split_once("->").unwrap_or_default();
        if defs.contains("boom") {
            return Err(RunFailure::new("boom"));
        }
        let total: i64 = 1 + request
            .inputs
            .values()
            .filter_map(|v| v.as_i64())
            .sum::<i64>();
        Ok(defs
            .split_whitespace()
            .fold(RunOutput::new(), |out, def| {
                out.with_binding(Name::new(def).unwrap(), serde_json::json!(total))
            }))
    }

    fn scheduler(config: SchedulerConfig) -> Scheduler {
        Scheduler::new(config, arrow_runner)
            .unwrap()
            .with_extractor(arrow_names)
    }

    fn value(sched: &Scheduler, cell: usize, name: &str) -> Option<i64> {
        sched
            .output(id(cell))
            .unwrap()
            .and_then(|o| o.binding(name).and_then(|v| v.as_i64()))
    }

    #[test]
    fn test_edit_runs_chain_in_autorun() {
        let sched = scheduler(SchedulerConfig::eager());
        sched.on_edit(id(1), "-> x").unwrap();
        sched.on_edit(id(2), "x -> y").unwrap();
        let outcome = sched.on_edit(id(3), "y -> z").unwrap();

        assert!(outcome.status.is_ok());
        assert_eq!(outcome.report.unwrap().executed(), vec![id(3)]);
        assert_eq!(value(&sched, 1, "x"), Some(1));
        assert_eq!(value(&sched, 2, "y"), Some(2));
        assert_eq!(value(&sched, 3, "z"), Some(3));

        let report = sched.on_edit(id(1), "-> x").unwrap().report.unwrap();
        assert_eq!(report.batches(), vec![vec![id(1)], vec![id(2)], vec![id(3)]]);
        assert!(report.is_success());
    }

    #[test]
    fn test_lazy_edit_only_invalidates() {
        let sched = scheduler(SchedulerConfig::lazy());
        sched.on_edit(id(1), "-> x").unwrap();
        sched.on_edit(id(2), "x -> y").unwrap();
        sched.run(&[id(2)]).unwrap();
        assert_eq!(sched.state_of(id(2)).unwrap(), CellState::Idle);

        let outcome = sched.on_edit(id(1), "-> x").unwrap();
        assert!(outcome.report.is_none());
        assert_eq!(outcome.invalidated, vec![id(1), id(2)]);
        assert_eq!(sched.state_of(id(2)).unwrap(), CellState::Stale);
    }

    #[test]
    fn test_parse_error_blocks_cell_until_fixed() {
        let sched = scheduler(SchedulerConfig::eager());
        sched.on_edit(id(1), "no arrow").unwrap();
        assert_eq!(sched.state_of(id(1)).unwrap(), CellState::Error);
        assert_eq!(
            sched.last_error(id(1)).unwrap().map(|e| e.kind),
            Some(ErrorKind::Parse)
        );

        let report = sched.run(&[id(1)]).unwrap();
        assert!(report.dispatches.is_empty());

        sched.on_edit(id(1), "-> x").unwrap();
        assert_eq!(sched.state_of(id(1)).unwrap(), CellState::Idle);
    }

    #[test]
    fn test_run_unknown_cell() {
        let sched = scheduler(SchedulerConfig::eager());
        assert!(matches!(
            sched.run(&[id(9)]),
            Err(Error::CellNotFound(c)) if c == id(9)
        ));
        assert!(matches!(sched.on_delete(id(9)), Err(Error::CellNotFound(_))));
    }

    #[test]
    fn test_run_failure_skips_descendants() {
        let sched = scheduler(SchedulerConfig::eager());
        sched.on_edit(id(1), "-> x").unwrap();
        sched.on_edit(id(2), "x -> y").unwrap();
        let report = sched.on_edit(id(1), "-> x boom").unwrap().report.unwrap();

        assert_eq!(report.executed(), vec![id(1)]);
        assert_eq!(report.error_kind(id(1)), Some(ErrorKind::RunFailure));
        assert_eq!(report.state_of(id(2)), Some(CellState::Stale));
        let skipped = report.get(id(2)).and_then(|r| r.error.clone()).unwrap();
        assert_eq!(skipped.kind, ErrorKind::Unavailable);
        assert_eq!(skipped.origin, Some(id(1)));
    }

    #[test]
    fn test_disabled_cell_holds_back_descendants() {
        let sched = scheduler(SchedulerConfig::eager());
        sched.on_edit(id(1), "-> x").unwrap();
        sched.on_edit(id(2), "x -> y").unwrap();
        sched.set_disabled(id(1), true).unwrap();
        assert_eq!(sched.state_of(id(1)).unwrap(), CellState::Disabled);
        assert_eq!(sched.state_of(id(2)).unwrap(), CellState::Stale);

        let report = sched.run(&[id(2)]).unwrap();
        assert!(report.dispatches.is_empty());
        assert_eq!(report.error_kind(id(2)), Some(ErrorKind::Unavailable));

        let outcome = sched.set_disabled(id(1), false).unwrap();
        assert_eq!(outcome.report.unwrap().executed(), vec![id(1), id(2)]);
        assert_eq!(sched.state_of(id(2)).unwrap(), CellState::Idle);
    }

    #[test]
    fn test_disabled_cell_stays_disabled_after_violation() {
        let sched = scheduler(SchedulerConfig::eager());
        sched.on_edit(id(1), "-> a").unwrap();
        sched.set_disabled(id(1), true).unwrap();

        sched.on_edit(id(2), "-> a").unwrap();
        assert_eq!(sched.state_of(id(1)).unwrap(), CellState::Error);

        let outcome = sched.on_edit(id(2), "-> z").unwrap();
        assert!(outcome.status.is_ok());
        assert_eq!(outcome.report.unwrap().executed(), vec![id(2)]);
        assert_eq!(sched.state_of(id(1)).unwrap(), CellState::Disabled);
    }

    #[test]
    fn test_disable_during_violation_applies_once_resolved() {
        let sched = scheduler(SchedulerConfig::eager());
        sched.on_edit(id(1), "-> a").unwrap();
        sched.on_edit(id(2), "-> a").unwrap();

        sched.set_disabled(id(1), true).unwrap();
        assert_eq!(
            sched.last_error(id(1)).unwrap().map(|e| e.kind),
            Some(ErrorKind::MultipleDefinition)
        );

        sched.on_delete(id(2)).unwrap();
        assert_eq!(sched.state_of(id(1)).unwrap(), CellState::Disabled);

        // Enabling inside the violation cancels the pending disable
        sched.on_edit(id(3), "-> a").unwrap();
        sched.set_disabled(id(1), false).unwrap();
        sched.set_disabled(id(1), true).unwrap();
        sched.set_disabled(id(1), false).unwrap();
        let outcome = sched.on_delete(id(3)).unwrap();
        assert_eq!(outcome.report.unwrap().executed(), vec![id(1)]);
        assert_eq!(sched.state_of(id(1)).unwrap(), CellState::Idle);
    }

    #[test]
    fn test_cancel_of_idle_cell_is_noop() {
        let sched = scheduler(SchedulerConfig::eager());
        sched.on_edit(id(1), "-> x").unwrap();
        assert!(!sched.cancel(id(1)).unwrap());
        assert!(sched.cancel_all().unwrap().is_empty());
        assert!(matches!(sched.cancel(id(2)), Err(Error::CellNotFound(_))));
    }

    #[test]
    fn test_snapshot_carries_states() {
        let sched = scheduler(SchedulerConfig::lazy());
        sched.on_edit(id(1), "-> x").unwrap();
        sched.on_edit(id(2), "x -> y").unwrap();
        let snapshot = sched.graph_snapshot().unwrap();
        assert_eq!(snapshot.cells.len(), 2);
        assert!(
            snapshot
                .cells
                .iter()
                .all(|c| c.state == Some(CellState::Stale))
        );
        assert_eq!(snapshot.edges.len(), 1);
    }
}
