//! Shared helpers for scheduler integration tests.
//!
//! Cells are written as `refs -> defs`. The runner binds every def to one
//! more than the sum of its inputs. A def starting with `boom` makes the run
//! fail, one starting with `slow` makes it wait until the gate opens or
//! the run is aborted, and one starting with `nap` sleeps for [`NAP`].

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tessera_core::{
    CellId, CellState, Error, Name, NameSets, Result, RunFailure, RunOutput, RunRequest, Runner,
    Scheduler, SchedulerConfig,
};

pub const NAP: Duration = Duration::from_millis(80);

pub fn id(n: usize) -> CellId {
    CellId::new(n)
}

pub fn arrow_names(source: &str) -> Result<NameSets> {
    let (refs, defs) = source
        .split_once("->")
        .ok_or_else(|| Error::parse("expected `refs -> defs`"))?;
    NameSets::public(refs.split_whitespace(), defs.split_whitespace())
}

#[derive(Clone, Default)]
pub struct ArrowRunner {
    calls: Arc<Mutex<Vec<CellId>>>,
    gate: Arc<AtomicBool>,
}

impl ArrowRunner {
    /// Cells the runner was called for, in call order.
    pub fn calls(&self) -> Vec<CellId> {
        self.calls.lock().unwrap().clone()
    }

    /// Let every waiting `slow` cell finish.
    pub fn open_gate(&self) {
        self.gate.store(true, Ordering::SeqCst);
    }
}

impl Runner for ArrowRunner {
    fn run(&self, request: &RunRequest) -> std::result::Result<RunOutput, RunFailure> {
        self.calls.lock().unwrap().push(request.cell);
        let (_, defs) = request.source.split_once("->").unwrap_or_default();
        let defs: Vec<&str> = defs.split_whitespace().collect();

        if defs.iter().any(|d| d.starts_with("slow")) {
            while !self.gate.load(Ordering::SeqCst) {
                if request.abort.is_aborted() {
                    return Err(RunFailure::new("aborted"));
                }
                std::thread::sleep(Duration::from_millis(2));
            }
        }
        if defs.iter().any(|d| d.starts_with("nap")) {
            std::thread::sleep(NAP);
        }
        if defs.iter().any(|d| d.starts_with("boom")) {
            return Err(RunFailure::new(format!("{} blew up", request.cell)));
        }

        let total: i64 = 1 + request
            .inputs
            .values()
            .filter_map(|v| v.as_i64())
            .sum::<i64>();
        Ok(defs.iter().fold(RunOutput::new(), |out, def| {
            out.with_binding(Name::new(*def).unwrap(), serde_json::json!(total))
        }))
    }
}

pub fn scheduler(config: SchedulerConfig) -> (Scheduler, ArrowRunner) {
    let runner = ArrowRunner::default();
    let sched = Scheduler::new(config, runner.clone())
        .unwrap()
        .with_extractor(arrow_names);
    (sched, runner)
}

pub fn value(sched: &Scheduler, cell: usize, name: &str) -> Option<i64> {
    sched
        .output(id(cell))
        .unwrap()
        .and_then(|o| o.binding(name).and_then(|v| v.as_i64()))
}

/// Poll until `cell` reaches `state`, failing after a few seconds.
pub fn wait_for(sched: &Scheduler, cell: CellId, state: CellState) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while sched.state_of(cell).unwrap() != state {
        assert!(Instant::now() < deadline, "{cell} never reached {state}");
        std::thread::sleep(Duration::from_millis(1));
    }
}
