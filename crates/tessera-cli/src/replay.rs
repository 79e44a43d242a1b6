//! Replay command: drive the scheduler through a scripted editing session.
//!
//! A script is a JSON document:
//!
//! ```json
//! {
//!   "config": { "run_mode": "lazy" },
//!   "fail": [3],
//!   "steps": [
//!     { "op": "edit", "cell": 1, "source": "fn base() -> i32 { 1 }" },
//!     { "op": "run", "cells": [1] },
//!     { "op": "delete", "cell": 1 }
//!   ]
//! }
//! ```
//!
//! Steps run one after another on a single thread, so replaying the same
//! script always prints the same results.

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tessera_core::{CellId, EditOutcome, RunReport, Scheduler, SchedulerConfig, StateChange};

use crate::output::{self, colors};
use crate::runner::DryRunner;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Script {
    #[serde(default)]
    pub config: SchedulerConfig,
    /// Cells the dry-run runner fails for.
    #[serde(default)]
    pub fail: Vec<CellId>,
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    Edit { cell: CellId, source: String },
    Delete { cell: CellId },
    Run { cells: Vec<CellId> },
    RunStale,
    Disable { cell: CellId },
    Enable { cell: CellId },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepResult {
    Edited(EditOutcome),
    Ran(RunReport),
    Failed(String),
}

#[derive(Debug, Serialize)]
struct StepRecord {
    step: usize,
    #[serde(flatten)]
    op: Step,
    result: StepResult,
}

pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Script> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("script not found: {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("invalid script: {}", path.display()))
}

/// Apply every step, collecting what each one did. A step the scheduler
/// rejects is recorded and the replay continues.
pub fn replay(script: &Script) -> anyhow::Result<(Vec<StepResult>, Vec<StateChange>)> {
    let runner = DryRunner::new(&script.config.private_prefix, script.fail.iter().copied());
    let scheduler = Scheduler::new(script.config.clone(), runner)?;

    let results = script
        .steps
        .iter()
        .map(|step| apply(&scheduler, step))
        .collect();

    let mut states = scheduler.subscribe_state_changes()?;
    Ok((results, states.drain()))
}

fn apply(scheduler: &Scheduler, step: &Step) -> StepResult {
    let result = match step {
        Step::Edit { cell, source } => scheduler
            .on_edit(*cell, source.clone())
            .map(StepResult::Edited),
        Step::Delete { cell } => scheduler.on_delete(*cell).map(StepResult::Edited),
        Step::Run { cells } => scheduler.run(cells).map(StepResult::Ran),
        Step::RunStale => scheduler.run_stale().map(StepResult::Ran),
        Step::Disable { cell } => scheduler.set_disabled(*cell, true).map(StepResult::Edited),
        Step::Enable { cell } => scheduler.set_disabled(*cell, false).map(StepResult::Edited),
    };
    result.unwrap_or_else(|e| StepResult::Failed(e.to_string()))
}

pub fn execute(script_path: &str, json: bool) -> anyhow::Result<()> {
    let script = load(script_path)?;
    let (results, states) = replay(&script)?;

    if json {
        let steps: Vec<StepRecord> = script
            .steps
            .iter()
            .cloned()
            .zip(results)
            .enumerate()
            .map(|(n, (op, result))| StepRecord {
                step: n + 1,
                op,
                result,
            })
            .collect();
        let document = serde_json::json!({ "steps": steps, "states": states });
        println!("{}", serde_json::to_string_pretty(&document)?);
        return Ok(());
    }

    for (n, (step, result)) in script.steps.iter().zip(&results).enumerate() {
        println!("{}step {}{} {}", colors::BOLD, n + 1, colors::RESET, describe(step));
        match result {
            StepResult::Edited(outcome) => output::print_outcome(outcome),
            StepResult::Ran(report) => output::print_report(report, &[]),
            StepResult::Failed(message) => {
                println!("  {}rejected:{} {}", colors::RED, colors::RESET, message)
            }
        }
    }

    println!("\n{}Final states:{}", colors::BOLD, colors::RESET);
    output::rule();
    for change in &states {
        println!("  {} {}", change.cell, change.state);
    }
    Ok(())
}

fn describe(step: &Step) -> String {
    match step {
        Step::Edit { cell, .. } => format!("edit {}", cell),
        Step::Delete { cell } => format!("delete {}", cell),
        Step::Run { cells } => {
            let ids: Vec<String> = cells.iter().map(ToString::to_string).collect();
            format!("run {}", ids.join(", "))
        }
        Step::RunStale => "run stale".to_string(),
        Step::Disable { cell } => format!("disable {}", cell),
        Step::Enable { cell } => format!("enable {}", cell),
    }
}
