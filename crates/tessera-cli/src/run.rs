//! Run command implementation.
//!
//! Registers every cell of a notebook with the scheduler and runs them with
//! the dry-run runner.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, bail};
use futures::StreamExt;
use serde_json::json;
use tessera_core::{CellId, RunMode, Scheduler, SchedulerConfig};

use crate::notebook::{self, NotebookCell};
use crate::output::{self, colors};
use crate::runner::DryRunner;

pub struct RunOptions {
    pub cell: Option<usize>,
    pub mode: RunMode,
    pub fail: Vec<usize>,
    pub trace: bool,
    pub json: bool,
}

pub async fn execute(notebook_path: &str, options: RunOptions) -> anyhow::Result<()> {
    let start = Instant::now();
    let cells = notebook::load(notebook_path)?;

    if cells.is_empty() {
        println!(
            "{}No cells found in notebook.{}",
            colors::YELLOW,
            colors::RESET
        );
        println!("Separate cells with a `{}` line", notebook::CELL_MARKER);
        return Ok(());
    }

    let targets: Vec<CellId> = match options.cell {
        Some(n) => {
            let id = CellId::new(n);
            if !cells.iter().any(|c| c.id == id) {
                bail!("no cell {} in {} ({} cells)", n, notebook_path, cells.len());
            }
            vec![id]
        }
        None => cells.iter().map(|c| c.id).collect(),
    };

    let config = SchedulerConfig::default().with_run_mode(options.mode);
    let runner = DryRunner::new(
        &config.private_prefix,
        options.fail.iter().copied().map(CellId::new),
    );
    let scheduler = Arc::new(Scheduler::new(config, runner)?);

    let tracer = if options.trace {
        let mut changes = scheduler.subscribe_state_changes()?;
        Some(tokio::spawn(async move {
            while let Some(change) = changes.next().await {
                eprintln!(
                    "{}[trace]{} {} -> {}",
                    colors::DIM,
                    colors::RESET,
                    change.cell,
                    change.state
                );
            }
        }))
    } else {
        None
    };

    // In autorun mode registering a cell already runs it and its readers
    let worker = Arc::clone(&scheduler);
    let registered = cells.clone();
    let (mut reports, report) = tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
        let mut reports = Vec::new();
        for cell in &registered {
            let outcome = worker
                .on_edit(cell.id, cell.source.clone())
                .with_context(|| format!("failed to register {}", cell.id))?;
            reports.extend(outcome.report);
        }
        let report = worker.run(&targets)?;
        Ok((reports, report))
    })
    .await
    .context("scheduler task panicked")??;
    reports.push(report.clone());
    let dispatched: usize = reports.iter().map(|r| r.dispatches.len()).sum();

    let status = scheduler.status()?;
    let mut outputs = serde_json::Map::new();
    for cell in &cells {
        if let Some(display) = scheduler.output(cell.id)?.and_then(|o| o.display.clone()) {
            outputs.insert(cell.id.to_string(), display);
        }
    }

    // Closing the scheduler ends the trace stream
    drop(scheduler);
    if let Some(tracer) = tracer {
        tracer.await.context("trace task panicked")?;
    }

    if options.json {
        let document = json!({
            "status": status,
            "report": report,
            "runs": reports,
            "outputs": outputs,
        });
        println!("{}", serde_json::to_string_pretty(&document)?);
        return Ok(());
    }

    print_header(notebook_path, &cells, options.mode);
    output::print_status(&status);

    println!("\n{}Cells:{}", colors::BOLD, colors::RESET);
    output::rule();
    output::print_report(&report, &cells);

    if !outputs.is_empty() {
        println!("\n{}Outputs:{}", colors::BOLD, colors::RESET);
        output::rule();
        for (cell, display) in &outputs {
            println!("  {}: {}", cell, display);
        }
    }

    output::rule();
    let (color, verdict) = if report.is_success() {
        (colors::GREEN, "Completed")
    } else {
        (colors::RED, "Finished with errors")
    };
    println!(
        "{}{}{} {} cell runs in {:.2}s",
        color,
        verdict,
        colors::RESET,
        dispatched,
        start.elapsed().as_secs_f64()
    );

    Ok(())
}

fn print_header(path: &str, cells: &[NotebookCell], mode: RunMode) {
    println!(
        "{}Running{} {} ({} cells, {:?})",
        colors::BOLD,
        colors::RESET,
        path,
        cells.len(),
        mode
    );
}
