//! Graph command: print the dependency graph of a notebook as JSON.

use tessera_core::{Scheduler, SchedulerConfig};

use crate::notebook;
use crate::runner::DryRunner;

pub fn execute(notebook_path: &str) -> anyhow::Result<()> {
    let cells = notebook::load(notebook_path)?;

    // Lazy mode so registering cells runs nothing
    let config = SchedulerConfig::lazy();
    let runner = DryRunner::new(&config.private_prefix, []);
    let scheduler = Scheduler::new(config, runner)?;

    for cell in &cells {
        scheduler.on_edit(cell.id, cell.source.clone())?;
    }

    let snapshot = scheduler.graph_snapshot()?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}
