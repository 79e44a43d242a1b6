//! Terminal output for run reports and structural status.

use tessera_core::{CellState, EditOutcome, RunReport, StructuralStatus};

use crate::notebook::NotebookCell;

pub mod colors {
    pub const RESET: &str = "\x1b[0m";
    pub const BOLD: &str = "\x1b[1m";
    pub const DIM: &str = "\x1b[2m";
    pub const RED: &str = "\x1b[31m";
    pub const GREEN: &str = "\x1b[32m";
    pub const YELLOW: &str = "\x1b[33m";
}

const RULE_WIDTH: usize = 50;

pub fn rule() {
    println!("{}", "─".repeat(RULE_WIDTH));
}

fn state_color(state: CellState) -> &'static str {
    match state {
        CellState::Idle => colors::GREEN,
        CellState::Error => colors::RED,
        CellState::Disabled => colors::DIM,
        _ => colors::YELLOW,
    }
}

pub fn print_status(status: &StructuralStatus) {
    for violation in status.violations() {
        println!(
            "{}warning:{} {}",
            colors::YELLOW,
            colors::RESET,
            violation.describe()
        );
    }
}

/// One line per reported cell, then the batches that were dispatched.
pub fn print_report(report: &RunReport, cells: &[NotebookCell]) {
    for entry in &report.cells {
        let line = cells
            .iter()
            .find(|c| c.id == entry.cell)
            .map(|c| format!(" (line {})", c.line))
            .unwrap_or_default();
        let detail = entry
            .error
            .as_ref()
            .map(|e| format!(" - {}", e))
            .unwrap_or_default();
        println!(
            "  {}{}{} {}{}{}{}",
            colors::BOLD,
            entry.cell,
            colors::RESET,
            state_color(entry.state),
            entry.state,
            colors::RESET,
            format_args!("{line}{detail}"),
        );
    }
    for (n, batch) in report.batches().iter().enumerate() {
        let ids: Vec<String> = batch.iter().map(ToString::to_string).collect();
        println!("  {}batch {}:{} {}", colors::DIM, n, colors::RESET, ids.join(", "));
    }
}

pub fn print_outcome(outcome: &EditOutcome) {
    print_status(&outcome.status);
    if !outcome.invalidated.is_empty() {
        let ids: Vec<String> = outcome.invalidated.iter().map(ToString::to_string).collect();
        println!("  invalidated: {}", ids.join(", "));
    }
    if let Some(report) = &outcome.report {
        print_report(report, &[]);
    }
}
