//! Outcome of one run request.

use serde::{Deserialize, Serialize};

use crate::graph::CellId;
use crate::state::{CellState, ErrorInfo, ErrorKind};

/// One cell handed to the runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dispatch {
    pub cell: CellId,
    pub batch: usize,
}

/// Where one cell ended up after a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellReport {
    pub cell: CellId,
    pub state: CellState,
    pub error: Option<ErrorInfo>,
}

/// Per-cell outcome of a run, in plan order, plus the dispatch sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub cells: Vec<CellReport>,
    pub dispatches: Vec<Dispatch>,
}

impl RunReport {
    pub fn get(&self, cell: CellId) -> Option<&CellReport> {
        self.cells.iter().find(|r| r.cell == cell)
    }

    pub fn state_of(&self, cell: CellId) -> Option<CellState> {
        self.get(cell).map(|r| r.state)
    }

    pub fn error_kind(&self, cell: CellId) -> Option<ErrorKind> {
        self.get(cell).and_then(|r| r.error.as_ref()).map(|e| e.kind)
    }

    /// Cells handed to the runner, in dispatch order.
    pub fn executed(&self) -> Vec<CellId> {
        self.dispatches.iter().map(|d| d.cell).collect()
    }

    /// Dispatched cells grouped by batch.
    pub fn batches(&self) -> Vec<Vec<CellId>> {
        let mut batches: Vec<Vec<CellId>> = Vec::new();
        for dispatch in &self.dispatches {
            if batches.len() <= dispatch.batch {
                batches.resize_with(dispatch.batch + 1, Vec::new);
            }
            batches[dispatch.batch].push(dispatch.cell);
        }
        batches.retain(|b| !b.is_empty());
        batches
    }

    /// Fold in the report of a follow-up run. Later entries replace earlier
    /// ones for the same cell and later batches are numbered after ours.
    pub(crate) fn absorb(&mut self, later: RunReport) {
        let offset = self.dispatches.last().map_or(0, |d| d.batch + 1);
        self.dispatches
            .extend(later.dispatches.into_iter().map(|d| Dispatch {
                cell: d.cell,
                batch: d.batch + offset,
            }));
        for entry in later.cells {
            match self.cells.iter_mut().find(|e| e.cell == entry.cell) {
                Some(existing) => *existing = entry,
                None => self.cells.push(entry),
            }
        }
    }

    /// Every reported cell ended idle.
    pub fn is_success(&self) -> bool {
        self.cells.iter().all(|r| r.state == CellState::Idle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batches_group_dispatches() {
        let report = RunReport {
            cells: Vec::new(),
            dispatches: vec![
                Dispatch { cell: CellId::new(1), batch: 0 },
                Dispatch { cell: CellId::new(3), batch: 1 },
                Dispatch { cell: CellId::new(2), batch: 1 },
            ],
        };
        assert_eq!(
            report.batches(),
            vec![vec![CellId::new(1)], vec![CellId::new(3), CellId::new(2)]]
        );
        assert_eq!(report.executed().len(), 3);
    }

    #[test]
    fn test_absorb_renumbers_batches() {
        let mut first = RunReport {
            cells: vec![CellReport {
                cell: CellId::new(1),
                state: CellState::Stale,
                error: None,
            }],
            dispatches: vec![Dispatch { cell: CellId::new(1), batch: 0 }],
        };
        first.absorb(RunReport {
            cells: vec![CellReport {
                cell: CellId::new(1),
                state: CellState::Idle,
                error: None,
            }],
            dispatches: vec![Dispatch { cell: CellId::new(1), batch: 0 }],
        });
        assert_eq!(first.cells.len(), 1);
        assert_eq!(first.state_of(CellId::new(1)), Some(CellState::Idle));
        assert_eq!(first.dispatches[1].batch, 1);
    }

    #[test]
    fn test_lookup() {
        let report = RunReport {
            cells: vec![CellReport {
                cell: CellId::new(5),
                state: CellState::Stale,
                error: Some(ErrorInfo::unavailable(CellId::new(2))),
            }],
            dispatches: Vec::new(),
        };
        assert_eq!(report.state_of(CellId::new(5)), Some(CellState::Stale));
        assert_eq!(report.error_kind(CellId::new(5)), Some(ErrorKind::Unavailable));
        assert!(!report.is_success());
    }
}
