//! Cell states, the transitions between them, and error descriptors.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::graph::{CellId, Violation, ViolationKind};

/// Execution state of a single cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellState {
    /// Output reflects the current code and inputs.
    Idle,
    /// Output may not reflect the latest code or inputs.
    Stale,
    /// Selected for the pending run batch.
    Queued,
    /// Handed to the runner, result not in yet.
    Running,
    /// The runner failed, the cell was cancelled, or it breaks a structural rule.
    Error,
    /// Excluded from automatic runs until re-enabled.
    Disabled,
}

impl CellState {
    /// Whether the scheduler may move a cell from `self` to `next`.
    ///
    /// Structural violations bypass this table and force `Error` directly.
    pub fn can_transition_to(self, next: CellState) -> bool {
        use CellState::*;

        match (self, next) {
            (Disabled, Disabled) => false,
            (_, Disabled) => true,
            (Idle, Stale)
            | (Stale, Queued)
            | (Queued, Running)
            | (Running, Idle)
            | (Running, Error)
            | (Error, Stale)
            | (Disabled, Stale) => true,
            // Superseded by a newer edit while in flight
            (Running, Stale) => true,
            // Dropped from a plan before dispatch
            (Queued, Stale) => true,
            // Cancelled before dispatch
            (Queued, Error) => true,
            _ => false,
        }
    }

    /// Queued or running.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }
}

impl fmt::Display for CellState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Stale => "stale",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Error => "error",
            Self::Disabled => "disabled",
        };
        f.write_str(s)
    }
}

/// Why a cell is in error, or why it was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Part of a dependency cycle.
    Cycle,
    /// Defines a name another cell defines too.
    MultipleDefinition,
    /// Source could not be turned into name sets.
    Parse,
    /// The runner reported a failure.
    RunFailure,
    /// Cancelled by request.
    Cancelled,
    /// Cancelled after exceeding the cell timeout.
    Timeout,
    /// Not run because an upstream input is missing. Only appears in run
    /// reports; a cell is never left in `Error` for this.
    Unavailable,
}

impl ErrorKind {
    /// Kinds that keep a cell out of every plan until it is edited.
    pub fn blocks_execution(self) -> bool {
        matches!(self, Self::Cycle | Self::MultipleDefinition | Self::Parse)
    }
}

/// Error descriptor attached to a cell or a report entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
    /// The upstream cell responsible, for propagated unavailability.
    pub origin: Option<CellId>,
}

impl ErrorInfo {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            origin: None,
        }
    }

    pub fn structural(violation: &Violation) -> Self {
        let kind = match violation.kind {
            ViolationKind::Cycle => ErrorKind::Cycle,
            ViolationKind::MultipleDefinition { .. } => ErrorKind::MultipleDefinition,
        };
        Self::new(kind, violation.describe())
    }

    pub fn run_failure(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RunFailure, message)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "execution cancelled")
    }

    pub fn timeout(limit: Duration) -> Self {
        Self::new(
            ErrorKind::Timeout,
            format!("execution exceeded {}ms", limit.as_millis()),
        )
    }

    pub fn unavailable(origin: CellId) -> Self {
        Self {
            kind: ErrorKind::Unavailable,
            message: format!("input from {} is unavailable", origin),
            origin: Some(origin),
        }
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}
