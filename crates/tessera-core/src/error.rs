//! Error types for tessera-core.
//!
//! Only misuse of the API and broken invariants of the process itself are
//! errors. Structural violations, run failures and cancellations are part of
//! normal notebook life and travel as data in [`crate::StructuralStatus`],
//! [`crate::state::ErrorInfo`] and [`crate::execute::RunReport`].

use thiserror::Error;

use crate::graph::CellId;
use crate::state::CellState;

/// Result type for tessera-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in tessera-core.
#[derive(Debug, Error)]
pub enum Error {
    /// The name-set extractor could not make sense of a cell's source.
    #[error("parse error{}: {message}", line.map(|l| format!(" at line {}", l)).unwrap_or_default())]
    Parse {
        message: String,
        line: Option<usize>,
    },

    /// Cell not registered.
    #[error("cell not found: {0}")]
    CellNotFound(CellId),

    /// A name was empty or otherwise unusable.
    #[error("invalid name: {0:?}")]
    InvalidName(String),

    /// A state transition outside the cell state machine was requested.
    #[error("invalid transition for {cell}: {from} -> {to}")]
    InvalidTransition {
        cell: CellId,
        from: CellState,
        to: CellState,
    },

    /// Execution bookkeeping failed (poisoned lock, worker pool setup).
    #[error("execution error: {0}")]
    Execution(String),
}

impl Error {
    /// Shorthand for a parse error without position information.
    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
            line: None,
        }
    }
}
