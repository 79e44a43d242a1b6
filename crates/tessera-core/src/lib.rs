//! Core engine for the tessera reactive notebook.
//!
//! This crate provides:
//! - Dependency graph derived from the names cells define and reference
//! - Cycle and multiple-definition detection
//! - Per-cell execution state with a live change feed
//! - Reactive scheduling of cell runs in parallel batches

pub mod config;
pub mod error;
pub mod execute;
pub mod graph;
mod scheduler;
pub mod state;

pub use config::{RunMode, SchedulerConfig};
pub use error::{Error, Result};
pub use execute::{
    AbortHandle, Bindings, CellReport, Dispatch, RunFailure, RunOutput, RunReport, RunRequest,
    Runner,
};
pub use graph::{
    CellId, GraphEngine, GraphSnapshot, Name, NameExtractor, NameSets, RustCellExtractor,
    StructuralStatus, Violation, ViolationKind,
};
pub use scheduler::{EditOutcome, Scheduler};
pub use state::{CellState, ErrorInfo, ErrorKind, ExecutionStore, StateChange, StateSubscription};
