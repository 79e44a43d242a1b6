//! Cell execution: the runner seam, run planning and run reports.

mod context;
mod plan;
mod report;
mod runner;

pub use context::AbortHandle;
pub(crate) use context::{Completion, InFlight};
pub(crate) use plan::RunPlan;
pub use report::{CellReport, Dispatch, RunReport};
pub(crate) use runner::run_guarded;
pub use runner::{Bindings, RunFailure, RunOutput, RunRequest, Runner};
