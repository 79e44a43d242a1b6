//! The runner interface: how cell code actually gets executed.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::context::AbortHandle;
use crate::graph::{CellId, Name};

/// Values bound to global names.
pub type Bindings = BTreeMap<Name, serde_json::Value>;

/// Everything a runner gets for one cell execution.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub cell: CellId,
    /// Current source of the cell.
    pub source: String,
    /// Values of the cell's refs, taken from the latest successful run of
    /// each defining cell. Refs nobody defines are absent.
    pub inputs: Bindings,
    /// Index of the batch this dispatch belongs to.
    pub batch: usize,
    /// Raised when the scheduler stops waiting for this run.
    pub abort: AbortHandle,
}

/// What a successful run produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunOutput {
    /// Values of the names the cell defines.
    pub bindings: Bindings,
    /// Value of the cell's final expression, for display.
    pub display: Option<serde_json::Value>,
}

impl RunOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_binding(mut self, name: Name, value: serde_json::Value) -> Self {
        self.bindings.insert(name, value);
        self
    }

    pub fn with_display(mut self, value: serde_json::Value) -> Self {
        self.display = Some(value);
        self
    }

    pub fn binding(&self, name: &str) -> Option<&serde_json::Value> {
        self.bindings.get(name)
    }
}

/// A runner-reported failure of one cell.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct RunFailure {
    pub message: String,
}

impl RunFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Executes a single cell.
///
/// Runs may be slow and may fail. Cells of one batch are handed to the runner
/// from several worker threads at once.
pub trait Runner: Send + Sync {
    fn run(&self, request: &RunRequest) -> Result<RunOutput, RunFailure>;
}

impl<F> Runner for F
where
    F: Fn(&RunRequest) -> Result<RunOutput, RunFailure> + Send + Sync,
{
    fn run(&self, request: &RunRequest) -> Result<RunOutput, RunFailure> {
        self(request)
    }
}

/// Call the runner, turning a panic into a failure.
pub(crate) fn run_guarded(runner: &dyn Runner, request: &RunRequest) -> Result<RunOutput, RunFailure> {
    std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| runner.run(request))).unwrap_or_else(
        |panic| {
            let detail = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!("runner panicked on {}: {}", request.cell, detail);
            Err(RunFailure::new(format!("runner panicked: {}", detail)))
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> RunRequest {
        RunRequest {
            cell: CellId::new(1),
            source: String::new(),
            inputs: Bindings::new(),
            batch: 0,
            abort: AbortHandle::new(),
        }
    }

    #[test]
    fn test_closure_runner() {
        let runner = |req: &RunRequest| {
            Ok(RunOutput::new().with_display(serde_json::json!(req.cell.as_usize())))
        };
        let output = runner.run(&request()).unwrap();
        assert_eq!(output.display, Some(serde_json::json!(1)));
    }

    #[test]
    fn test_guarded_panic_becomes_failure() {
        let runner = |_: &RunRequest| -> Result<RunOutput, RunFailure> { panic!("kaboom") };
        let failure = run_guarded(&runner, &request()).unwrap_err();
        assert!(failure.message.contains("kaboom"));
    }

    #[test]
    fn test_binding_lookup() {
        let output = RunOutput::new().with_binding(Name::new("x").unwrap(), serde_json::json!(4));
        assert_eq!(output.binding("x"), Some(&serde_json::json!(4)));
        assert_eq!(output.binding("y"), None);
    }
}
