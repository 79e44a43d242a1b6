//! A runner that executes nothing.
//!
//! Every def is bound to a small JSON record naming the cell and the inputs
//! it received, which is enough to follow how values would flow.

use std::collections::BTreeSet;

use serde_json::json;
use tessera_core::{
    CellId, Name, NameExtractor, RunFailure, RunOutput, RunRequest, Runner, RustCellExtractor,
};

pub struct DryRunner {
    extractor: RustCellExtractor,
    failing: BTreeSet<CellId>,
}

impl DryRunner {
    pub fn new(private_prefix: &str, failing: impl IntoIterator<Item = CellId>) -> Self {
        Self {
            extractor: RustCellExtractor::with_private_prefix(private_prefix),
            failing: failing.into_iter().collect(),
        }
    }
}

impl Runner for DryRunner {
    fn run(&self, request: &RunRequest) -> Result<RunOutput, RunFailure> {
        if self.failing.contains(&request.cell) {
            return Err(RunFailure::new("failure requested with --fail"));
        }
        let names = self
            .extractor
            .extract(&request.source)
            .map_err(|e| RunFailure::new(e.to_string()))?;

        let inputs: Vec<&str> = request.inputs.keys().map(Name::as_str).collect();
        let record = json!({ "cell": request.cell, "inputs": inputs });
        Ok(names.defs.into_iter().fold(
            RunOutput::new().with_display(record.clone()),
            |output, def| output.with_binding(def, record.clone()),
        ))
    }
}
