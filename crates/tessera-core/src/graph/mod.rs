//! Graph engine for dependency resolution.
//!
//! This module provides:
//! - Name-set extraction from cell source
//! - Dependency graph construction from definitions and references
//! - Topological batching for execution
//! - Cycle and multiple-definition detection

mod engine;
mod extract;
mod types;

pub use engine::GraphEngine;
pub use extract::{NameExtractor, RustCellExtractor};
pub use types::{
    CellId, CellSnapshot, EdgeSnapshot, GraphSnapshot, Name, NameSets, StructuralStatus,
    Violation, ViolationKind,
};
