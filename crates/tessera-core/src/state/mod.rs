//! Execution state for tessera notebooks.
//!
//! This module provides:
//! - The per-cell state machine and error descriptors
//! - The execution state store (state, last output, last error)
//! - Live state-change subscriptions

mod cell_state;
mod store;
mod subscription;

pub use cell_state::{CellState, ErrorInfo, ErrorKind};
pub use store::ExecutionStore;
pub use subscription::{StateChange, StateSubscription};
