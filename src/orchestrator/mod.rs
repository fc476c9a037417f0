//! Application-level orchestration.
//!
//! This module owns the batch lifecycle (run/cancel/acknowledge), the state of
//! the current batch, and replay of recorded batches. UI/CLI layers call into
//! this module and render the [`crate::model::RunEvent`]s it returns.

mod controller;
mod replay;
mod state;

pub use controller::{Intent, Orchestrator};
pub use state::Phase;
