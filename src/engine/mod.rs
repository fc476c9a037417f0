//! Process execution: spawning commands, relaying their output to the main
//! loop, and sequencing commands and runes.

mod queue;
mod relay;
mod runner;
mod sequencer;
pub mod terminal;

pub use queue::{QueueCoordinator, QueueStep, RUNE_SEPARATOR};
pub use relay::{OutputRelay, Pull, RunnerEvent};
pub use runner::{ProcessRunner, RunnerConfig};
