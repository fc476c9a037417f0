use crate::error::ExecError;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// A named, ordered list of shell commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rune {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub commands: Vec<String>,
}

impl Rune {
    pub fn new(name: impl Into<String>, commands: &[&str]) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            commands: commands.iter().map(|c| c.to_string()).collect(),
        }
    }
}

/// Runes selected for one run, in execution order. Length 1 for a single
/// rune, N for a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionBatch {
    pub runes: Vec<Rune>,
}

impl ExecutionBatch {
    pub fn new(runes: Vec<Rune>) -> Self {
        Self { runes }
    }

    pub fn len(&self) -> usize {
        self.runes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runes.is_empty()
    }

    pub fn rune_names(&self) -> Vec<String> {
        self.runes.iter().map(|r| r.name.clone()).collect()
    }
}

/// Persisted record of one batch execution. Never mutated once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: u64,
    /// Ordered rune names, stored as a single field.
    pub rune_ids: Vec<String>,
    pub collection_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub executed_at: OffsetDateTime,
}

impl HistoryEntry {
    pub fn label(&self) -> String {
        self.rune_ids.join(" → ")
    }
}

/// Position of a command within a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StepRef {
    pub batch_index: usize,
    pub command_index: usize,
}

/// The step that stopped a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedStep {
    pub step: StepRef,
    pub rune: String,
    pub command: String,
    pub error: ExecError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    Success,
    Failure(FailedStep),
}

impl BatchOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, BatchOutcome::Success)
    }
}

/// Result of the history write performed at batch start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryRecord {
    Recorded(u64),
    Failed(String),
}

/// Status messages emitted by the orchestrator to presentation layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    BatchStarted {
        runes: Vec<String>,
        history: HistoryRecord,
    },
    StepStarted {
        step: StepRef,
        rune: String,
        command: String,
    },
    OutputChunk(String),
    StepFinished {
        step: StepRef,
        error: Option<ExecError>,
    },
    BatchFinished(BatchOutcome),
    BatchCancelled,
}
