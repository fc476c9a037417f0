//! Runs the runes of a batch in order on top of [`Sequencer`].

use super::sequencer::{Sequencer, SequencerStep};
use crate::error::{ExecError, SequenceError};
use crate::model::{ExecutionBatch, FailedStep, StepRef};

/// Separator written into the aggregated output between two runes.
pub const RUNE_SEPARATOR: &str = "\n────────────────────────────────\n\n";

/// The next command to start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRequest {
    pub step: StepRef,
    pub rune: String,
    pub command: String,
    /// Separators to write before this step's output: one per rune boundary
    /// crossed since the previous step.
    pub separators: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueStep {
    Run(StepRequest),
    Succeeded { separators: usize },
    Failed(FailedStep),
}

/// Output of one completed rune.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuneReport {
    pub rune: String,
    pub output: String,
}

#[derive(Debug)]
pub struct QueueCoordinator {
    batch: ExecutionBatch,
    batch_index: usize,
    sequencer: Option<Sequencer>,
    completed: Vec<RuneReport>,
}

impl QueueCoordinator {
    pub fn new(batch: ExecutionBatch) -> Self {
        Self {
            batch,
            batch_index: 0,
            sequencer: None,
            completed: Vec::new(),
        }
    }

    pub fn batch(&self) -> &ExecutionBatch {
        &self.batch
    }

    pub fn completed(&self) -> &[RuneReport] {
        &self.completed
    }

    pub fn start(&mut self) -> QueueStep {
        self.enter_rune(0)
    }

    pub fn record_output(&mut self, text: &str) {
        if let Some(seq) = self.sequencer.as_mut() {
            seq.record_output(text);
        }
    }

    pub fn command_finished(
        &mut self,
        result: Result<(), ExecError>,
    ) -> Result<QueueStep, SequenceError> {
        let seq = self.sequencer.as_mut().ok_or(SequenceError::BatchComplete)?;
        let step = seq.command_finished(result)?;
        Ok(self.follow(step, 0))
    }

    /// Start the rune at `batch_index`, skipping through runes without commands.
    fn enter_rune(&mut self, separators: usize) -> QueueStep {
        match self.batch.runes.get(self.batch_index) {
            Some(rune) => {
                let mut seq = Sequencer::new(rune.clone());
                let step = seq.start();
                self.sequencer = Some(seq);
                self.follow(step, separators)
            }
            None => {
                self.sequencer = None;
                QueueStep::Succeeded { separators }
            }
        }
    }

    fn follow(&mut self, step: SequencerStep, separators: usize) -> QueueStep {
        let Some(seq) = self.sequencer.as_ref() else {
            return QueueStep::Succeeded { separators };
        };
        let rune = seq.rune().name.clone();
        match step {
            SequencerStep::Run { command_index } => QueueStep::Run(StepRequest {
                step: StepRef {
                    batch_index: self.batch_index,
                    command_index,
                },
                command: seq.command(command_index).unwrap_or_default().to_string(),
                rune,
                separators,
            }),
            SequencerStep::Failed {
                command_index,
                error,
            } => {
                let command = seq.command(command_index).unwrap_or_default().to_string();
                self.sequencer = None;
                QueueStep::Failed(FailedStep {
                    step: StepRef {
                        batch_index: self.batch_index,
                        command_index,
                    },
                    rune,
                    command,
                    error,
                })
            }
            SequencerStep::Succeeded { output } => {
                self.completed.push(RuneReport { rune, output });
                if self.batch_index + 1 < self.batch.len() {
                    self.batch_index += 1;
                    self.enter_rune(separators + 1)
                } else {
                    self.sequencer = None;
                    QueueStep::Succeeded { separators }
                }
            }
        }
    }
}
