//! Executes the commands of one rune in order, stopping at the first failure.

use crate::error::{ExecError, SequenceError};
use crate::model::Rune;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SequencerStep {
    /// Start the command at this index next.
    Run { command_index: usize },
    Succeeded { output: String },
    Failed {
        command_index: usize,
        error: ExecError,
    },
}

#[derive(Debug)]
pub struct Sequencer {
    rune: Rune,
    running: Option<usize>,
    output: String,
}

impl Sequencer {
    pub fn new(rune: Rune) -> Self {
        Self {
            rune,
            running: None,
            output: String::new(),
        }
    }

    pub fn rune(&self) -> &Rune {
        &self.rune
    }

    pub fn command(&self, index: usize) -> Option<&str> {
        self.rune.commands.get(index).map(String::as_str)
    }

    /// First step. A rune without commands succeeds immediately.
    pub fn start(&mut self) -> SequencerStep {
        self.advance_to(0)
    }

    pub fn record_output(&mut self, text: &str) {
        self.output.push_str(text);
    }

    /// Report the running command's outcome and get the next step.
    pub fn command_finished(
        &mut self,
        result: Result<(), ExecError>,
    ) -> Result<SequencerStep, SequenceError> {
        let index = self.running.take().ok_or(SequenceError::NoCommandRunning)?;
        Ok(match result {
            Ok(()) => self.advance_to(index + 1),
            Err(error) => SequencerStep::Failed {
                command_index: index,
                error,
            },
        })
    }

    fn advance_to(&mut self, index: usize) -> SequencerStep {
        if index < self.rune.commands.len() {
            self.running = Some(index);
            SequencerStep::Run {
                command_index: index,
            }
        } else {
            SequencerStep::Succeeded {
                output: self.output.clone(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure() -> ExecError {
        ExecError::Exit {
            code: Some(1),
            signal: None,
        }
    }

    #[test]
    fn empty_rune_succeeds_immediately() {
        let mut s = Sequencer::new(Rune::new("noop", &[]));
        assert_eq!(
            s.start(),
            SequencerStep::Succeeded {
                output: String::new()
            }
        );
        assert_eq!(
            s.command_finished(Ok(())),
            Err(SequenceError::NoCommandRunning)
        );
    }

    #[test]
    fn runs_every_command_then_reports_output() {
        let mut s = Sequencer::new(Rune::new("build", &["echo a", "echo b"]));
        assert_eq!(s.start(), SequencerStep::Run { command_index: 0 });
        s.record_output("a\n");
        assert_eq!(
            s.command_finished(Ok(())),
            Ok(SequencerStep::Run { command_index: 1 })
        );
        s.record_output("b\n");
        assert_eq!(
            s.command_finished(Ok(())),
            Ok(SequencerStep::Succeeded {
                output: "a\nb\n".into()
            })
        );
    }

    #[test]
    fn failure_stops_the_rune() {
        let mut s = Sequencer::new(Rune::new("x", &["echo a", "false", "echo c"]));
        let mut started = vec![];
        let mut step = s.start();
        loop {
            match step {
                SequencerStep::Run { command_index } => {
                    started.push(command_index);
                    let result = if command_index == 1 {
                        Err(failure())
                    } else {
                        Ok(())
                    };
                    step = s.command_finished(result).unwrap();
                }
                other => {
                    step = other;
                    break;
                }
            }
        }
        assert_eq!(started, vec![0, 1]);
        assert_eq!(
            step,
            SequencerStep::Failed {
                command_index: 1,
                error: failure()
            }
        );
        assert_eq!(
            s.command_finished(Ok(())),
            Err(SequenceError::NoCommandRunning)
        );
    }

    #[test]
    fn finishing_twice_is_rejected() {
        let mut s = Sequencer::new(Rune::new("x", &["true"]));
        s.start();
        s.command_finished(Ok(())).unwrap();
        assert_eq!(
            s.command_finished(Ok(())),
            Err(SequenceError::NoCommandRunning)
        );
    }
}
