//! Text summary builder for CLI output.
//!
//! Tallies the [`RunEvent`]s of one batch and formats human-readable lines for
//! text mode, plus the `--history` listing.

use crate::model::{BatchOutcome, HistoryEntry, HistoryRecord, RunEvent, StepRef};
use std::time::Duration;
use time::macros::format_description;
use time::UtcOffset;

/// Pre-formatted lines for text output.
pub(crate) struct TextSummary {
    pub lines: Vec<String>,
}

#[derive(Debug, Default)]
pub(crate) struct BatchTally {
    runes: Vec<String>,
    history: Option<HistoryRecord>,
    steps_started: usize,
    steps_ok: usize,
    last_step: Option<StepRef>,
    outcome: Option<BatchOutcome>,
    cancelled: bool,
}

impl BatchTally {
    pub fn observe(&mut self, ev: &RunEvent) {
        match ev {
            RunEvent::BatchStarted { runes, history } => {
                *self = Self {
                    runes: runes.clone(),
                    history: Some(history.clone()),
                    ..Self::default()
                };
            }
            RunEvent::StepStarted { step, .. } => {
                self.steps_started += 1;
                self.last_step = Some(*step);
            }
            RunEvent::StepFinished { error: None, .. } => self.steps_ok += 1,
            RunEvent::StepFinished { .. } | RunEvent::OutputChunk(_) => {}
            RunEvent::BatchFinished(outcome) => self.outcome = Some(outcome.clone()),
            RunEvent::BatchCancelled => self.cancelled = true,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.outcome.as_ref().is_some_and(BatchOutcome::is_success)
    }
}

pub(crate) fn build_text_summary(tally: &BatchTally, elapsed: Duration) -> TextSummary {
    let mut lines = Vec::new();

    lines.push(format!("Runes: {}", tally.runes.join(" → ")));
    match &tally.history {
        Some(HistoryRecord::Recorded(id)) => lines.push(format!("History entry: #{id}")),
        Some(HistoryRecord::Failed(reason)) => {
            lines.push(format!("History entry: not recorded ({reason})"))
        }
        None => {}
    }
    lines.push(format!(
        "Commands: {} started, {} succeeded",
        tally.steps_started, tally.steps_ok
    ));

    let status = match (&tally.outcome, tally.cancelled) {
        (_, true) => match tally.last_step {
            Some(s) => format!(
                "Result: cancelled at rune {} command {}",
                s.batch_index + 1,
                s.command_index + 1
            ),
            None => "Result: cancelled".to_string(),
        },
        (Some(BatchOutcome::Success), false) => "Result: success".to_string(),
        (Some(BatchOutcome::Failure(f)), false) => format!(
            "Result: failed in rune {} (`{}`), command {} `{}`: {}",
            f.step.batch_index + 1,
            f.rune,
            f.step.command_index + 1,
            f.command,
            f.error
        ),
        (None, false) => "Result: incomplete".to_string(),
    };
    lines.push(status);
    lines.push(format!("Elapsed: {:.2}s", elapsed.as_secs_f64()));

    TextSummary { lines }
}

/// One line per history entry, newest first as given.
pub(crate) fn history_lines(entries: &[HistoryEntry]) -> Vec<String> {
    if entries.is_empty() {
        return vec!["No history yet.".to_string()];
    }
    entries
        .iter()
        .map(|e| {
            format!(
                "#{:<4} {}  {}  [{}]",
                e.id,
                format_timestamp(e),
                e.label(),
                e.collection_id
            )
        })
        .collect()
}

pub(crate) fn format_timestamp(entry: &HistoryEntry) -> String {
    let offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);
    let fmt = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    entry
        .executed_at
        .to_offset(offset)
        .format(fmt)
        .unwrap_or_else(|_| entry.executed_at.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExecError;
    use crate::model::FailedStep;

    fn started(runes: &[&str]) -> RunEvent {
        RunEvent::BatchStarted {
            runes: runes.iter().map(|s| s.to_string()).collect(),
            history: HistoryRecord::Recorded(4),
        }
    }

    fn step(b: usize, c: usize) -> StepRef {
        StepRef {
            batch_index: b,
            command_index: c,
        }
    }

    #[test]
    fn success_summary() {
        let mut t = BatchTally::default();
        t.observe(&started(&["build", "test"]));
        for s in [step(0, 0), step(1, 0)] {
            t.observe(&RunEvent::StepStarted {
                step: s,
                rune: "x".into(),
                command: "true".into(),
            });
            t.observe(&RunEvent::StepFinished {
                step: s,
                error: None,
            });
        }
        t.observe(&RunEvent::BatchFinished(BatchOutcome::Success));
        assert!(t.succeeded());

        let lines = build_text_summary(&t, Duration::from_millis(1500)).lines;
        assert_eq!(lines[0], "Runes: build → test");
        assert_eq!(lines[1], "History entry: #4");
        assert_eq!(lines[2], "Commands: 2 started, 2 succeeded");
        assert_eq!(lines[3], "Result: success");
        assert_eq!(lines[4], "Elapsed: 1.50s");
    }

    #[test]
    fn failure_names_the_step() {
        let mut t = BatchTally::default();
        t.observe(&started(&["flaky"]));
        t.observe(&RunEvent::BatchFinished(BatchOutcome::Failure(FailedStep {
            step: step(0, 1),
            rune: "flaky".into(),
            command: "false".into(),
            error: ExecError::Exit {
                code: Some(1),
                signal: None,
            },
        })));
        assert!(!t.succeeded());
        let lines = build_text_summary(&t, Duration::ZERO).lines;
        assert_eq!(
            lines[3],
            "Result: failed in rune 1 (`flaky`), command 2 `false`: exited with status 1"
        );
    }

    #[test]
    fn cancellation_is_not_a_failure() {
        let mut t = BatchTally::default();
        t.observe(&started(&["slow"]));
        t.observe(&RunEvent::StepStarted {
            step: step(0, 0),
            rune: "slow".into(),
            command: "sleep 5".into(),
        });
        t.observe(&RunEvent::BatchCancelled);
        let lines = build_text_summary(&t, Duration::ZERO).lines;
        assert_eq!(lines[3], "Result: cancelled at rune 1 command 1");
    }

    #[test]
    fn empty_history_listing() {
        assert_eq!(history_lines(&[]), vec!["No history yet."]);
    }
}
