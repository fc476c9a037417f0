//! Batch lifecycle controller.
//!
//! Accepts run/cancel/acknowledge intents from a presentation layer, drives the
//! queue coordinator and process runner, and emits [`RunEvent`]s back. The
//! controller is owned by the single main loop; background work only reaches it
//! through the active command's [`OutputRelay`].

use super::replay::{batch_for_entry, resolve_batch};
use super::state::{Phase, RunState};
use crate::engine::{
    OutputRelay, ProcessRunner, Pull, QueueCoordinator, QueueStep, RunnerEvent, RUNE_SEPARATOR,
};
use crate::error::{ExecError, HistoryError, OrchestratorError};
use crate::model::{
    BatchOutcome, ExecutionBatch, FailedStep, HistoryEntry, HistoryRecord, RunEvent,
};
use crate::spellbook::Spellbook;
use crate::storage::HistoryStore;
use tracing::{debug, info, warn};

/// Upper bound on relay events handled by one [`Orchestrator::poll`], so a
/// chatty command cannot starve the render loop.
const MAX_EVENTS_PER_POLL: usize = 256;

/// Commands accepted from UI layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    RunRune(String),
    RunQueue(Vec<String>),
    Cancel,
    Acknowledge,
}

pub struct Orchestrator {
    runner: ProcessRunner,
    history: Box<dyn HistoryStore>,
    spellbook: Spellbook,
    collection_id: String,
    state: RunState,
    queue: Option<QueueCoordinator>,
    relay: Option<OutputRelay>,
}

impl Orchestrator {
    pub fn new(
        mut runner: ProcessRunner,
        history: Box<dyn HistoryStore>,
        spellbook: Spellbook,
        collection_id: impl Into<String>,
    ) -> Self {
        runner.set_env(spellbook.env());
        Self {
            runner,
            history,
            spellbook,
            collection_id: collection_id.into(),
            state: RunState::default(),
            queue: None,
            relay: None,
        }
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn phase(&self) -> &Phase {
        self.state.phase()
    }

    pub fn is_active(&self) -> bool {
        self.state.phase().is_active()
    }

    /// Aggregated output of the current or last batch, verbatim.
    pub fn output(&self) -> &str {
        self.state.output()
    }

    pub fn spellbook(&self) -> &Spellbook {
        &self.spellbook
    }

    pub fn collection_id(&self) -> &str {
        &self.collection_id
    }

    /// Swap in a reloaded spellbook. Its loegs apply from the next command on.
    pub fn set_spellbook(&mut self, spellbook: Spellbook) -> Result<(), OrchestratorError> {
        if self.is_active() {
            return Err(OrchestratorError::Busy);
        }
        self.runner.set_env(spellbook.env());
        self.spellbook = spellbook;
        Ok(())
    }

    pub fn recent_history(&self, limit: usize) -> Result<Vec<HistoryEntry>, HistoryError> {
        self.history.load_recent(limit)
    }

    pub fn handle(&mut self, intent: Intent) -> Result<Vec<RunEvent>, OrchestratorError> {
        debug!(?intent, phase = ?self.state.phase(), "intent");
        match intent {
            Intent::RunRune(name) => self.run(&[name]),
            Intent::RunQueue(names) => self.run(&names),
            Intent::Cancel => {
                if self.state.request_cancel() {
                    info!("cancel requested");
                }
                Ok(Vec::new())
            }
            Intent::Acknowledge => {
                if self.is_active() {
                    return Err(OrchestratorError::StillRunning);
                }
                self.state.acknowledge();
                Ok(Vec::new())
            }
        }
    }

    /// Run the batch a history entry recorded.
    pub fn replay(&mut self, entry: &HistoryEntry) -> Result<Vec<RunEvent>, OrchestratorError> {
        self.check_idle()?;
        let batch = batch_for_entry(&self.spellbook, entry, &self.collection_id)?;
        Ok(self.start(batch))
    }

    fn run(&mut self, names: &[String]) -> Result<Vec<RunEvent>, OrchestratorError> {
        self.check_idle()?;
        let batch = resolve_batch(&self.spellbook, names)?;
        Ok(self.start(batch))
    }

    fn check_idle(&self) -> Result<(), OrchestratorError> {
        match self.state.phase() {
            Phase::Idle => Ok(()),
            Phase::Running | Phase::Cancelling => Err(OrchestratorError::Busy),
            Phase::Finished(_) | Phase::Cancelled => Err(OrchestratorError::AwaitingAcknowledge),
        }
    }

    fn start(&mut self, batch: ExecutionBatch) -> Vec<RunEvent> {
        let runes = batch.rune_names();
        // Recorded before the first command so failed batches still show up.
        let record = match self.history.record(&runes, &self.collection_id) {
            Ok(id) => HistoryRecord::Recorded(id),
            Err(e) => {
                warn!(error = %e, "history write failed; running anyway");
                HistoryRecord::Failed(e.to_string())
            }
        };
        info!(runes = ?runes, history = ?record, "batch started");
        self.state.begin();

        let mut events = vec![RunEvent::BatchStarted {
            runes,
            history: record,
        }];
        let mut queue = QueueCoordinator::new(batch);
        let step = queue.start();
        self.queue = Some(queue);
        self.advance(step, &mut events);
        events
    }

    /// Drain whatever the active command has produced without blocking.
    pub fn poll(&mut self) -> Vec<RunEvent> {
        let mut events = Vec::new();
        for _ in 0..MAX_EVENTS_PER_POLL {
            let Some(relay) = self.relay.as_mut() else {
                break;
            };
            match relay.try_pull() {
                Pull::Event(ev) => self.on_runner_event(ev, &mut events),
                Pull::Pending => break,
                Pull::Closed => {
                    self.relay = None;
                    break;
                }
            }
        }
        events
    }

    /// Wait for the next relay event and return what it produced. Empty when no
    /// command is running.
    pub async fn next_events(&mut self) -> Vec<RunEvent> {
        let mut events = Vec::new();
        let ev = match self.relay.as_mut() {
            Some(relay) => relay.pull().await,
            None => return events,
        };
        match ev {
            Some(ev) => self.on_runner_event(ev, &mut events),
            None => self.relay = None,
        }
        events
    }

    /// Drive the active batch to its end, collecting every event.
    pub async fn run_to_completion(&mut self) -> Vec<RunEvent> {
        let mut events = Vec::new();
        while self.is_active() {
            let next = self.next_events().await;
            if next.is_empty() && self.relay.is_none() && self.is_active() {
                // Should not happen: active with nothing in flight.
                warn!("active batch has no running command");
                self.settle(
                    Phase::Cancelled,
                    RunEvent::BatchCancelled,
                    &mut events,
                );
                break;
            }
            events.extend(next);
        }
        events
    }

    fn on_runner_event(&mut self, ev: RunnerEvent, events: &mut Vec<RunEvent>) {
        match ev {
            RunnerEvent::Output(text) => {
                if self.state.phase() == &Phase::Cancelling {
                    return;
                }
                if let Some(queue) = self.queue.as_mut() {
                    queue.record_output(&text);
                }
                self.state.output.push_str(&text);
                events.push(RunEvent::OutputChunk(text));
            }
            RunnerEvent::Finished(result) => {
                self.relay = None;
                events.push(RunEvent::StepFinished {
                    step: self.state.step(),
                    error: result.as_ref().err().cloned(),
                });
                if self.state.phase() == &Phase::Cancelling {
                    info!(step = ?self.state.step(), "batch cancelled");
                    self.settle(Phase::Cancelled, RunEvent::BatchCancelled, events);
                    return;
                }
                let Some(queue) = self.queue.as_mut() else {
                    warn!("command finished with no batch in progress");
                    return;
                };
                match queue.command_finished(result) {
                    Ok(step) => self.advance(step, events),
                    Err(e) => {
                        warn!(error = %e, "queue rejected command result");
                        let failed = self.failed_here(ExecError::Lost);
                        self.finish(BatchOutcome::Failure(failed), events);
                    }
                }
            }
        }
    }

    fn advance(&mut self, step: QueueStep, events: &mut Vec<RunEvent>) {
        match step {
            QueueStep::Run(req) => {
                self.push_separators(req.separators, events);
                self.state.batch_index = req.step.batch_index;
                self.state.command_index = req.step.command_index;
                events.push(RunEvent::StepStarted {
                    step: req.step,
                    rune: req.rune.clone(),
                    command: req.command.clone(),
                });
                let Some(cancel) = self.state.cancel_token() else {
                    warn!("no cancellation handle for running batch");
                    let failed = self.failed_here(ExecError::Lost);
                    self.finish(BatchOutcome::Failure(failed), events);
                    return;
                };
                debug!(rune = %req.rune, command = %req.command, step = ?req.step, "starting command");
                self.relay = Some(self.runner.spawn(&req.command, cancel));
            }
            QueueStep::Succeeded { separators } => {
                self.push_separators(separators, events);
                if let Some(queue) = &self.queue {
                    for report in queue.completed() {
                        debug!(rune = %report.rune, bytes = report.output.len(), "rune completed");
                    }
                }
                self.finish(BatchOutcome::Success, events);
            }
            QueueStep::Failed(failed) => {
                self.finish(BatchOutcome::Failure(failed), events);
            }
        }
    }

    fn push_separators(&mut self, count: usize, events: &mut Vec<RunEvent>) {
        for _ in 0..count {
            self.state.output.push_str(RUNE_SEPARATOR);
            events.push(RunEvent::OutputChunk(RUNE_SEPARATOR.to_string()));
        }
    }

    fn failed_here(&self, error: ExecError) -> FailedStep {
        let step = self.state.step();
        let (rune, command) = self
            .queue
            .as_ref()
            .and_then(|q| q.batch().runes.get(step.batch_index))
            .map(|r| {
                let command = r.commands.get(step.command_index).cloned();
                (r.name.clone(), command.unwrap_or_default())
            })
            .unwrap_or_default();
        FailedStep {
            step,
            rune,
            command,
            error,
        }
    }

    fn finish(&mut self, outcome: BatchOutcome, events: &mut Vec<RunEvent>) {
        match &outcome {
            BatchOutcome::Success => info!("batch succeeded"),
            BatchOutcome::Failure(f) => {
                info!(rune = %f.rune, step = ?f.step, error = %f.error, "batch failed")
            }
        }
        self.settle(
            Phase::Finished(outcome.clone()),
            RunEvent::BatchFinished(outcome),
            events,
        );
    }

    fn settle(&mut self, phase: Phase, event: RunEvent, events: &mut Vec<RunEvent>) {
        self.queue = None;
        self.relay = None;
        self.state.settle(phase);
        events.push(event);
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        // Kill whatever is still running when the UI goes away.
        self.state.request_cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::RunnerConfig;
    use crate::model::{Rune, StepRef};
    use crate::storage::MemoryHistoryStore;
    use std::time::Duration;
    use tokio::runtime::Handle;

    fn book() -> Spellbook {
        Spellbook {
            runes: vec![
                Rune::new("build", &["echo a", "echo b"]),
                Rune::new("flaky", &["echo a", "false", "echo c"]),
                Rune::new("one", &["echo a"]),
                Rune::new("boom", &["false"]),
                Rune::new("three", &["echo c"]),
                Rune::new("slow", &["echo early; sleep 5; echo late"]),
                Rune::new("greet", &["echo $GREETING"]),
                Rune::new("empty", &[]),
            ],
            loegs: [("GREETING".to_string(), "hi".to_string())].into(),
        }
    }

    fn orchestrator() -> Orchestrator {
        orchestrator_with(Box::new(MemoryHistoryStore::new()))
    }

    fn orchestrator_with(history: Box<dyn HistoryStore>) -> Orchestrator {
        let runner = ProcessRunner::new(RunnerConfig::default(), Handle::current());
        Orchestrator::new(runner, history, book(), "/proj")
    }

    async fn run(o: &mut Orchestrator, intent: Intent) -> Vec<RunEvent> {
        let mut events = o.handle(intent).unwrap();
        let rest = tokio::time::timeout(Duration::from_secs(10), o.run_to_completion())
            .await
            .expect("batch should settle");
        events.extend(rest);
        events
    }

    fn steps(events: &[RunEvent]) -> Vec<StepRef> {
        events
            .iter()
            .filter_map(|e| match e {
                RunEvent::StepStarted { step, .. } => Some(*step),
                _ => None,
            })
            .collect()
    }

    fn separators(output: &str) -> usize {
        output.matches(RUNE_SEPARATOR).count()
    }

    #[tokio::test]
    async fn single_rune_runs_every_command() {
        let mut o = orchestrator();
        let events = run(&mut o, Intent::RunRune("build".into())).await;

        assert_eq!(o.output(), "a\nb\n");
        assert_eq!(steps(&events).len(), 2);
        let finished: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                RunEvent::StepFinished { error, .. } => Some(error.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(finished, vec![None, None]);
        assert_eq!(
            events.last(),
            Some(&RunEvent::BatchFinished(BatchOutcome::Success))
        );
        assert!(matches!(
            events.first(),
            Some(RunEvent::BatchStarted {
                history: HistoryRecord::Recorded(1),
                ..
            })
        ));
        assert!(!o.state().has_cancel_handle());
    }

    #[tokio::test]
    async fn failing_command_stops_the_rune() {
        let mut o = orchestrator();
        let events = run(&mut o, Intent::RunRune("flaky".into())).await;

        assert!(o.output().contains("a\n"));
        assert!(!o.output().contains("c\n"));
        assert_eq!(steps(&events).len(), 2);
        match events.last() {
            Some(RunEvent::BatchFinished(BatchOutcome::Failure(f))) => {
                assert_eq!(f.step.command_index, 1);
                assert_eq!(f.command, "false");
                assert!(!f.error.is_cancellation());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn failing_rune_aborts_the_queue() {
        let mut o = orchestrator();
        let names = vec!["one".into(), "boom".into(), "three".into()];
        let events = run(&mut o, Intent::RunQueue(names)).await;

        let out = o.output();
        assert!(out.starts_with("a\n"));
        assert_eq!(separators(out), 1);
        assert!(!out.contains("c\n"));
        assert!(steps(&events).iter().all(|s| s.batch_index < 2));
        match events.last() {
            Some(RunEvent::BatchFinished(BatchOutcome::Failure(f))) => {
                assert_eq!(f.step.batch_index, 1);
                assert_eq!(f.rune, "boom");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn successful_queue_separates_runes() {
        let mut o = orchestrator();
        let names = vec!["one".into(), "empty".into(), "three".into()];
        let events = run(&mut o, Intent::RunQueue(names)).await;
        assert_eq!(
            o.output(),
            format!("a\n{RUNE_SEPARATOR}{RUNE_SEPARATOR}c\n")
        );
        assert_eq!(
            events.last(),
            Some(&RunEvent::BatchFinished(BatchOutcome::Success))
        );
    }

    #[tokio::test]
    async fn cancel_yields_one_cancelled_and_no_late_output() {
        let mut o = orchestrator();
        let mut events = o.handle(Intent::RunRune("slow".into())).unwrap();
        while !o.output().contains("early") {
            let next = tokio::time::timeout(Duration::from_secs(5), o.next_events())
                .await
                .expect("first output");
            events.extend(next);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(o.handle(Intent::Cancel).unwrap().is_empty());
        assert!(o.handle(Intent::Cancel).unwrap().is_empty());
        assert_eq!(o.phase(), &Phase::Cancelling);
        let output_at_cancel = o.output().to_string();

        let rest = tokio::time::timeout(Duration::from_secs(3), o.run_to_completion())
            .await
            .expect("cancel should settle promptly");
        events.extend(rest);

        assert_eq!(o.output(), output_at_cancel);
        assert_eq!(
            events
                .iter()
                .filter(|e| **e == RunEvent::BatchCancelled)
                .count(),
            1
        );
        assert!(!events
            .iter()
            .any(|e| matches!(e, RunEvent::BatchFinished(_))));
        assert!(events.iter().any(|e| matches!(
            e,
            RunEvent::StepFinished {
                error: Some(ExecError::Cancelled),
                ..
            }
        )));
        assert_eq!(o.phase(), &Phase::Cancelled);
        assert!(!o.state().has_cancel_handle());
    }

    #[tokio::test]
    async fn cancel_while_idle_is_a_no_op() {
        let mut o = orchestrator();
        assert!(o.handle(Intent::Cancel).unwrap().is_empty());
        assert_eq!(o.phase(), &Phase::Idle);
    }

    #[tokio::test]
    async fn second_run_is_rejected_until_acknowledged() {
        let mut o = orchestrator();
        o.handle(Intent::RunRune("slow".into())).unwrap();
        assert_eq!(
            o.handle(Intent::RunRune("build".into())),
            Err(OrchestratorError::Busy)
        );
        assert_eq!(
            o.handle(Intent::Acknowledge),
            Err(OrchestratorError::StillRunning)
        );
        o.handle(Intent::Cancel).unwrap();
        tokio::time::timeout(Duration::from_secs(3), o.run_to_completion())
            .await
            .unwrap();

        assert_eq!(
            o.handle(Intent::RunRune("build".into())),
            Err(OrchestratorError::AwaitingAcknowledge)
        );
        o.handle(Intent::Acknowledge).unwrap();
        assert_eq!(o.phase(), &Phase::Idle);
        run(&mut o, Intent::RunRune("build".into())).await;
        assert_eq!(o.output(), "a\nb\n");
    }

    #[tokio::test]
    async fn history_is_written_before_the_run() {
        let mut o = orchestrator();
        o.handle(Intent::RunRune("slow".into())).unwrap();
        let listed = o.recent_history(10).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].rune_ids, vec!["slow".to_string()]);
        assert_eq!(listed[0].collection_id, "/proj");
        o.handle(Intent::Cancel).unwrap();
        tokio::time::timeout(Duration::from_secs(3), o.run_to_completion())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn history_failure_does_not_block_the_batch() {
        let mut o = orchestrator_with(Box::new(MemoryHistoryStore::unavailable("read-only")));
        let events = run(&mut o, Intent::RunRune("one".into())).await;
        match events.first() {
            Some(RunEvent::BatchStarted {
                history: HistoryRecord::Failed(reason),
                ..
            }) => assert!(reason.contains("read-only")),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            events.last(),
            Some(&RunEvent::BatchFinished(BatchOutcome::Success))
        );
    }

    #[tokio::test]
    async fn unknown_rune_runs_nothing() {
        let mut o = orchestrator();
        assert_eq!(
            o.handle(Intent::RunQueue(vec!["one".into(), "nope".into()])),
            Err(OrchestratorError::UnknownRune("nope".into()))
        );
        assert_eq!(o.phase(), &Phase::Idle);
        assert!(o.recent_history(10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn replay_reruns_a_recorded_batch() {
        let mut o = orchestrator();
        run(&mut o, Intent::RunQueue(vec!["one".into(), "three".into()])).await;
        o.handle(Intent::Acknowledge).unwrap();

        let entry = o.recent_history(10).unwrap().remove(0);
        let mut events = o.replay(&entry).unwrap();
        events.extend(o.run_to_completion().await);
        assert_eq!(o.output(), format!("a\n{RUNE_SEPARATOR}c\n"));
        assert_eq!(o.recent_history(10).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn loegs_reach_commands() {
        let mut o = orchestrator();
        run(&mut o, Intent::RunRune("greet".into())).await;
        assert_eq!(o.output(), "hi\n");
    }

    #[tokio::test]
    async fn poll_drains_without_blocking() {
        let mut o = orchestrator();
        let mut events = o.handle(Intent::RunRune("build".into())).unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while o.is_active() {
            assert!(tokio::time::Instant::now() < deadline);
            events.extend(o.poll());
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(o.output(), "a\nb\n");
        assert_eq!(
            events.last(),
            Some(&RunEvent::BatchFinished(BatchOutcome::Success))
        );
    }
}
