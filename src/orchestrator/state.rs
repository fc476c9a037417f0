//! Mutable state of the current (or last) batch, owned by the main loop.

use crate::model::{BatchOutcome, StepRef};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Idle,
    Running,
    /// Cancel requested; waiting for the in-flight command to report.
    Cancelling,
    Finished(BatchOutcome),
    Cancelled,
}

impl Phase {
    /// Running or Cancelling.
    pub fn is_active(&self) -> bool {
        matches!(self, Phase::Running | Phase::Cancelling)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Finished(_) | Phase::Cancelled)
    }
}

#[derive(Debug, Default)]
pub struct RunState {
    pub(crate) phase: Phase,
    pub(crate) batch_index: usize,
    pub(crate) command_index: usize,
    pub(crate) output: String,
    active_cancel: Option<CancellationToken>,
    cancel_requested_at: Option<Instant>,
}

impl RunState {
    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    pub fn step(&self) -> StepRef {
        StepRef {
            batch_index: self.batch_index,
            command_index: self.command_index,
        }
    }

    /// Everything the current batch has printed so far, separators included.
    pub fn output(&self) -> &str {
        &self.output
    }

    #[cfg(test)]
    pub fn has_cancel_handle(&self) -> bool {
        self.active_cancel.is_some()
    }

    /// How long a requested cancel has been pending.
    pub fn cancelling_for(&self) -> Option<Duration> {
        match self.phase {
            Phase::Cancelling => self.cancel_requested_at.map(|at| at.elapsed()),
            _ => None,
        }
    }

    /// Reset for a new batch and create its cancellation handle.
    pub(crate) fn begin(&mut self) -> CancellationToken {
        assert!(
            self.active_cancel.is_none(),
            "cancellation handle armed while another batch still owns one"
        );
        let token = CancellationToken::new();
        self.active_cancel = Some(token.clone());
        self.cancel_requested_at = None;
        self.phase = Phase::Running;
        self.batch_index = 0;
        self.command_index = 0;
        self.output.clear();
        token
    }

    /// Handle for the next command of the active batch.
    pub(crate) fn cancel_token(&self) -> Option<CancellationToken> {
        self.active_cancel.clone()
    }

    /// Fire the handle. Returns `false` when nothing is running or a cancel is
    /// already pending.
    pub(crate) fn request_cancel(&mut self) -> bool {
        if self.phase != Phase::Running {
            return false;
        }
        if let Some(token) = &self.active_cancel {
            token.cancel();
        }
        self.phase = Phase::Cancelling;
        self.cancel_requested_at = Some(Instant::now());
        true
    }

    /// Move to a terminal phase, dropping the cancellation handle.
    pub(crate) fn settle(&mut self, phase: Phase) {
        debug_assert!(phase.is_terminal());
        self.active_cancel = None;
        self.cancel_requested_at = None;
        self.phase = phase;
    }

    pub(crate) fn acknowledge(&mut self) -> bool {
        if !self.phase.is_terminal() {
            return false;
        }
        self.phase = Phase::Idle;
        true
    }
}
