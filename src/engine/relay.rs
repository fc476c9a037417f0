//! Bridge from the runner's background tasks to a cooperative consumer.
//!
//! The runner posts [`RunnerEvent`]s into a bounded channel; the consumer
//! pulls them one at a time, either without blocking ([`OutputRelay::try_pull`],
//! for a render loop) or as a future ([`OutputRelay::pull`], or the
//! [`Stream`] impl). Exactly one `Finished` event is ever yielded.

use crate::error::ExecError;
use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerEvent {
    Output(String),
    Finished(Result<(), ExecError>),
}

/// Outcome of a non-blocking pull.
#[derive(Debug, PartialEq, Eq)]
pub enum Pull {
    Event(RunnerEvent),
    /// Nothing ready yet; ask again later.
    Pending,
    /// The terminal event was already delivered.
    Closed,
}

/// Producer half handed to the runner's background tasks.
#[derive(Debug, Clone)]
pub struct RelaySender {
    tx: mpsc::Sender<RunnerEvent>,
}

impl RelaySender {
    /// Post an output chunk, waiting for room when the consumer is behind.
    /// Returns `false` once the consumer has gone away.
    pub async fn chunk(&self, text: String) -> bool {
        self.tx.send(RunnerEvent::Output(text)).await.is_ok()
    }

    /// Post the terminal event. Consumes the sender so a task cannot finish twice.
    pub async fn finish(self, result: Result<(), ExecError>) {
        let _ = self.tx.send(RunnerEvent::Finished(result)).await;
    }
}

pub struct OutputRelay {
    rx: mpsc::Receiver<RunnerEvent>,
    finished: bool,
}

pub fn channel(capacity: usize) -> (RelaySender, OutputRelay) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        RelaySender { tx },
        OutputRelay {
            rx,
            finished: false,
        },
    )
}

impl OutputRelay {
    #[cfg(test)]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn try_pull(&mut self) -> Pull {
        if self.finished {
            return Pull::Closed;
        }
        match self.rx.try_recv() {
            Ok(ev) => Pull::Event(self.observe(ev)),
            Err(mpsc::error::TryRecvError::Empty) => Pull::Pending,
            Err(mpsc::error::TryRecvError::Disconnected) => Pull::Event(self.lost()),
        }
    }

    /// Wait for the next event. `None` after the terminal event was yielded.
    pub async fn pull(&mut self) -> Option<RunnerEvent> {
        if self.finished {
            return None;
        }
        match self.rx.recv().await {
            Some(ev) => Some(self.observe(ev)),
            None => Some(self.lost()),
        }
    }

    fn observe(&mut self, ev: RunnerEvent) -> RunnerEvent {
        if matches!(ev, RunnerEvent::Finished(_)) {
            self.finished = true;
            self.rx.close();
        }
        ev
    }

    // Every sender dropped without a terminal event: the runner task died.
    fn lost(&mut self) -> RunnerEvent {
        self.finished = true;
        RunnerEvent::Finished(Err(ExecError::Lost))
    }
}

impl Stream for OutputRelay {
    type Item = RunnerEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(ev)) => Poll::Ready(Some(this.observe(ev))),
            Poll::Ready(None) => Poll::Ready(Some(this.lost())),
            Poll::Pending => Poll::Pending,
        }
    }
}
