//! Error types shared by the execution engine, history store and orchestrator.

use std::process::ExitStatus;
use thiserror::Error;

/// Coarse classification of a step failure, used by presentation layers to
/// decide how to render it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    StartFailure,
    ExecutionFailure,
    Cancellation,
}

/// Terminal error of a single command.
///
/// Carries text rather than `io::Error` so it can be cloned into status
/// messages and compared in tests.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecError {
    #[error("failed to start `{command}`: {reason}")]
    Start { command: String, reason: String },

    #[error("{}", describe_exit(.code, .signal))]
    Exit {
        code: Option<i32>,
        signal: Option<i32>,
    },

    #[error("i/o error while running command: {0}")]
    Io(String),

    #[error("runner stopped without reporting an exit status")]
    Lost,

    #[error("cancelled")]
    Cancelled,
}

impl ExecError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExecError::Start { .. } => ErrorKind::StartFailure,
            ExecError::Cancelled => ErrorKind::Cancellation,
            ExecError::Exit { .. } | ExecError::Io(_) | ExecError::Lost => {
                ErrorKind::ExecutionFailure
            }
        }
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, ExecError::Cancelled)
    }

    pub(crate) fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;
        ExecError::Exit {
            code: status.code(),
            signal,
        }
    }
}

impl From<std::io::Error> for ExecError {
    fn from(e: std::io::Error) -> Self {
        ExecError::Io(e.to_string())
    }
}

fn describe_exit(code: &Option<i32>, signal: &Option<i32>) -> String {
    match (*code, *signal) {
        (Some(c), _) => format!("exited with status {c}"),
        (None, Some(s)) => format!("killed by signal {s}"),
        (None, None) => "exited abnormally".to_string(),
    }
}

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("history i/o failed for {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode history entry: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("history store is unavailable: {0}")]
    Unavailable(String),
}

/// Misuse of the sequencing state machines. These indicate a caller bug, never
/// a command failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SequenceError {
    #[error("no command is running")]
    NoCommandRunning,

    #[error("batch already completed")]
    BatchComplete,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrchestratorError {
    #[error("a batch is already running")]
    Busy,

    #[error("the previous batch has not been acknowledged")]
    AwaitingAcknowledge,

    #[error("the batch is still running")]
    StillRunning,

    #[error("unknown rune `{0}`")]
    UnknownRune(String),

    #[error("nothing to run")]
    EmptyBatch,
}

/// A spellbook edit that cannot be applied as given.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EditError {
    #[error("{0} is required")]
    Missing(&'static str),

    #[error("a rune named `{0}` already exists")]
    DuplicateRune(String),

    #[error("no rune named `{0}`")]
    UnknownRune(String),

    #[error("no loeg named `{0}`")]
    UnknownLoeg(String),

    #[error("`{0}` is not a valid variable name")]
    InvalidLoegKey(String),
}

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("ssh command failed: {0}")]
    Stderr(String),

    #[error("ssh command execution failed: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("ssh exited with {0}")]
    Status(ExitStatus),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_separate_cancellation_from_failure() {
        assert_eq!(ExecError::Cancelled.kind(), ErrorKind::Cancellation);
        assert!(ExecError::Cancelled.is_cancellation());
        let exit = ExecError::Exit {
            code: Some(1),
            signal: None,
        };
        assert_eq!(exit.kind(), ErrorKind::ExecutionFailure);
        assert!(!exit.is_cancellation());
        let start = ExecError::Start {
            command: "x".into(),
            reason: "nope".into(),
        };
        assert_eq!(start.kind(), ErrorKind::StartFailure);
    }

    #[test]
    fn exit_messages() {
        let code = ExecError::Exit {
            code: Some(2),
            signal: None,
        };
        assert_eq!(code.to_string(), "exited with status 2");
        let sig = ExecError::Exit {
            code: None,
            signal: Some(9),
        };
        assert_eq!(sig.to_string(), "killed by signal 9");
    }
}
