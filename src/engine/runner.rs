//! Spawns one shell command and streams its output into an [`OutputRelay`].

use super::relay::{self, OutputRelay, RelaySender};
use super::terminal::QueryFilter;
use crate::error::ExecError;
use bytes::BytesMut;
use command_group::{AsyncCommandGroup, AsyncGroupChild};
use std::os::fd::OwnedFd;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::pipe;
use tokio::process::{ChildStdin, Command};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub shell: String,
    pub shell_arg: String,
    pub term: String,
    /// Extra variables layered over the inherited environment.
    pub env: Vec<(String, String)>,
    pub relay_capacity: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            shell: "sh".into(),
            shell_arg: "-c".into(),
            term: "xterm-256color".into(),
            env: Vec::new(),
            relay_capacity: 256,
        }
    }
}

/// Starts commands on the Tokio runtime. Cheap to clone.
#[derive(Clone)]
pub struct ProcessRunner {
    cfg: Arc<RunnerConfig>,
    runtime: Handle,
}

impl ProcessRunner {
    pub fn new(cfg: RunnerConfig, runtime: Handle) -> Self {
        Self {
            cfg: Arc::new(cfg),
            runtime,
        }
    }

    /// Replace the extra environment, e.g. after a spellbook reload.
    pub fn set_env(&mut self, env: Vec<(String, String)>) {
        Arc::make_mut(&mut self.cfg).env = env;
    }

    /// Start `command` in the background. The returned relay yields zero or more
    /// output chunks followed by exactly one `Finished`.
    pub fn spawn(&self, command: &str, cancel: CancellationToken) -> OutputRelay {
        let (tx, relay) = relay::channel(self.cfg.relay_capacity);
        let cfg = self.cfg.clone();
        let command = command.to_string();
        self.runtime.spawn(async move {
            let result = supervise(&cfg, &command, &cancel, &tx).await;
            match &result {
                Ok(()) => debug!(%command, "command succeeded"),
                Err(e) => debug!(%command, error = %e, "command ended"),
            }
            tx.finish(result).await;
        });
        relay
    }
}

async fn supervise(
    cfg: &RunnerConfig,
    command: &str,
    cancel: &CancellationToken,
    tx: &RelaySender,
) -> Result<(), ExecError> {
    if cancel.is_cancelled() {
        return Err(ExecError::Cancelled);
    }

    // stdout and stderr share one pipe so the child's writes stay in order.
    let (output, output_writer) = std::io::pipe()?;
    let stderr_writer = output_writer.try_clone()?;
    let output = pipe::Receiver::from_owned_fd(OwnedFd::from(output))?;

    let mut cmd = Command::new(&cfg.shell);
    cmd.arg(&cfg.shell_arg)
        .arg(command)
        .env("TERM", &cfg.term)
        .envs(cfg.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::piped())
        .stdout(output_writer)
        .stderr(stderr_writer)
        .kill_on_drop(true);

    let spawned = cmd.group_spawn();
    // The command holds our copies of the write end; EOF only arrives once
    // they are closed.
    drop(cmd);
    let mut child = spawned.map_err(|e| ExecError::Start {
        command: command.to_string(),
        reason: e.to_string(),
    })?;
    debug!(%command, pid = ?child.id(), "spawned");

    let (reply_tx, reply_rx) = mpsc::unbounded_channel::<&'static [u8]>();
    let writer = child
        .inner()
        .stdin
        .take()
        .map(|stdin| tokio::spawn(write_replies(stdin, reply_rx)));
    let mut reader = tokio::spawn(pump(output, tx.clone(), reply_tx));
    let tasks = Tasks {
        reader: reader.abort_handle(),
        writer,
    };

    let exited = tokio::select! {
        status = child.wait() => Some(status),
        _ = cancel.cancelled() => None,
    };

    let status = match exited {
        Some(Ok(status)) => status,
        Some(Err(e)) => {
            warn!(error = %e, "waiting for command failed");
            teardown(&mut child, tasks).await;
            return Err(e.into());
        }
        None => {
            debug!(pid = ?child.id(), "cancelling: killing process group");
            teardown(&mut child, tasks).await;
            return Err(ExecError::Cancelled);
        }
    };

    // Output still buffered in the pipe belongs to this command; deliver it
    // before the terminal event.
    let drained = tokio::select! {
        _ = &mut reader => true,
        _ = cancel.cancelled() => false,
    };
    tasks.abort();
    if !drained {
        return Err(ExecError::Cancelled);
    }

    if status.success() {
        Ok(())
    } else {
        Err(ExecError::from_status(status))
    }
}

/// Background tasks serving one child.
struct Tasks {
    reader: AbortHandle,
    writer: Option<JoinHandle<()>>,
}

impl Tasks {
    fn abort(&self) {
        self.reader.abort();
        if let Some(w) = &self.writer {
            w.abort();
        }
    }
}

/// Stop the I/O tasks and kill the whole process group.
async fn teardown(child: &mut AsyncGroupChild, tasks: Tasks) {
    tasks.abort();
    if let Err(e) = child.kill().await {
        // Already exited between the select and the kill.
        warn!(error = %e, "kill failed");
    }
}

async fn pump<R>(mut reader: R, tx: RelaySender, replies: mpsc::UnboundedSender<&'static [u8]>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    let mut filter = QueryFilter::default();
    let mut decoder = Utf8Decoder::default();
    loop {
        buf.clear();
        match reader.read_buf(&mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "output read failed");
                break;
            }
        }
        let filtered = filter.feed(&buf);
        for reply in filtered.responses {
            let _ = replies.send(reply);
        }
        let text = decoder.decode(&filtered.cleaned);
        if !text.is_empty() && !tx.chunk(text).await {
            return;
        }
    }
    let tail = decoder.finish(&filter.flush());
    if !tail.is_empty() {
        tx.chunk(tail).await;
    }
}

async fn write_replies(mut stdin: ChildStdin, mut rx: mpsc::UnboundedReceiver<&'static [u8]>) {
    while let Some(reply) = rx.recv().await {
        if stdin.write_all(reply).await.is_err() || stdin.flush().await.is_err() {
            break;
        }
    }
}

/// Incremental UTF-8 decoding. A character split across two chunks decodes
/// the same as if it had arrived whole; invalid bytes become U+FFFD.
#[derive(Debug, Default)]
struct Utf8Decoder {
    carry: Vec<u8>,
}

impl Utf8Decoder {
    fn decode(&mut self, bytes: &[u8]) -> String {
        let buf = [std::mem::take(&mut self.carry).as_slice(), bytes].concat();
        let mut out = String::with_capacity(buf.len());
        let mut rest = buf.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(text) => {
                    out.push_str(text);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(n) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[n..];
                        }
                        // Incomplete sequence at the very end: wait for more.
                        None => {
                            self.carry = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    fn finish(&mut self, bytes: &[u8]) -> String {
        let mut buf = std::mem::take(&mut self.carry);
        buf.extend_from_slice(bytes);
        String::from_utf8_lossy(&buf).into_owned()
    }
}
