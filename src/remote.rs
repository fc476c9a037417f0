//! Synchronous request/response calls to the RuneCraft backend over SSH.

use crate::error::RemoteError;
use std::process::Command;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct RemoteClient {
    host: String,
}

impl RemoteClient {
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Run `command` on the backend and return its stdout. Any stderr output
    /// counts as failure, even with a zero exit status.
    pub fn command(&self, command: &str) -> Result<String, RemoteError> {
        debug!(host = %self.host, %command, "remote call");
        let out = Command::new("ssh").arg(&self.host).arg(command).output()?;
        let stderr = String::from_utf8_lossy(&out.stderr);
        if !stderr.trim().is_empty() {
            return Err(RemoteError::Stderr(stderr.trim().to_string()));
        }
        if !out.status.success() {
            return Err(RemoteError::Status(out.status));
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }
}

/// Build a backend command line, quoting every argument.
pub fn backend_command(verb: &str, args: &[&str]) -> String {
    args.iter()
        .fold(CommandLine::new(verb), |line, arg| line.arg(arg))
        .into_string()
}

/// A backend command line under construction. Values are always quoted.
#[derive(Debug, Clone)]
pub struct CommandLine(String);

impl CommandLine {
    pub fn new(verb: &str) -> Self {
        Self(verb.to_string())
    }

    pub fn arg(mut self, value: &str) -> Self {
        self.0.push(' ');
        self.0.push_str(&quote(value));
        self
    }

    /// `-name "value"`
    pub fn flag(mut self, name: &str, value: &str) -> Self {
        self.0.push_str(" -");
        self.0.push_str(name);
        self.arg(value)
    }

    /// `KEY="value"`. `key` must already be a plain identifier.
    pub fn assignment(mut self, key: &str, value: &str) -> Self {
        self.0.push(' ');
        self.0.push_str(key);
        self.0.push('=');
        self.0.push_str(&quote(value));
        self
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

fn quote(arg: &str) -> String {
    let mut out = String::with_capacity(arg.len() + 2);
    out.push('"');
    for c in arg.chars() {
        if matches!(c, '"' | '\\' | '$' | '`') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}
