//! Tracing subscriber setup.
//!
//! The TUI owns the terminal, so interactive sessions log to a file at `info`;
//! text mode logs to stderr at `warn` so it does not drown command output.
//! `RUST_LOG` overrides either default.

use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub enum LogTarget<'a> {
    Stderr,
    File(&'a Path),
}

pub fn default_log_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("catalyst")
        .join("catalyst.log")
}

fn filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

pub fn init(target: LogTarget<'_>) -> Result<()> {
    match target {
        LogTarget::Stderr => tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(filter("warn"))
            .try_init()
            .context("install tracing subscriber")?,
        LogTarget::File(path) => {
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("create log dir {}", dir.display()))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("open log file {}", path.display()))?;
            tracing_subscriber::registry()
                .with(
                    fmt::layer()
                        .with_ansi(false)
                        .with_writer(Mutex::new(file)),
                )
                .with(filter("info"))
                .try_init()
                .context("install tracing subscriber")?
        }
    }
    Ok(())
}
