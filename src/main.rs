mod cli;
mod config;
mod engine;
mod error;
mod logging;
mod model;
mod orchestrator;
mod remote;
mod spellbook;
mod storage;
mod text_summary;
#[cfg(feature = "tui")]
mod tui;

use clap::Parser;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    let args = cli::Cli::parse();

    match cli::run(args).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{e:#}");
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
