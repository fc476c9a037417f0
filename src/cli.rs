use crate::config::Config;
use crate::engine::ProcessRunner;
use crate::error::ErrorKind;
use crate::logging::{self, LogTarget};
use crate::model::{HistoryRecord, RunEvent};
use crate::orchestrator::{Intent, Orchestrator};
use crate::remote::RemoteClient;
use crate::spellbook::SpellbookSource;
use crate::storage::{default_history_path, HistoryStore, JsonlHistoryStore, MemoryHistoryStore};
use crate::text_summary::{build_text_summary, history_lines, BatchTally};
use anyhow::{bail, Context, Result};
use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::mpsc;

/// Exit status after a cancelled batch (as after SIGINT).
const EXIT_CANCELLED: u8 = 130;

/// Output routing for the stdout/stderr writer.
enum OutputLine {
    /// Raw command output, written as-is.
    Stdout(String),
    Stderr(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = stdout.lock();
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(text) => {
                    let _ = out.write_all(text.as_bytes());
                    let _ = out.flush();
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "catalyst",
    version,
    about = "Run named sequences of shell commands (runes) with live output and replayable history"
)]
pub struct Cli {
    /// Config file (default: <config dir>/Catalyst/config.toml)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// SSH host of the RuneCraft backend (overrides runecraft_host)
    #[arg(long)]
    pub host: Option<String>,

    /// Shell used to run commands (overrides shell)
    #[arg(long)]
    pub shell: Option<String>,

    /// Load runes from a local JSON spellbook instead of the backend
    #[arg(long)]
    pub spellbook: Option<PathBuf>,

    /// Collection identifier (default: current directory)
    #[arg(long)]
    pub collection: Option<String>,

    /// History file (overrides history_path)
    #[arg(long)]
    pub history_file: Option<PathBuf>,

    /// Keep history in memory only
    #[arg(long)]
    pub no_history: bool,

    /// Log file for the interactive UI
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Run without the TUI and print output to stdout
    #[arg(long)]
    pub text: bool,

    /// Rune to run in text mode; repeat to queue several
    #[arg(long = "run", value_name = "NAME")]
    pub runs: Vec<String>,

    /// Print execution history and exit
    #[arg(long)]
    pub history: bool,

    /// Show a notice when a cancel has been pending this long
    #[arg(long)]
    pub cancel_notice_after: Option<humantime::Duration>,
}

impl Cli {
    fn interactive(&self) -> bool {
        !self.text && !self.history
    }
}

/// Settings resolved from the config file and flags.
#[derive(Debug, Clone)]
pub(crate) struct Settings {
    pub config: Config,
    pub collection_id: String,
    pub history_path: Option<PathBuf>,
    pub source: SpellbookSource,
}

pub(crate) fn resolve_settings(args: &Cli, mut config: Config) -> Result<Settings> {
    if let Some(host) = &args.host {
        config.runecraft_host = host.clone();
    }
    if let Some(shell) = &args.shell {
        config.shell = shell.clone();
    }
    if let Some(d) = args.cancel_notice_after {
        config.cancel_notice_after = d.into();
    }
    let collection_id = match &args.collection {
        Some(c) => c.clone(),
        None => std::env::current_dir()
            .context("determine current directory")?
            .display()
            .to_string(),
    };
    let history_path = if args.no_history {
        None
    } else {
        Some(
            args.history_file
                .clone()
                .or_else(|| config.history_path.clone())
                .unwrap_or_else(default_history_path),
        )
    };
    let source = match &args.spellbook {
        Some(path) => SpellbookSource::File(path.clone()),
        None => SpellbookSource::Remote(RemoteClient::new(config.runecraft_host.clone())),
    };
    Ok(Settings {
        config,
        collection_id,
        history_path,
        source,
    })
}

fn open_history(settings: &Settings) -> Result<Box<dyn HistoryStore>> {
    Ok(match &settings.history_path {
        Some(path) => Box::new(JsonlHistoryStore::open(path)?),
        None => Box::new(MemoryHistoryStore::new()),
    })
}

pub(crate) async fn build_orchestrator(settings: &Settings) -> Result<Orchestrator> {
    let history = open_history(settings)?;
    let source = settings.source.clone();
    let collection = settings.collection_id.clone();
    // Remote loads shell out to ssh synchronously.
    let spellbook = tokio::task::spawn_blocking(move || source.load(&collection))
        .await
        .context("spellbook loader task failed")?
        .with_context(|| format!("load spellbook from {}", settings.source.describe()))?;
    tracing::info!(
        runes = spellbook.runes.len(),
        source = %settings.source.describe(),
        collection = %settings.collection_id,
        "spellbook loaded"
    );
    let runner = ProcessRunner::new(settings.config.runner(), Handle::current());
    Ok(Orchestrator::new(
        runner,
        history,
        spellbook,
        settings.collection_id.clone(),
    ))
}

pub async fn run(args: Cli) -> Result<ExitCode> {
    if !args.runs.is_empty() && !args.text {
        bail!("--run requires --text");
    }

    if args.interactive() {
        let log_path = args.log_file.clone().unwrap_or_else(logging::default_log_path);
        logging::init(LogTarget::File(&log_path))?;
    } else {
        logging::init(LogTarget::Stderr)?;
    }

    let config = Config::load(args.config.as_deref())?;
    let settings = resolve_settings(&args, config)?;

    if args.history {
        return print_history(&settings).await;
    }

    if args.interactive() {
        #[cfg(feature = "tui")]
        {
            let orchestrator = build_orchestrator(&settings).await?;
            crate::tui::run(orchestrator, settings).await?;
            return Ok(ExitCode::SUCCESS);
        }
        #[cfg(not(feature = "tui"))]
        {
            bail!("built without TUI support; use --text --run NAME");
        }
    }

    let orchestrator = build_orchestrator(&settings).await?;
    Ok(run_text(orchestrator, args.runs, &settings).await?.into())
}

async fn print_history(settings: &Settings) -> Result<ExitCode> {
    let store = open_history(settings)?;
    let entries = store.list()?;
    let (out_tx, out_handle) = spawn_output_writer();
    for line in history_lines(&entries) {
        let _ = out_tx.send(OutputLine::Stdout(format!("{line}\n")));
    }
    drop(out_tx);
    let _ = out_handle.await;
    Ok(ExitCode::SUCCESS)
}

/// How a text-mode batch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchEnd {
    Succeeded,
    Failed,
    Cancelled,
}

impl From<BatchEnd> for ExitCode {
    fn from(end: BatchEnd) -> Self {
        match end {
            BatchEnd::Succeeded => ExitCode::SUCCESS,
            BatchEnd::Failed => ExitCode::FAILURE,
            BatchEnd::Cancelled => ExitCode::from(EXIT_CANCELLED),
        }
    }
}

enum Wake {
    Events(Vec<RunEvent>),
    Interrupt,
    Tick,
}

async fn run_text(
    mut orchestrator: Orchestrator,
    runes: Vec<String>,
    settings: &Settings,
) -> Result<BatchEnd> {
    if runes.is_empty() {
        bail!("nothing to run; pass --run NAME");
    }
    let (out_tx, out_handle) = spawn_output_writer();
    let started = Instant::now();
    let mut tally = BatchTally::default();

    let events = orchestrator.handle(Intent::RunQueue(runes))?;
    report(&out_tx, &mut tally, events);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;
    let mut notice_shown = false;
    let mut ticker = tokio::time::interval(Duration::from_millis(250));

    while orchestrator.is_active() {
        let wake = tokio::select! {
            events = orchestrator.next_events() => Wake::Events(events),
            _ = &mut ctrl_c, if !interrupted => Wake::Interrupt,
            _ = ticker.tick() => Wake::Tick,
        };
        match wake {
            Wake::Events(events) => report(&out_tx, &mut tally, events),
            Wake::Interrupt => {
                interrupted = true;
                let _ = out_tx.send(OutputLine::Stderr("Cancelling…".into()));
                orchestrator.handle(Intent::Cancel)?;
            }
            Wake::Tick => {
                let overdue = orchestrator
                    .state()
                    .cancelling_for()
                    .is_some_and(|d| d >= settings.config.cancel_notice_after);
                if overdue && !notice_shown {
                    notice_shown = true;
                    let _ = out_tx.send(OutputLine::Stderr("Still cancelling…".into()));
                }
            }
        }
    }

    let summary = build_text_summary(&tally, started.elapsed());
    for line in summary.lines {
        let _ = out_tx.send(OutputLine::Stderr(line));
    }
    drop(out_tx);
    let _ = out_handle.await;

    Ok(if tally.succeeded() {
        BatchEnd::Succeeded
    } else if interrupted {
        BatchEnd::Cancelled
    } else {
        BatchEnd::Failed
    })
}

fn report(out: &mpsc::UnboundedSender<OutputLine>, tally: &mut BatchTally, events: Vec<RunEvent>) {
    for ev in events {
        tally.observe(&ev);
        let line = match ev {
            RunEvent::BatchStarted {
                history: HistoryRecord::Failed(reason),
                ..
            } => OutputLine::Stderr(format!("warning: history not recorded: {reason}")),
            RunEvent::BatchStarted { .. } => continue,
            RunEvent::StepStarted { rune, command, .. } => {
                OutputLine::Stderr(format!("== {rune} $ {command} =="))
            }
            RunEvent::OutputChunk(text) => OutputLine::Stdout(text),
            RunEvent::StepFinished {
                error: Some(e), ..
            } => OutputLine::Stderr(match e.kind() {
                ErrorKind::Cancellation => "-- cancelled".to_string(),
                ErrorKind::StartFailure => format!("-- could not start: {e}"),
                ErrorKind::ExecutionFailure => format!("-- {e}"),
            }),
            RunEvent::StepFinished { error: None, .. } => continue,
            RunEvent::BatchFinished(_) | RunEvent::BatchCancelled => continue,
        };
        let _ = out.send(line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("catalyst").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn text_mode_collects_runs_in_order() {
        let cli = parse(&["--text", "--run", "build", "--run", "test"]);
        assert!(cli.text);
        assert_eq!(cli.runs, vec!["build", "test"]);
        assert!(!cli.interactive());
    }

    #[test]
    fn flags_override_config() {
        let cli = parse(&[
            "--host",
            "craft",
            "--shell",
            "bash",
            "--collection",
            "/proj",
            "--history-file",
            "/tmp/h.jsonl",
            "--cancel-notice-after",
            "1s",
        ]);
        let s = resolve_settings(&cli, Config::default()).unwrap();
        assert_eq!(s.config.runecraft_host, "craft");
        assert_eq!(s.config.shell, "bash");
        assert_eq!(s.config.cancel_notice_after, Duration::from_secs(1));
        assert_eq!(s.collection_id, "/proj");
        assert_eq!(s.history_path, Some(PathBuf::from("/tmp/h.jsonl")));
        assert!(matches!(s.source, SpellbookSource::Remote(ref c) if c.host() == "craft"));
    }

    #[test]
    fn no_history_and_local_spellbook() {
        let cli = parse(&["--no-history", "--spellbook", "book.json"]);
        let s = resolve_settings(&cli, Config::default()).unwrap();
        assert!(s.history_path.is_none());
        assert!(matches!(s.source, SpellbookSource::File(ref p) if p == &PathBuf::from("book.json")));
        assert!(!s.collection_id.is_empty());
    }

    #[test]
    fn history_path_falls_back_to_config() {
        let cli = parse(&[]);
        let config = Config {
            history_path: Some("/var/h.jsonl".into()),
            ..Config::default()
        };
        let s = resolve_settings(&cli, config).unwrap();
        assert_eq!(s.history_path, Some(PathBuf::from("/var/h.jsonl")));
        assert!(cli.interactive());
    }

    #[tokio::test]
    async fn text_run_from_local_spellbook() {
        let dir = tempfile::tempdir().unwrap();
        let book = dir.path().join("book.json");
        std::fs::write(
            &book,
            r#"{"runes": [{"name": "hello", "commands": ["echo hello"]}]}"#,
        )
        .unwrap();
        let history = dir.path().join("history.jsonl");
        let cli = parse(&[
            "--text",
            "--spellbook",
            book.to_str().unwrap(),
            "--history-file",
            history.to_str().unwrap(),
            "--collection",
            "/proj",
        ]);
        let settings = resolve_settings(&cli, Config::default()).unwrap();
        let orchestrator = build_orchestrator(&settings).await.unwrap();
        let end = run_text(orchestrator, vec!["hello".into()], &settings)
            .await
            .unwrap();
        assert_eq!(end, BatchEnd::Succeeded);

        let store = JsonlHistoryStore::open(&history).unwrap();
        let entries = store.list().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].rune_ids, vec!["hello".to_string()]);
    }
}
