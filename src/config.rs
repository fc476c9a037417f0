//! Configuration loaded from `<config dir>/Catalyst/config.toml`.

use crate::engine::RunnerConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG: &str = r#"# Catalyst configuration

# SSH host of the RuneCraft backend.
runecraft_host = "localhost"

# Shell used to run rune commands: `<shell> <shell_arg> <command>`.
# shell = "sh"
# shell_arg = "-c"

# TERM exported to commands.
# term = "xterm-256color"

# Maximum output chunks buffered between a command and the UI.
# relay_capacity = 256

# history_path = "/path/to/history.jsonl"

# Show "Still cancelling…" after a cancel has been pending this long.
# cancel_notice_after = "3s"
"#;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub runecraft_host: String,
    pub shell: String,
    pub shell_arg: String,
    pub term: String,
    pub relay_capacity: usize,
    pub history_path: Option<PathBuf>,
    #[serde(with = "humantime_serde")]
    pub cancel_notice_after: Duration,
}

impl Default for Config {
    fn default() -> Self {
        let runner = RunnerConfig::default();
        Self {
            runecraft_host: "localhost".into(),
            shell: runner.shell,
            shell_arg: runner.shell_arg,
            term: runner.term,
            relay_capacity: runner.relay_capacity,
            history_path: None,
            cancel_notice_after: Duration::from_secs(3),
        }
    }
}

impl Config {
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("Catalyst").join("config.toml"))
    }

    /// Load `path`, or the default location when `None`. A missing file at the
    /// default location is created with commented defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load_from(p),
            None => match Self::default_path() {
                Some(p) => {
                    if !p.exists() {
                        write_default(&p)?;
                    }
                    Self::load_from(&p)
                }
                None => {
                    tracing::debug!("no config directory; using defaults");
                    Ok(Self::default())
                }
            },
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parse config {}", path.display()))
    }

    pub fn runner(&self) -> RunnerConfig {
        RunnerConfig {
            shell: self.shell.clone(),
            shell_arg: self.shell_arg.clone(),
            term: self.term.clone(),
            env: Vec::new(),
            relay_capacity: self.relay_capacity,
        }
    }
}

fn write_default(path: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    }
    std::fs::write(path, DEFAULT_CONFIG)
        .with_context(|| format!("write default config {}", path.display()))?;
    tracing::info!(path = %path.display(), "wrote default config");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_file_parses_to_defaults() {
        let cfg: Config = toml::from_str(DEFAULT_CONFIG).unwrap();
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn empty_file_uses_defaults() {
        let cfg: Config = toml::from_str("").unwrap();
        assert_eq!(cfg.shell, "sh");
        assert_eq!(cfg.cancel_notice_after, Duration::from_secs(3));
    }

    #[test]
    fn overrides_are_applied() {
        let cfg: Config = toml::from_str(
            r#"
runecraft_host = "craft.example"
shell = "zsh"
relay_capacity = 16
history_path = "/tmp/h.jsonl"
cancel_notice_after = "500ms"
"#,
        )
        .unwrap();
        assert_eq!(cfg.runecraft_host, "craft.example");
        assert_eq!(cfg.history_path, Some(PathBuf::from("/tmp/h.jsonl")));
        assert_eq!(cfg.cancel_notice_after, Duration::from_millis(500));
        let runner = cfg.runner();
        assert_eq!(runner.shell, "zsh");
        assert_eq!(runner.shell_arg, "-c");
        assert_eq!(runner.relay_capacity, 16);
    }

    #[test]
    fn explicit_path_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Config::load(Some(&dir.path().join("missing.toml"))).is_err());
        let path = dir.path().join("c.toml");
        std::fs::write(&path, "term = \"dumb\"\n").unwrap();
        assert_eq!(Config::load(Some(&path)).unwrap().term, "dumb");
    }

    #[test]
    fn unknown_types_are_rejected() {
        assert!(toml::from_str::<Config>("relay_capacity = \"lots\"").is_err());
    }
}
