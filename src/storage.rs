//! Execution history: one append-only record per batch.

use crate::error::HistoryError;
use crate::model::HistoryEntry;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tracing::{debug, warn};

pub trait HistoryStore: Send {
    /// Append a record for a batch about to run and return its id.
    fn record(&mut self, rune_ids: &[String], collection_id: &str) -> Result<u64, HistoryError>;

    /// All records, newest first.
    fn list(&self) -> Result<Vec<HistoryEntry>, HistoryError>;

    fn load_recent(&self, limit: usize) -> Result<Vec<HistoryEntry>, HistoryError> {
        let mut all = self.list()?;
        all.truncate(limit);
        Ok(all)
    }
}

/// Default location of the history file.
pub fn default_history_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("catalyst")
        .join("history.jsonl")
}

/// Hands out strictly increasing timestamps so newest-first order is total.
#[derive(Debug, Default)]
struct Clock {
    last: Option<OffsetDateTime>,
}

impl Clock {
    fn next(&mut self) -> OffsetDateTime {
        let now = OffsetDateTime::now_utc();
        let at = match self.last {
            Some(last) if now <= last => last + time::Duration::microseconds(1),
            _ => now,
        };
        self.last = Some(at);
        at
    }
}

fn sort_newest_first(entries: &mut [HistoryEntry]) {
    entries.sort_by(|a, b| {
        b.executed_at
            .cmp(&a.executed_at)
            .then_with(|| b.id.cmp(&a.id))
    });
}

/// JSON-lines file, one [`HistoryEntry`] per line.
#[derive(Debug)]
pub struct JsonlHistoryStore {
    path: PathBuf,
    next_id: u64,
    clock: Clock,
}

impl JsonlHistoryStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, HistoryError> {
        let path = path.into();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|source| HistoryError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        let existing = read_entries(&path)?;
        let next_id = existing.iter().map(|e| e.id).max().map_or(1, |id| id + 1);
        let clock = Clock {
            last: existing.iter().map(|e| e.executed_at).max(),
        };
        debug!(path = %path.display(), entries = existing.len(), "history opened");
        Ok(Self {
            path,
            next_id,
            clock,
        })
    }
}

impl HistoryStore for JsonlHistoryStore {
    fn record(&mut self, rune_ids: &[String], collection_id: &str) -> Result<u64, HistoryError> {
        let entry = HistoryEntry {
            id: self.next_id,
            rune_ids: rune_ids.to_vec(),
            collection_id: collection_id.to_string(),
            executed_at: self.clock.next(),
        };
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');

        let io_err = |source| HistoryError::Io {
            path: self.path.clone(),
            source,
        };
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(io_err)?;
        file.write_all(line.as_bytes()).map_err(io_err)?;
        file.flush().map_err(io_err)?;

        self.next_id += 1;
        Ok(entry.id)
    }

    fn list(&self) -> Result<Vec<HistoryEntry>, HistoryError> {
        let mut entries = read_entries(&self.path)?;
        sort_newest_first(&mut entries);
        Ok(entries)
    }
}

fn read_entries(path: &Path) -> Result<Vec<HistoryEntry>, HistoryError> {
    let file = match fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(HistoryError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    let mut entries = Vec::new();
    for (n, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|source| HistoryError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<HistoryEntry>(&line) {
            Ok(entry) => entries.push(entry),
            Err(e) => warn!(path = %path.display(), line = n + 1, error = %e, "skipping malformed history line"),
        }
    }
    Ok(entries)
}

/// Non-persistent store, used with `--no-history`.
#[derive(Debug, Default)]
pub struct MemoryHistoryStore {
    entries: Vec<HistoryEntry>,
    clock: Clock,
    unavailable: Option<String>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose writes always fail with the given reason.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            unavailable: Some(reason.into()),
            ..Self::default()
        }
    }
}

impl HistoryStore for MemoryHistoryStore {
    fn record(&mut self, rune_ids: &[String], collection_id: &str) -> Result<u64, HistoryError> {
        if let Some(reason) = &self.unavailable {
            return Err(HistoryError::Unavailable(reason.clone()));
        }
        let id = self.entries.len() as u64 + 1;
        self.entries.push(HistoryEntry {
            id,
            rune_ids: rune_ids.to_vec(),
            collection_id: collection_id.to_string(),
            executed_at: self.clock.next(),
        });
        Ok(id)
    }

    fn list(&self) -> Result<Vec<HistoryEntry>, HistoryError> {
        let mut entries = self.entries.clone();
        sort_newest_first(&mut entries);
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn assert_strictly_newest_first(entries: &[HistoryEntry]) {
        for pair in entries.windows(2) {
            assert!(pair[0].executed_at > pair[1].executed_at);
        }
    }

    #[test]
    fn jsonl_records_and_lists_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = JsonlHistoryStore::open(dir.path().join("h/history.jsonl")).unwrap();

        let batches = [ids(&["build"]), ids(&["lint", "test"]), ids(&["deploy"])];
        for b in &batches {
            store.record(b, "/work/project").unwrap();
        }

        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 3);
        assert_strictly_newest_first(&listed);
        assert_eq!(listed[0].rune_ids, batches[2]);
        assert_eq!(listed[1].rune_ids, batches[1]);
        assert_eq!(listed[2].rune_ids, batches[0]);
        assert_eq!(listed[2].id, 1);
        assert!(listed.iter().all(|e| e.collection_id == "/work/project"));
    }

    #[test]
    fn reopening_continues_ids_and_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.jsonl");
        {
            let mut store = JsonlHistoryStore::open(&path).unwrap();
            store.record(&ids(&["a"]), "c").unwrap();
            store.record(&ids(&["b"]), "c").unwrap();
        }
        let mut store = JsonlHistoryStore::open(&path).unwrap();
        assert_eq!(store.record(&ids(&["c"]), "c").unwrap(), 3);

        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 3);
        assert_strictly_newest_first(&listed);
        assert_eq!(listed[0].rune_ids, ids(&["c"]));
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.jsonl");
        let mut store = JsonlHistoryStore::open(&path).unwrap();
        store.record(&ids(&["a"]), "c").unwrap();

        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(f, "{{not json").unwrap();
        drop(f);

        store.record(&ids(&["b"]), "c").unwrap();
        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, 2);
    }

    #[test]
    fn missing_file_lists_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlHistoryStore::open(dir.path().join("none.jsonl")).unwrap();
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn memory_store_orders_and_limits() {
        let mut store = MemoryHistoryStore::new();
        for i in 0..5 {
            store.record(&ids(&[&format!("r{i}")]), "c").unwrap();
        }
        let listed = store.list().unwrap();
        assert_strictly_newest_first(&listed);
        let recent = store.load_recent(2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].rune_ids, ids(&["r4"]));
    }

    #[test]
    fn unavailable_store_reports_errors() {
        let mut store = MemoryHistoryStore::unavailable("disk full");
        let err = store.record(&ids(&["a"]), "c").unwrap_err();
        assert!(err.to_string().contains("disk full"));
        assert!(store.list().unwrap().is_empty());
    }
}
