//! Rune collections ("spellbooks") and where they come from.

use crate::error::EditError;
use crate::model::Rune;
use crate::remote::{backend_command, CommandLine, RemoteClient};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{info, warn};

/// The runes of one collection plus the variables ("loegs") exported to
/// every command run from it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Spellbook {
    #[serde(default)]
    pub runes: Vec<Rune>,
    #[serde(default)]
    pub loegs: BTreeMap<String, String>,
}

impl Spellbook {
    pub fn find(&self, name: &str) -> Option<&Rune> {
        self.runes.iter().find(|r| r.name == name)
    }

    pub fn env(&self) -> Vec<(String, String)> {
        self.loegs
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("parse spellbook JSON")
    }
}

#[derive(Debug, Clone)]
pub enum SpellbookSource {
    Remote(RemoteClient),
    File(PathBuf),
}

impl SpellbookSource {
    pub fn describe(&self) -> String {
        match self {
            SpellbookSource::Remote(client) => format!("ssh://{}", client.host()),
            SpellbookSource::File(path) => path.display().to_string(),
        }
    }

    /// Load the spellbook for `collection_id`. A remote collection that does not
    /// exist yet is created.
    pub fn load(&self, collection_id: &str) -> Result<Spellbook> {
        match self {
            SpellbookSource::File(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("read spellbook {}", path.display()))?;
                Spellbook::from_json(&text)
            }
            SpellbookSource::Remote(client) => {
                let fetch = backend_command("get-spellbook-content", &[collection_id]);
                match client.command(&fetch) {
                    Ok(json) => Spellbook::from_json(&json),
                    Err(e) => {
                        warn!(error = %e, collection = collection_id, "spellbook fetch failed; creating");
                        let create = backend_command("create-spellbook", &[collection_id]);
                        let json = client
                            .command(&create)
                            .context("create spellbook on backend")?;
                        info!(collection = collection_id, "spellbook created");
                        Spellbook::from_json(&json).context("parse created spellbook")
                    }
                }
            }
        }
    }

    /// Apply `edit` to the collection and return the spellbook as stored
    /// afterwards. `current` is what the caller last loaded.
    pub fn edit(
        &self,
        collection_id: &str,
        current: &Spellbook,
        edit: &SpellbookEdit,
    ) -> Result<Spellbook> {
        match self {
            SpellbookSource::File(path) => {
                let mut book = current.clone();
                if book.apply(edit)? {
                    let json = serde_json::to_string_pretty(&book).context("encode spellbook")?;
                    std::fs::write(path, json + "\n")
                        .with_context(|| format!("write spellbook {}", path.display()))?;
                    info!(path = %path.display(), "{}", edit.describe());
                }
                Ok(book)
            }
            SpellbookSource::Remote(client) => {
                if let Some(line) = edit.backend_command(current, collection_id)? {
                    client
                        .command(&line)
                        .with_context(|| format!("{} on backend", edit.describe()))?;
                    info!(collection = collection_id, "{}", edit.describe());
                }
                self.load(collection_id)
            }
        }
    }
}

/// A rune as typed into the editor. Blank command lines are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuneDraft {
    pub name: String,
    pub description: String,
    pub commands: Vec<String>,
}

impl RuneDraft {
    fn name(&self) -> &str {
        self.name.trim()
    }

    fn description(&self) -> &str {
        self.description.trim()
    }

    fn commands(&self) -> Vec<String> {
        self.commands
            .iter()
            .map(|c| c.trim())
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// One change to a collection's runes or loegs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpellbookEdit {
    CreateRune(RuneDraft),
    /// Blank draft fields keep the current value.
    UpdateRune { original: String, draft: RuneDraft },
    DeleteRune(String),
    /// Creates the loeg or replaces its value.
    SetLoeg { key: String, value: String },
    RemoveLoeg(String),
}

/// Fields of an update that differ from the stored rune.
#[derive(Debug, Default, PartialEq, Eq)]
struct RuneChanges {
    name: Option<String>,
    description: Option<String>,
    commands: Option<Vec<String>>,
}

impl RuneChanges {
    fn is_empty(&self) -> bool {
        self.name.is_none() && self.description.is_none() && self.commands.is_none()
    }
}

impl SpellbookEdit {
    pub fn describe(&self) -> String {
        match self {
            SpellbookEdit::CreateRune(d) => format!("created rune `{}`", d.name()),
            SpellbookEdit::UpdateRune { original, .. } => format!("updated rune `{original}`"),
            SpellbookEdit::DeleteRune(name) => format!("deleted rune `{name}`"),
            SpellbookEdit::SetLoeg { key, .. } => format!("set loeg {}", key.trim()),
            SpellbookEdit::RemoveLoeg(key) => format!("removed loeg {key}"),
        }
    }

    /// The backend command for this edit against `book`, or `None` when the
    /// edit changes nothing.
    pub fn backend_command(
        &self,
        book: &Spellbook,
        collection_id: &str,
    ) -> Result<Option<String>, EditError> {
        let line = match self {
            SpellbookEdit::CreateRune(draft) => {
                let (name, description, commands) = validate_new_rune(book, draft)?;
                CommandLine::new("create-rune")
                    .arg(collection_id)
                    .flag("name", name)
                    .flag("desc", description)
                    .flag("cmds", &commands.join(";"))
            }
            SpellbookEdit::UpdateRune { original, draft } => {
                let changes = rune_changes(book, original, draft)?;
                if changes.is_empty() {
                    return Ok(None);
                }
                let mut line = CommandLine::new("update-rune")
                    .arg(collection_id)
                    .arg(original);
                if let Some(name) = &changes.name {
                    line = line.flag("name", name);
                }
                if let Some(description) = &changes.description {
                    line = line.flag("desc", description);
                }
                if let Some(commands) = &changes.commands {
                    line = line.flag("cmds", &commands.join(";"));
                }
                line
            }
            SpellbookEdit::DeleteRune(name) => {
                book.find(name)
                    .ok_or_else(|| EditError::UnknownRune(name.clone()))?;
                CommandLine::new("delete-rune").arg(collection_id).arg(name)
            }
            SpellbookEdit::SetLoeg { key, value } => {
                let key = validate_loeg(key, value)?;
                CommandLine::new("loeg set")
                    .arg(collection_id)
                    .assignment(key, value)
            }
            SpellbookEdit::RemoveLoeg(key) => {
                if !book.loegs.contains_key(key) {
                    return Err(EditError::UnknownLoeg(key.clone()));
                }
                CommandLine::new("loeg rm").arg(collection_id).arg(key)
            }
        };
        Ok(Some(line.into_string()))
    }
}

impl Spellbook {
    /// Apply `edit` in place. Returns `false` when nothing changed.
    pub fn apply(&mut self, edit: &SpellbookEdit) -> Result<bool, EditError> {
        match edit {
            SpellbookEdit::CreateRune(draft) => {
                let (name, description, commands) = validate_new_rune(self, draft)?;
                self.runes.push(Rune {
                    name: name.to_string(),
                    description: description.to_string(),
                    commands,
                });
            }
            SpellbookEdit::UpdateRune { original, draft } => {
                let changes = rune_changes(self, original, draft)?;
                if changes.is_empty() {
                    return Ok(false);
                }
                let rune = self
                    .runes
                    .iter_mut()
                    .find(|r| &r.name == original)
                    .ok_or_else(|| EditError::UnknownRune(original.clone()))?;
                if let Some(name) = changes.name {
                    rune.name = name;
                }
                if let Some(description) = changes.description {
                    rune.description = description;
                }
                if let Some(commands) = changes.commands {
                    rune.commands = commands;
                }
            }
            SpellbookEdit::DeleteRune(name) => {
                let before = self.runes.len();
                self.runes.retain(|r| &r.name != name);
                if self.runes.len() == before {
                    return Err(EditError::UnknownRune(name.clone()));
                }
            }
            SpellbookEdit::SetLoeg { key, value } => {
                let key = validate_loeg(key, value)?;
                self.loegs.insert(key.to_string(), value.clone());
            }
            SpellbookEdit::RemoveLoeg(key) => {
                if self.loegs.remove(key).is_none() {
                    return Err(EditError::UnknownLoeg(key.clone()));
                }
            }
        }
        Ok(true)
    }
}

fn validate_new_rune<'a>(
    book: &Spellbook,
    draft: &'a RuneDraft,
) -> Result<(&'a str, &'a str, Vec<String>), EditError> {
    let name = draft.name();
    if name.is_empty() {
        return Err(EditError::Missing("name"));
    }
    if draft.description().is_empty() {
        return Err(EditError::Missing("description"));
    }
    let commands = draft.commands();
    if commands.is_empty() {
        return Err(EditError::Missing("at least one command"));
    }
    if book.find(name).is_some() {
        return Err(EditError::DuplicateRune(name.to_string()));
    }
    Ok((name, draft.description(), commands))
}

fn rune_changes(
    book: &Spellbook,
    original: &str,
    draft: &RuneDraft,
) -> Result<RuneChanges, EditError> {
    let rune = book
        .find(original)
        .ok_or_else(|| EditError::UnknownRune(original.to_string()))?;
    let mut changes = RuneChanges::default();

    let name = draft.name();
    if !name.is_empty() && name != rune.name {
        if book.find(name).is_some() {
            return Err(EditError::DuplicateRune(name.to_string()));
        }
        changes.name = Some(name.to_string());
    }
    let description = draft.description();
    if !description.is_empty() && description != rune.description {
        changes.description = Some(description.to_string());
    }
    let commands = draft.commands();
    if !commands.is_empty() && commands != rune.commands {
        changes.commands = Some(commands);
    }
    Ok(changes)
}

fn validate_loeg<'a>(key: &'a str, value: &str) -> Result<&'a str, EditError> {
    let key = key.trim();
    if key.is_empty() {
        return Err(EditError::Missing("key"));
    }
    if value.is_empty() {
        return Err(EditError::Missing("value"));
    }
    let mut chars = key.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if !valid_start || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(EditError::InvalidLoegKey(key.to_string()));
    }
    Ok(key)
}
