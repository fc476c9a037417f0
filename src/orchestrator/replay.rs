//! Turning rune names (typed by the user or read back from history) into a
//! runnable batch.

use crate::error::OrchestratorError;
use crate::model::{ExecutionBatch, HistoryEntry};
use crate::spellbook::Spellbook;
use tracing::warn;

/// Resolve names against the loaded spellbook. Fails on the first unknown name
/// so a partial batch never runs.
pub fn resolve_batch(
    spellbook: &Spellbook,
    names: &[String],
) -> Result<ExecutionBatch, OrchestratorError> {
    if names.is_empty() {
        return Err(OrchestratorError::EmptyBatch);
    }
    let runes = names
        .iter()
        .map(|name| {
            spellbook
                .find(name)
                .cloned()
                .ok_or_else(|| OrchestratorError::UnknownRune(name.clone()))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ExecutionBatch::new(runes))
}

/// Rebuild the batch a history entry recorded.
pub fn batch_for_entry(
    spellbook: &Spellbook,
    entry: &HistoryEntry,
    collection_id: &str,
) -> Result<ExecutionBatch, OrchestratorError> {
    if entry.collection_id != collection_id {
        warn!(
            entry = entry.id,
            recorded = %entry.collection_id,
            current = collection_id,
            "replaying entry from another collection"
        );
    }
    resolve_batch(spellbook, &entry.rune_ids).inspect_err(|e| {
        warn!(entry = entry.id, error = %e, "rune from history not found");
    })
}
