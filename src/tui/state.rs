use super::form::Form;
use crate::model::{BatchOutcome, HistoryEntry, HistoryRecord, RunEvent, StepRef};
use crate::spellbook::{Spellbook, SpellbookEdit};
use ratatui::{
    style::{Color, Style},
    text::{Line, Span},
};

pub const TAB_RUNES: usize = 0;
pub const TAB_LOEGS: usize = 1;
pub const TAB_HISTORY: usize = 2;
pub const TAB_HELP: usize = 3;
pub const TAB_COUNT: usize = 4;

/// Where the current (or last) batch stands, as seen by the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchView {
    Running {
        runes: Vec<String>,
        step: Option<StepRef>,
        command: String,
    },
    Succeeded,
    Failed {
        rune: String,
        command: String,
        message: String,
    },
    Cancelled,
}

pub struct UiState {
    pub tab: usize,
    pub info: String,

    pub rune_names: Vec<String>,
    pub rune_selected: usize,
    /// Runes toggled into the queue, in toggle order.
    pub queue: Vec<String>,

    pub loegs: Vec<(String, String)>,
    pub loeg_selected: usize,

    /// Open editor, with the last error from saving it.
    pub form: Option<Form>,
    pub form_error: Option<String>,
    /// Destructive edit waiting for a second `D`.
    pub pending_delete: Option<SpellbookEdit>,

    pub batch: Option<BatchView>,
    pub last_runes: Vec<String>,
    /// Lines scrolled back from the tail of the output pane.
    pub output_scroll_back: usize,

    pub history: Vec<HistoryEntry>,
    pub history_selected: usize,
    pub history_scroll_offset: usize,
    pub history_load_size: usize,

    pub cancel_notice_shown: bool,
    pub quit_pending: bool,
}

impl Default for UiState {
    fn default() -> Self {
        Self {
            tab: TAB_RUNES,
            info: String::new(),
            rune_names: Vec::new(),
            rune_selected: 0,
            queue: Vec::new(),
            loegs: Vec::new(),
            loeg_selected: 0,
            form: None,
            form_error: None,
            pending_delete: None,
            batch: None,
            last_runes: Vec::new(),
            output_scroll_back: 0,
            history: Vec::new(),
            history_selected: 0,
            history_scroll_offset: 0,
            history_load_size: 50,
            cancel_notice_shown: false,
            quit_pending: false,
        }
    }
}

impl UiState {
    pub fn with_spellbook(book: &Spellbook) -> Self {
        let mut state = Self::default();
        state.set_spellbook(book);
        state
    }

    /// Refresh the rune and loeg lists. Queued runes that no longer exist are
    /// dropped and selections stay in range.
    pub fn set_spellbook(&mut self, book: &Spellbook) {
        self.rune_names = book.runes.iter().map(|r| r.name.clone()).collect();
        let names = &self.rune_names;
        self.queue.retain(|q| names.contains(q));
        self.rune_selected = self.rune_selected.min(names.len().saturating_sub(1));
        self.loegs = book
            .loegs
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        self.loeg_selected = self.loeg_selected.min(self.loegs.len().saturating_sub(1));
    }

    pub fn selected_loeg(&self) -> Option<(&str, &str)> {
        self.loegs
            .get(self.loeg_selected)
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn open_form(&mut self, form: Form) {
        self.form = Some(form);
        self.form_error = None;
    }

    pub fn close_form(&mut self) {
        self.form = None;
        self.form_error = None;
    }

    pub fn selected_rune(&self) -> Option<&str> {
        self.rune_names.get(self.rune_selected).map(String::as_str)
    }

    pub fn selected_history(&self) -> Option<&HistoryEntry> {
        self.history.get(self.history_selected)
    }

    pub fn queue_position(&self, name: &str) -> Option<usize> {
        self.queue.iter().position(|n| n == name)
    }

    pub fn toggle_queued(&mut self, name: &str) {
        match self.queue_position(name) {
            Some(i) => {
                self.queue.remove(i);
            }
            None => self.queue.push(name.to_string()),
        }
    }

    pub fn move_selection(&mut self, down: bool) {
        match self.tab {
            TAB_RUNES => step_index(&mut self.rune_selected, self.rune_names.len(), down),
            TAB_LOEGS => step_index(&mut self.loeg_selected, self.loegs.len(), down),
            TAB_HISTORY => {
                step_index(&mut self.history_selected, self.history.len(), down);
                if self.history_selected < self.history_scroll_offset {
                    self.history_scroll_offset = self.history_selected;
                }
            }
            _ => {}
        }
    }

    pub fn set_history(&mut self, entries: Vec<HistoryEntry>) {
        self.history = entries;
        if self.history_selected >= self.history.len() {
            self.history_selected = self.history.len().saturating_sub(1);
        }
        if self.history_scroll_offset > self.history_selected {
            self.history_scroll_offset = self.history_selected;
        }
    }

    pub fn apply_event(&mut self, ev: &RunEvent) {
        match ev {
            RunEvent::BatchStarted { runes, history } => {
                self.last_runes = runes.clone();
                self.batch = Some(BatchView::Running {
                    runes: runes.clone(),
                    step: None,
                    command: String::new(),
                });
                self.output_scroll_back = 0;
                self.cancel_notice_shown = false;
                self.info = match history {
                    HistoryRecord::Recorded(id) => format!("Running (history #{id})"),
                    HistoryRecord::Failed(reason) => {
                        format!("Running; history not recorded: {reason}")
                    }
                };
            }
            RunEvent::StepStarted { step, command, .. } => {
                if let Some(BatchView::Running {
                    step: s,
                    command: c,
                    ..
                }) = self.batch.as_mut()
                {
                    *s = Some(*step);
                    *c = command.clone();
                }
            }
            RunEvent::StepFinished { error: Some(e), .. } if !e.is_cancellation() => {
                self.info = format!("Step failed: {e}");
            }
            RunEvent::OutputChunk(_) | RunEvent::StepFinished { .. } => {}
            RunEvent::BatchFinished(BatchOutcome::Success) => {
                self.batch = Some(BatchView::Succeeded);
                self.info = "Finished (enter/esc to dismiss)".into();
            }
            RunEvent::BatchFinished(BatchOutcome::Failure(f)) => {
                self.batch = Some(BatchView::Failed {
                    rune: f.rune.clone(),
                    command: f.command.clone(),
                    message: f.error.to_string(),
                });
                self.info = format!("Failed in {}: {}", f.rune, f.error);
            }
            RunEvent::BatchCancelled => {
                self.batch = Some(BatchView::Cancelled);
                self.info = "Cancelled (enter/esc to dismiss)".into();
            }
        }
    }

    pub fn status_line(&self) -> Line<'static> {
        let (label, color) = match &self.batch {
            None => ("idle".to_string(), Color::Gray),
            Some(BatchView::Running { runes, step, command }) => {
                let at = match step {
                    Some(s) => format!(
                        " [{}/{} {}] $ {}",
                        s.batch_index + 1,
                        runes.len(),
                        runes.get(s.batch_index).map(String::as_str).unwrap_or("?"),
                        command
                    ),
                    None => String::new(),
                };
                (format!("running{at}"), Color::Yellow)
            }
            Some(BatchView::Succeeded) => ("success".to_string(), Color::Green),
            Some(BatchView::Failed {
                rune,
                command,
                message,
            }) => (format!("failed: {rune} $ {command}: {message}"), Color::Red),
            // Not a failure; keep it out of red.
            Some(BatchView::Cancelled) => ("cancelled".to_string(), Color::Cyan),
        };
        Line::from(vec![
            Span::raw("Status: "),
            Span::styled(label, Style::default().fg(color)),
        ])
    }
}

fn step_index(index: &mut usize, len: usize, down: bool) {
    if len == 0 {
        *index = 0;
    } else if down {
        *index = (*index + 1).min(len - 1);
    } else {
        *index = index.saturating_sub(1);
    }
}

/// Drop terminal control sequences the output pane cannot render.
pub fn printable(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\x1b' => match chars.next() {
                // CSI: parameters then a final byte in @..~
                Some('[') => {
                    for c in chars.by_ref() {
                        if ('@'..='~').contains(&c) {
                            break;
                        }
                    }
                }
                // OSC: until BEL or ST
                Some(']') => {
                    while let Some(c) = chars.next() {
                        if c == '\x07' {
                            break;
                        }
                        if c == '\x1b' && chars.peek() == Some(&'\\') {
                            chars.next();
                            break;
                        }
                    }
                }
                _ => {}
            },
            '\n' | '\t' => out.push(c),
            '\r' => {}
            c if c.is_control() => {}
            c => out.push(c),
        }
    }
    out
}

/// The window of `rows` lines ending `back` lines before the tail.
pub fn tail_window(text: &str, rows: usize, back: usize) -> Vec<&str> {
    let lines: Vec<&str> = text.lines().collect();
    let end = lines.len().saturating_sub(back);
    let start = end.saturating_sub(rows);
    lines[start..end].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExecError;
    use crate::model::FailedStep;

    #[test]
    fn queue_toggle_keeps_order() {
        let mut s = UiState::default();
        s.toggle_queued("b");
        s.toggle_queued("a");
        s.toggle_queued("c");
        s.toggle_queued("a");
        assert_eq!(s.queue, vec!["b", "c"]);
        assert_eq!(s.queue_position("c"), Some(1));
    }

    #[test]
    fn spellbook_refresh_prunes_queue_and_clamps() {
        let book = Spellbook::from_json(
            r#"{"runes": [{"name": "a"}, {"name": "b"}, {"name": "c"}], "loegs": {"X": "1"}}"#,
        )
        .unwrap();
        let mut s = UiState::with_spellbook(&book);
        s.rune_selected = 2;
        s.toggle_queued("c");
        s.toggle_queued("a");
        assert_eq!(s.selected_loeg(), Some(("X", "1")));

        let smaller = Spellbook::from_json(r#"{"runes": [{"name": "a"}]}"#).unwrap();
        s.set_spellbook(&smaller);
        assert_eq!(s.queue, vec!["a"]);
        assert_eq!(s.selected_rune(), Some("a"));
        assert_eq!(s.selected_loeg(), None);
    }

    #[test]
    fn selection_is_clamped() {
        let mut s = UiState {
            rune_names: vec!["a".into(), "b".into()],
            ..UiState::default()
        };
        s.move_selection(false);
        assert_eq!(s.rune_selected, 0);
        s.move_selection(true);
        s.move_selection(true);
        assert_eq!(s.selected_rune(), Some("b"));
    }

    #[test]
    fn events_drive_the_batch_view() {
        let mut s = UiState::default();
        s.apply_event(&RunEvent::BatchStarted {
            runes: vec!["build".into()],
            history: HistoryRecord::Failed("disk full".into()),
        });
        assert!(s.info.contains("disk full"));
        s.apply_event(&RunEvent::StepStarted {
            step: StepRef::default(),
            rune: "build".into(),
            command: "make".into(),
        });
        assert!(matches!(s.batch, Some(BatchView::Running { ref command, .. }) if command == "make"));

        s.apply_event(&RunEvent::BatchFinished(BatchOutcome::Failure(FailedStep {
            step: StepRef::default(),
            rune: "build".into(),
            command: "make".into(),
            error: ExecError::Exit {
                code: Some(2),
                signal: None,
            },
        })));
        assert!(matches!(s.batch, Some(BatchView::Failed { .. })));

        s.apply_event(&RunEvent::BatchCancelled);
        assert_eq!(s.batch, Some(BatchView::Cancelled));
    }

    #[test]
    fn printable_strips_escapes() {
        assert_eq!(
            printable("\x1b[1;32mok\x1b[0m\r\n\x1b]0;title\x07done\x1b]2;t\x1b\\!"),
            "ok\ndone!"
        );
    }

    #[test]
    fn tail_window_scrolls_back() {
        let text = "1\n2\n3\n4\n5\n";
        assert_eq!(tail_window(text, 2, 0), vec!["4", "5"]);
        assert_eq!(tail_window(text, 2, 1), vec!["3", "4"]);
        assert_eq!(tail_window(text, 10, 0).len(), 5);
        assert!(tail_window(text, 2, 9).is_empty());
    }
}
