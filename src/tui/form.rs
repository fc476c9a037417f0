//! Modal editor for runes and loegs.

use crate::model::Rune;
use crate::spellbook::{RuneDraft, SpellbookEdit};
use ratatui::{
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Clear, Paragraph},
    Frame,
};

/// Fields before the first command in a rune form.
const RUNE_HEADER_FIELDS: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormKind {
    NewRune,
    EditRune { original: String },
    SetLoeg,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub label: String,
    pub value: String,
}

impl Field {
    fn new(label: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Form {
    pub kind: FormKind,
    pub fields: Vec<Field>,
    pub focus: usize,
}

impl Form {
    pub fn new_rune() -> Self {
        Self {
            kind: FormKind::NewRune,
            fields: vec![
                Field::new("Name", ""),
                Field::new("Description", ""),
                Field::new("Command 1", ""),
            ],
            focus: 0,
        }
    }

    pub fn edit_rune(rune: &Rune) -> Self {
        let mut fields = vec![
            Field::new("Name", rune.name.clone()),
            Field::new("Description", rune.description.clone()),
        ];
        fields.extend(
            rune.commands
                .iter()
                .enumerate()
                .map(|(i, c)| Field::new(format!("Command {}", i + 1), c.clone())),
        );
        let mut form = Self {
            kind: FormKind::EditRune {
                original: rune.name.clone(),
            },
            fields,
            focus: 0,
        };
        form.grow();
        form
    }

    /// Empty form, or one pre-filled with an existing loeg.
    pub fn set_loeg(existing: Option<(&str, &str)>) -> Self {
        let (key, value) = existing.unwrap_or(("", ""));
        Self {
            kind: FormKind::SetLoeg,
            fields: vec![Field::new("Key", key), Field::new("Value", value)],
            focus: if existing.is_some() { 1 } else { 0 },
        }
    }

    pub fn title(&self) -> String {
        match &self.kind {
            FormKind::NewRune => "New rune".into(),
            FormKind::EditRune { original } => format!("Edit rune `{original}`"),
            FormKind::SetLoeg => "Set loeg".into(),
        }
    }

    pub fn next(&mut self) {
        self.focus = (self.focus + 1) % self.fields.len();
    }

    pub fn prev(&mut self) {
        self.focus = self.focus.checked_sub(1).unwrap_or(self.fields.len() - 1);
    }

    pub fn input(&mut self, c: char) {
        if let Some(field) = self.fields.get_mut(self.focus) {
            field.value.push(c);
        }
        self.grow();
    }

    pub fn backspace(&mut self) {
        if let Some(field) = self.fields.get_mut(self.focus) {
            field.value.pop();
        }
    }

    /// Rune forms always end with one empty command line.
    fn grow(&mut self) {
        if self.kind == FormKind::SetLoeg {
            return;
        }
        let last_filled = self
            .fields
            .last()
            .is_some_and(|f| !f.value.is_empty());
        if self.fields.len() <= RUNE_HEADER_FIELDS || last_filled {
            let n = self.fields.len() - RUNE_HEADER_FIELDS + 1;
            self.fields.push(Field::new(format!("Command {n}"), ""));
        }
    }

    fn value(&self, index: usize) -> String {
        self.fields
            .get(index)
            .map(|f| f.value.clone())
            .unwrap_or_default()
    }

    pub fn to_edit(&self) -> SpellbookEdit {
        match &self.kind {
            FormKind::SetLoeg => SpellbookEdit::SetLoeg {
                key: self.value(0),
                value: self.value(1),
            },
            kind => {
                let draft = RuneDraft {
                    name: self.value(0),
                    description: self.value(1),
                    commands: self
                        .fields
                        .iter()
                        .skip(RUNE_HEADER_FIELDS)
                        .map(|f| f.value.clone())
                        .collect(),
                };
                match kind {
                    FormKind::EditRune { original } => SpellbookEdit::UpdateRune {
                        original: original.clone(),
                        draft,
                    },
                    _ => SpellbookEdit::CreateRune(draft),
                }
            }
        }
    }
}

fn centered(area: Rect, width_pct: u16, height: u16) -> Rect {
    let vertical = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Min(0),
            Constraint::Length(height.min(area.height)),
            Constraint::Min(0),
        ])
        .split(area);
    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - width_pct) / 2),
            Constraint::Percentage(width_pct),
            Constraint::Percentage((100 - width_pct) / 2),
        ])
        .split(vertical[1])[1]
}

pub fn draw_form(area: Rect, f: &mut Frame, form: &Form, error: Option<&str>) {
    let mut lines: Vec<Line> = form
        .fields
        .iter()
        .enumerate()
        .map(|(i, field)| {
            let focused = i == form.focus;
            let label_style = if focused {
                Style::default()
                    .fg(Color::Yellow)
                    .add_modifier(Modifier::BOLD)
            } else {
                Style::default().fg(Color::Magenta)
            };
            let cursor = if focused { "█" } else { "" };
            Line::from(vec![
                Span::styled(format!("{:<13}", field.label), label_style),
                Span::raw(format!("{}{cursor}", field.value)),
            ])
        })
        .collect();
    lines.push(Line::from(""));
    if let Some(err) = error {
        lines.push(Line::from(Span::styled(
            err.to_string(),
            Style::default().fg(Color::Red),
        )));
    }
    lines.push(Line::from(Span::styled(
        "tab/↑/↓: field  enter: save  esc: cancel",
        Style::default().fg(Color::DarkGray),
    )));

    let height = lines.len() as u16 + 2;
    let rect = centered(area, 70, height);
    f.render_widget(Clear, rect);
    f.render_widget(
        Paragraph::new(lines).block(
            Block::default()
                .borders(Borders::ALL)
                .title(form.title()),
        ),
        rect,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn type_text(form: &mut Form, text: &str) {
        for c in text.chars() {
            form.input(c);
        }
    }

    #[test]
    fn rune_form_grows_a_command_line_as_you_type() {
        let mut form = Form::new_rune();
        type_text(&mut form, "deploy");
        form.next();
        type_text(&mut form, "ship");
        form.next();
        assert_eq!(form.fields.len(), 3);
        type_text(&mut form, "make");
        assert_eq!(form.fields.len(), 4);
        assert_eq!(form.fields[3].label, "Command 2");

        assert_eq!(
            form.to_edit(),
            SpellbookEdit::CreateRune(RuneDraft {
                name: "deploy".into(),
                description: "ship".into(),
                commands: vec!["make".into(), String::new()],
            })
        );
    }

    #[test]
    fn edit_form_is_prefilled() {
        let mut rune = Rune::new("build", &["cargo build"]);
        rune.description = "compile".into();
        let mut form = Form::edit_rune(&rune);
        let labels: Vec<&str> = form.fields.iter().map(|f| f.label.as_str()).collect();
        assert_eq!(labels, vec!["Name", "Description", "Command 1", "Command 2"]);

        form.backspace();
        form.backspace();
        assert_eq!(form.fields[0].value, "bui");
        match form.to_edit() {
            SpellbookEdit::UpdateRune { original, draft } => {
                assert_eq!(original, "build");
                assert_eq!(draft.name, "bui");
                assert_eq!(draft.commands, vec!["cargo build".to_string(), String::new()]);
            }
            other => panic!("unexpected edit {other:?}"),
        }
    }

    #[test]
    fn loeg_form_focus_wraps() {
        let mut form = Form::set_loeg(Some(("PORT", "80")));
        assert_eq!(form.focus, 1);
        form.next();
        assert_eq!(form.focus, 0);
        form.prev();
        assert_eq!(form.focus, 1);
        type_text(&mut form, "80");
        assert_eq!(form.fields.len(), 2);
        assert_eq!(
            form.to_edit(),
            SpellbookEdit::SetLoeg {
                key: "PORT".into(),
                value: "8080".into()
            }
        );
    }
}
