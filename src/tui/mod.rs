mod export;
mod form;
mod help;
mod state;

use crate::cli::Settings;
use crate::model::RunEvent;
use crate::orchestrator::{Intent, Orchestrator, Phase};
use crate::spellbook::{Spellbook, SpellbookEdit};
use anyhow::{Context, Result};
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph, Tabs, Wrap},
    Terminal,
};
use form::Form;
use state::{
    printable, tail_window, BatchView, UiState, TAB_COUNT, TAB_HELP, TAB_HISTORY, TAB_LOEGS,
    TAB_RUNES,
};
use std::{io, time::Duration, time::Instant};

pub(crate) async fn run(orchestrator: Orchestrator, settings: Settings) -> Result<()> {
    // TUI runs in a dedicated thread to keep all blocking I/O out of the Tokio runtime.
    // That thread is the only owner of the orchestrator and drives it cooperatively.
    let ui_handle = std::thread::spawn(move || run_threaded(orchestrator, settings));

    match tokio::task::spawn_blocking(move || ui_handle.join()).await {
        Ok(Ok(res)) => res,
        Ok(Err(_)) => Err(anyhow::anyhow!("TUI thread panicked")),
        Err(e) => Err(anyhow::anyhow!("TUI join failed: {e}")),
    }
}

/// Run the TUI loop on a dedicated thread.
fn run_threaded(mut orch: Orchestrator, settings: Settings) -> Result<()> {
    enable_raw_mode().context("enable raw mode")?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen).ok();

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend).context("create terminal")?;
    terminal.clear().ok();

    let mut state = UiState::with_spellbook(orch.spellbook());
    state.history_load_size = terminal
        .size()
        .map(|size| ((size.height as usize).saturating_sub(2) * 3).max(20))
        .unwrap_or(66);
    reload_history(&orch, &mut state);
    state.info = format!(
        "{} rune(s) in {}",
        state.rune_names.len(),
        orch.collection_id()
    );

    let tick_rate = Duration::from_millis(100);
    let mut last_tick = Instant::now();

    let res = loop {
        // Drain relay events without blocking; poll() bounds the work per pass.
        let events = orch.poll();
        apply_events(&orch, &mut state, events);

        if let Some(waited) = orch.state().cancelling_for() {
            if waited >= settings.config.cancel_notice_after && !state.cancel_notice_shown {
                state.info = "Still cancelling…".into();
                state.cancel_notice_shown = true;
            }
        }

        // Quit waits for the cancelled batch to settle so no process outlives the UI.
        if state.quit_pending && !orch.is_active() {
            break Ok(());
        }

        if last_tick.elapsed() >= tick_rate {
            terminal.draw(|f| draw(f.area(), f, &state, &orch)).ok();
            last_tick = Instant::now();
        }

        // Poll input with a short timeout to avoid blocking the render loop.
        if event::poll(Duration::from_millis(10)).unwrap_or(false) {
            if let Ok(Event::Key(k)) = event::read() {
                if k.kind != KeyEventKind::Press {
                    continue;
                }
                if handle_key(&mut orch, &mut state, &settings, k) {
                    break Ok(());
                }
            }
        }
    };

    disable_raw_mode().ok();
    let mut stdout = io::stdout();
    execute!(stdout, LeaveAlternateScreen).ok();
    res
}

fn apply_events(orch: &Orchestrator, state: &mut UiState, events: Vec<RunEvent>) {
    for ev in &events {
        state.apply_event(ev);
        if matches!(ev, RunEvent::BatchStarted { .. }) {
            reload_history(orch, state);
        }
    }
}

fn reload_history(orch: &Orchestrator, state: &mut UiState) {
    match orch.recent_history(state.history_load_size) {
        Ok(entries) => state.set_history(entries),
        Err(e) => state.info = format!("History unavailable: {e}"),
    }
}

/// Submit a run intent, dismissing a finished batch first.
fn submit(orch: &mut Orchestrator, state: &mut UiState, intent: Intent) {
    if orch.phase().is_terminal() {
        acknowledge(orch, state);
    }
    match orch.handle(intent) {
        Ok(events) => apply_events(orch, state, events),
        Err(e) => state.info = e.to_string(),
    }
}

fn replay_selected(orch: &mut Orchestrator, state: &mut UiState) {
    let Some(entry) = state.selected_history().cloned() else {
        state.info = "No history entry selected".into();
        return;
    };
    if orch.phase().is_terminal() {
        acknowledge(orch, state);
    }
    match orch.replay(&entry) {
        Ok(events) => {
            state.tab = TAB_RUNES;
            apply_events(orch, state, events);
        }
        Err(e) => state.info = format!("Replay #{}: {e}", entry.id),
    }
}

fn acknowledge(orch: &mut Orchestrator, state: &mut UiState) {
    match orch.handle(Intent::Acknowledge) {
        Ok(_) => {
            state.batch = None;
            state.info.clear();
        }
        Err(e) => state.info = e.to_string(),
    }
}

fn reload_spellbook(orch: &mut Orchestrator, state: &mut UiState, settings: &Settings) {
    if orch.is_active() {
        state.info = "Cannot reload while a batch is running".into();
        return;
    }
    let book = match settings.source.load(&settings.collection_id) {
        Ok(book) => book,
        Err(e) => {
            state.info = format!("Reload failed: {e:#}");
            return;
        }
    };
    let count = book.runes.len();
    if install_spellbook(orch, state, book) {
        state.info = format!("Reloaded {count} rune(s)");
    }
}

fn install_spellbook(orch: &mut Orchestrator, state: &mut UiState, book: Spellbook) -> bool {
    match orch.set_spellbook(book) {
        Ok(()) => {
            state.set_spellbook(orch.spellbook());
            true
        }
        Err(e) => {
            state.info = e.to_string();
            false
        }
    }
}

/// Send an edit to the spellbook source and show the stored result.
fn apply_edit(
    orch: &mut Orchestrator,
    state: &mut UiState,
    settings: &Settings,
    edit: &SpellbookEdit,
) -> Result<()> {
    if orch.is_active() {
        anyhow::bail!("cannot edit runes while a batch is running");
    }
    let book = settings
        .source
        .edit(&settings.collection_id, orch.spellbook(), edit)?;
    if install_spellbook(orch, state, book) {
        state.info = format!("✓ {}", edit.describe());
    }
    Ok(())
}

fn handle_form_key(
    orch: &mut Orchestrator,
    state: &mut UiState,
    settings: &Settings,
    k: KeyEvent,
) {
    let Some(form) = state.form.as_mut() else {
        return;
    };
    match (k.modifiers, k.code) {
        (_, KeyCode::Esc) | (KeyModifiers::CONTROL, KeyCode::Char('c')) => state.close_form(),
        (_, KeyCode::Tab) | (_, KeyCode::Down) => form.next(),
        (_, KeyCode::BackTab) | (_, KeyCode::Up) => form.prev(),
        (_, KeyCode::Backspace) => form.backspace(),
        (_, KeyCode::Enter) => {
            let edit = form.to_edit();
            match apply_edit(orch, state, settings, &edit) {
                Ok(()) => state.close_form(),
                Err(e) => state.form_error = Some(format!("{e:#}")),
            }
        }
        (m, KeyCode::Char(c)) if !m.contains(KeyModifiers::CONTROL) => form.input(c),
        _ => {}
    }
}

/// `D` twice deletes; the first press only asks.
fn confirm_delete(
    orch: &mut Orchestrator,
    state: &mut UiState,
    settings: &Settings,
    edit: SpellbookEdit,
) {
    if state.pending_delete.as_ref() == Some(&edit) {
        state.pending_delete = None;
        if let Err(e) = apply_edit(orch, state, settings, &edit) {
            state.info = format!("Edit failed: {e:#}");
        }
    } else {
        state.info = match &edit {
            SpellbookEdit::DeleteRune(name) => format!("Press D again to delete rune `{name}`"),
            SpellbookEdit::RemoveLoeg(key) => format!("Press D again to remove loeg {key}"),
            _ => String::new(),
        };
        state.pending_delete = Some(edit);
    }
}

/// Returns `true` when the UI should exit immediately.
fn handle_key(
    orch: &mut Orchestrator,
    state: &mut UiState,
    settings: &Settings,
    k: KeyEvent,
) -> bool {
    if state.form.is_some() {
        handle_form_key(orch, state, settings, k);
        return false;
    }
    if k.code != KeyCode::Char('D') {
        state.pending_delete = None;
    }
    match (k.modifiers, k.code) {
        (_, KeyCode::Char('q')) | (KeyModifiers::CONTROL, KeyCode::Char('c')) => {
            if !orch.is_active() {
                return true;
            }
            state.quit_pending = true;
            state.info = "Cancelling…".into();
            let _ = orch.handle(Intent::Cancel);
        }
        (_, KeyCode::Tab) => state.tab = (state.tab + 1) % TAB_COUNT,
        (_, KeyCode::Char('?')) => state.tab = TAB_HELP,
        (_, KeyCode::Up) | (_, KeyCode::Char('k')) => state.move_selection(false),
        (_, KeyCode::Down) | (_, KeyCode::Char('j')) => state.move_selection(true),
        (_, KeyCode::Enter) => match state.tab {
            TAB_RUNES if orch.phase().is_terminal() => acknowledge(orch, state),
            TAB_RUNES => match state.selected_rune().map(str::to_string) {
                Some(name) => submit(orch, state, Intent::RunRune(name)),
                None => state.info = "No runes in this collection".into(),
            },
            TAB_LOEGS => {
                if let Some(loeg) = state.selected_loeg() {
                    let form = Form::set_loeg(Some(loeg));
                    state.open_form(form);
                }
            }
            TAB_HISTORY => replay_selected(orch, state),
            _ => {}
        },
        (_, KeyCode::Esc) => {
            if orch.phase().is_terminal() {
                acknowledge(orch, state);
            }
        }
        (_, KeyCode::Char(' ')) if state.tab == TAB_RUNES => {
            if let Some(name) = state.selected_rune().map(str::to_string) {
                state.toggle_queued(&name);
            }
        }
        (_, KeyCode::Char('r')) if state.tab == TAB_RUNES => {
            if state.queue.is_empty() {
                state.info = "Queue is empty (space adds runes)".into();
            } else {
                let queue = state.queue.clone();
                submit(orch, state, Intent::RunQueue(queue));
            }
        }
        (_, KeyCode::Char('c')) if state.tab == TAB_RUNES => {
            state.queue.clear();
            state.info = "Queue cleared".into();
        }
        (_, KeyCode::Char('x')) => {
            if orch.phase() == &Phase::Running {
                let _ = orch.handle(Intent::Cancel);
                state.info = "Cancelling…".into();
            }
        }
        (_, KeyCode::PageUp) => state.output_scroll_back += 10,
        (_, KeyCode::PageDown) => {
            state.output_scroll_back = state.output_scroll_back.saturating_sub(10)
        }
        (_, KeyCode::Char('y')) => {
            if orch.output().is_empty() {
                state.info = "No output to copy yet".into();
            } else {
                state.info = match export::copy_to_clipboard(orch.output()) {
                    Ok(()) => "✓ Output copied to clipboard".into(),
                    Err(e) => format!("Clipboard copy failed: {e:#}"),
                };
            }
        }
        (_, KeyCode::Char('s')) => {
            if orch.output().is_empty() {
                state.info = "No output to save yet".into();
            } else {
                let saved = std::env::current_dir()
                    .context("get current directory")
                    .and_then(|dir| export::save_output(&dir, &state.last_runes, orch.output()));
                state.info = match saved {
                    Ok(p) => format!("Saved: {}", p.display()),
                    Err(e) => format!("Save failed: {e:#}"),
                };
            }
        }
        (_, KeyCode::Char('L')) if state.tab == TAB_RUNES => reload_spellbook(orch, state, settings),
        (_, KeyCode::Char('n')) if state.tab == TAB_RUNES => state.open_form(Form::new_rune()),
        (_, KeyCode::Char('e')) if state.tab == TAB_RUNES => {
            match state.selected_rune().and_then(|n| orch.spellbook().find(n)) {
                Some(rune) => {
                    let form = Form::edit_rune(rune);
                    state.open_form(form);
                }
                None => state.info = "No rune selected".into(),
            }
        }
        (_, KeyCode::Char('D')) if state.tab == TAB_RUNES => {
            if let Some(name) = state.selected_rune().map(str::to_string) {
                confirm_delete(orch, state, settings, SpellbookEdit::DeleteRune(name));
            }
        }
        (_, KeyCode::Char('n')) if state.tab == TAB_LOEGS => state.open_form(Form::set_loeg(None)),
        (_, KeyCode::Char('e')) if state.tab == TAB_LOEGS => {
            let form = state.selected_loeg().map(|loeg| Form::set_loeg(Some(loeg)));
            match form {
                Some(form) => state.open_form(form),
                None => state.info = "No loeg selected".into(),
            }
        }
        (_, KeyCode::Char('D')) if state.tab == TAB_LOEGS => {
            if let Some((key, _)) = state.selected_loeg() {
                let edit = SpellbookEdit::RemoveLoeg(key.to_string());
                confirm_delete(orch, state, settings, edit);
            }
        }
        (_, KeyCode::Char('R')) if state.tab == TAB_HISTORY => {
            let before = state.history.len();
            reload_history(orch, state);
            let added = state.history.len().saturating_sub(before);
            state.info = if added > 0 {
                format!("Refreshed: {added} new batch(es)")
            } else {
                "Refreshed".into()
            };
        }
        _ => {}
    }
    false
}

fn draw(area: Rect, f: &mut ratatui::Frame, state: &UiState, orch: &Orchestrator) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(3), Constraint::Min(0)].as_ref())
        .split(area);

    let tabs = Tabs::new(vec![
        Line::from("Runes"),
        Line::from("Loegs"),
        Line::from("History"),
        Line::from("Help"),
    ])
    .select(state.tab)
    .block(Block::default().borders(Borders::ALL).title("catalyst"))
    .highlight_style(Style::default().fg(Color::Yellow));
    f.render_widget(tabs, chunks[0]);

    match state.tab {
        TAB_RUNES => draw_runes(chunks[1], f, state, orch),
        TAB_LOEGS => draw_loegs(chunks[1], f, state),
        TAB_HISTORY => draw_history(chunks[1], f, state),
        _ => help::draw_help(chunks[1], f),
    }

    if let Some(open) = &state.form {
        form::draw_form(area, f, open, state.form_error.as_deref());
    }
}

fn draw_loegs(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let mut lines: Vec<Line> = vec![Line::from(vec![
        Span::raw("Exported to every command - "),
        Span::styled("n", Style::default().fg(Color::Magenta)),
        Span::raw(": new, "),
        Span::styled("e/enter", Style::default().fg(Color::Magenta)),
        Span::raw(": edit, "),
        Span::styled("D", Style::default().fg(Color::Magenta)),
        Span::raw(": remove"),
    ])];
    if !state.info.is_empty() {
        lines.push(Line::from(Span::styled(
            format!("Info: {}", state.info),
            Style::default().fg(Color::Gray),
        )));
    }
    if state.loegs.is_empty() {
        lines.push(Line::from("No loegs in this collection."));
    }
    for (i, (key, value)) in state.loegs.iter().enumerate() {
        let style = if i == state.loeg_selected {
            Style::default().fg(Color::Black).bg(Color::Cyan)
        } else {
            Style::default()
        };
        lines.push(Line::from(vec![
            Span::styled(key.clone(), style),
            Span::styled(format!(" = {value}"), Style::default().fg(Color::Gray)),
        ]));
    }
    f.render_widget(
        Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title("Loegs")),
        area,
    );
}

fn draw_runes(area: Rect, f: &mut ratatui::Frame, state: &UiState, orch: &Orchestrator) {
    let columns = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(30), Constraint::Percentage(70)].as_ref())
        .split(area);
    let left = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(3), Constraint::Length(8)].as_ref())
        .split(columns[0]);
    let right = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(3), Constraint::Length(4)].as_ref())
        .split(columns[1]);

    // Rune list with queue positions.
    let list_rows = left[0].height.saturating_sub(2) as usize;
    let first = state.rune_selected.saturating_sub(list_rows.saturating_sub(1));
    let lines: Vec<Line> = state
        .rune_names
        .iter()
        .enumerate()
        .skip(first)
        .take(list_rows.max(1))
        .map(|(i, name)| {
            let marker = match state.queue_position(name) {
                Some(p) => format!("[{}] ", p + 1),
                None => "    ".to_string(),
            };
            let style = if i == state.rune_selected {
                Style::default().fg(Color::Black).bg(Color::Cyan)
            } else {
                Style::default()
            };
            Line::from(vec![
                Span::styled(marker, Style::default().fg(Color::Magenta)),
                Span::styled(name.clone(), style),
            ])
        })
        .collect();
    let title = if state.queue.is_empty() {
        "Runes".to_string()
    } else {
        format!("Runes (queue: {})", state.queue.len())
    };
    f.render_widget(
        Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title(title)),
        left[0],
    );

    // Selected rune details.
    let mut detail: Vec<Line> = Vec::new();
    if let Some(rune) = state.selected_rune().and_then(|n| orch.spellbook().find(n)) {
        if !rune.description.is_empty() {
            detail.push(Line::from(Span::styled(
                rune.description.clone(),
                Style::default().add_modifier(Modifier::ITALIC),
            )));
        }
        for cmd in &rune.commands {
            detail.push(Line::from(vec![
                Span::styled("$ ", Style::default().fg(Color::DarkGray)),
                Span::raw(cmd.clone()),
            ]));
        }
        if rune.commands.is_empty() {
            detail.push(Line::from("(no commands)"));
        }
    }
    f.render_widget(
        Paragraph::new(detail)
            .wrap(Wrap { trim: false })
            .block(Block::default().borders(Borders::ALL).title("Commands")),
        left[1],
    );

    // Aggregated output, following the tail unless scrolled back.
    let rows = right[0].height.saturating_sub(2) as usize;
    let text = printable(orch.output());
    let lines: Vec<Line> = tail_window(&text, rows, state.output_scroll_back)
        .into_iter()
        .map(|l| Line::from(l.to_string()))
        .collect();
    let title = match &state.batch {
        Some(BatchView::Running { runes, .. }) => format!("Output: {}", runes.join(" → ")),
        _ if !state.last_runes.is_empty() => format!("Output: {}", state.last_runes.join(" → ")),
        _ => "Output".to_string(),
    };
    f.render_widget(
        Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title(title)),
        right[0],
    );

    let status = Paragraph::new(vec![
        state.status_line(),
        Line::from(vec![
            Span::raw("Info: "),
            Span::styled(state.info.clone(), Style::default().fg(Color::Gray)),
        ]),
    ])
    .wrap(Wrap { trim: true })
    .block(Block::default().borders(Borders::ALL));
    f.render_widget(status, right[1]);
}

fn draw_history(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let mut lines: Vec<Line> = Vec::new();

    let max_items = (area.height as usize).saturating_sub(4).max(1);
    let total = state.history.len();
    let current = if total > 0 {
        state.history_selected + 1
    } else {
        0
    };
    lines.push(Line::from(vec![
        Span::raw(format!("History ({current}/{total}) - ")),
        Span::styled("↑/↓/j/k", Style::default().fg(Color::Magenta)),
        Span::raw(": navigate, "),
        Span::styled("enter", Style::default().fg(Color::Magenta)),
        Span::raw(": replay, "),
        Span::styled("R", Style::default().fg(Color::Magenta)),
        Span::raw(": reload"),
    ]));
    if !state.info.is_empty() {
        lines.push(Line::from(Span::styled(
            format!("Info: {}", state.info),
            Style::default().fg(Color::Gray),
        )));
    }

    if state.history.is_empty() {
        lines.push(Line::from("No batches run yet."));
    }

    // Keep the selection visible without mutating state during draw.
    let mut offset = state.history_scroll_offset;
    if state.history_selected >= offset + max_items {
        offset = state.history_selected + 1 - max_items;
    }
    for (i, entry) in state
        .history
        .iter()
        .enumerate()
        .skip(offset)
        .take(max_items)
    {
        let style = if i == state.history_selected {
            Style::default().fg(Color::Black).bg(Color::Cyan)
        } else {
            Style::default()
        };
        lines.push(Line::from(vec![
            Span::styled(format!("#{:<5}", entry.id), Style::default().fg(Color::DarkGray)),
            Span::styled(
                format!("{}  ", crate::text_summary::format_timestamp(entry)),
                Style::default().fg(Color::Gray),
            ),
            Span::styled(entry.label(), style),
            Span::styled(
                format!("  [{}]", entry.collection_id),
                Style::default().fg(Color::DarkGray),
            ),
        ]));
    }

    f.render_widget(
        Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title("History")),
        area,
    );
}
