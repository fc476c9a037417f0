use ratatui::{
    layout::Rect,
    style::Color,
    style::Style,
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph},
    Frame,
};

fn key_line(key: &'static str, action: &'static str) -> Line<'static> {
    Line::from(vec![
        Span::raw("  "),
        Span::styled(format!("{key:<12}"), Style::default().fg(Color::Magenta)),
        Span::raw(action),
    ])
}

pub fn draw_help(area: Rect, f: &mut Frame) {
    let p = Paragraph::new(vec![
        Line::from("Keybinds:"),
        key_line("q / Ctrl-C", "Quit (cancels a running batch first)"),
        key_line("tab", "Switch tabs"),
        key_line("?", "Show this help"),
        Line::from(""),
        Line::from("Runes tab:"),
        key_line("↑/↓ or j/k", "Select rune"),
        key_line("enter", "Run selected rune / dismiss finished batch"),
        key_line("space", "Add or remove rune from the queue"),
        key_line("r", "Run the queue in order"),
        key_line("c", "Clear the queue"),
        key_line("x", "Cancel the running batch"),
        key_line("esc", "Dismiss finished batch"),
        key_line("PgUp/PgDn", "Scroll output"),
        key_line("y", "Copy output to clipboard"),
        key_line("s", "Save output to a log file"),
        key_line("L", "Reload runes from the spellbook source"),
        key_line("n", "New rune"),
        key_line("e", "Edit selected rune"),
        key_line("D D", "Delete selected rune"),
        Line::from(""),
        Line::from("Loegs tab:"),
        key_line("↑/↓ or j/k", "Select loeg"),
        key_line("n", "New loeg"),
        key_line("e / enter", "Change selected loeg's value"),
        key_line("D D", "Remove selected loeg"),
        Line::from(""),
        Line::from("Editor:"),
        key_line("tab / ↑/↓", "Move between fields"),
        key_line("enter", "Save"),
        key_line("esc", "Discard"),
        Line::from(""),
        Line::from("History tab:"),
        key_line("↑/↓ or j/k", "Navigate"),
        key_line("enter", "Replay selected batch"),
        key_line("R", "Reload history"),
        Line::from(""),
        Line::from("A queue stops at the first failing command; later runes are skipped."),
    ])
    .block(Block::default().borders(Borders::ALL).title("Help"));
    f.render_widget(p, area);
}
