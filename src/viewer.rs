//! Interactive pager over a completed capture.
//!
//! The viewer owns the records and all UI state; a [`Screen`] supplies frames and input
//! events. Rendering writes cells straight into the frame buffer, one char per cell.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossterm::event::{
    Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers, MouseButton, MouseEvent, MouseEventKind,
};
use ratatui::buffer::Buffer;
use ratatui::layout::Rect;
use ratatui::style::{Color, Modifier, Style};
use ratatui::Frame;
use serde::Serialize;
use tracing::debug;

use crate::capture::{read_all, CaptureError, Record, SourceMode, Summary};
use crate::rules::RuleSet;
use crate::text::{byte_to_char_map, char_spans, display_char};

pub const DEFAULT_TITLE: &str = "output-tool";
pub const DEFAULT_GUTTER_WIDTH: usize = 6;
pub const MIN_GUTTER_WIDTH: usize = 3;
pub const DEFAULT_LOG_LINES: usize = 5;
pub const DEFAULT_DOUBLE_CLICK_MS: u64 = 300;

const HELP_TEXT: &str = " ↑/↓ PgUp/PgDn Home/End  Enter=edit  M=toggle-mouse  q/Esc=quit ";

#[derive(Debug, thiserror::Error)]
pub enum ViewerError {
    #[error("terminal error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Capture(#[from] CaptureError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ViewerConfig {
    pub title: String,
    pub gutter_width: usize,
    pub top_bar: bool,
    pub bottom_bar: bool,
    pub mouse: bool,
    pub no_alt: bool,
    pub log_lines_max: usize,
    pub double_click_ms: u64,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            title: DEFAULT_TITLE.to_string(),
            gutter_width: DEFAULT_GUTTER_WIDTH,
            top_bar: true,
            bottom_bar: true,
            mouse: true,
            no_alt: false,
            log_lines_max: DEFAULT_LOG_LINES,
            double_click_ms: DEFAULT_DOUBLE_CLICK_MS,
        }
    }
}

/// What an activation did: the argv that was launched and/or why it failed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Activation {
    pub argv: Vec<String>,
    pub error: Option<String>,
}

/// Called when the user activates a line (Enter or double-click).
pub trait ActivationHook {
    fn activate(&mut self, line: &str) -> Activation;

    /// Whether the hook runs a program that needs the terminal while it executes.
    fn needs_terminal(&self) -> bool {
        false
    }
}

/// Terminal boundary used by [`run_viewer`].
pub trait Screen {
    fn draw(&mut self, render: &mut dyn FnMut(&mut Frame<'_>)) -> Result<(), ViewerError>;
    /// Forces a full repaint on the next draw.
    fn sync(&mut self) -> Result<(), ViewerError>;
    fn set_mouse(&mut self, enabled: bool) -> Result<(), ViewerError>;
    /// Blocks until the next input event.
    fn next_event(&mut self) -> Result<Event, ViewerError>;
    /// Hands the terminal to a child process until [`Screen::resume`].
    fn suspend(&mut self) -> Result<(), ViewerError> {
        Ok(())
    }
    fn resume(&mut self) -> Result<(), ViewerError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    None,
    Activate,
    ToggleMouse,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    Idle,
    Activated(Activation),
    MouseChanged(bool),
    Quit,
}

#[derive(Debug, Clone)]
pub struct ViewerState {
    pub cursor: usize,
    pub viewport_top: usize,
    pub visible_rows: usize,
    pub mouse: bool,
    pub log: VecDeque<String>,
    pub needs_sync: bool,
    /// Rows the body actually occupies; zero when bars and the log pane fill the screen.
    body_rows: usize,
    last_click: Option<(usize, Instant)>,
}

#[derive(Debug, Clone, Copy)]
struct Areas {
    top_bar: Option<Rect>,
    body: Rect,
    log: Rect,
    bottom_bar: Option<Rect>,
}

#[derive(Debug, Clone, Copy)]
struct Palette {
    normal: Style,
    matched: Style,
    cursor: Style,
    cursor_matched: Style,
    gutter: Style,
    gutter_cursor: Style,
    top_bar: Style,
    bottom_bar: Style,
    log: Style,
}

impl Default for Palette {
    fn default() -> Self {
        let gutter = Style::default().fg(Color::Gray).bg(Color::Black);
        Self {
            normal: Style::default().fg(Color::White).bg(Color::Black),
            matched: Style::default().fg(Color::Black).bg(Color::Green),
            cursor: Style::default().fg(Color::Black).bg(Color::Yellow),
            cursor_matched: Style::default().fg(Color::Black).bg(Color::Blue),
            gutter,
            gutter_cursor: Style::default().fg(Color::White).bg(Color::Blue),
            top_bar: Style::default().fg(Color::Black).bg(Color::Green),
            bottom_bar: Style::default().fg(Color::Black).bg(Color::Yellow),
            log: gutter.add_modifier(Modifier::REVERSED),
        }
    }
}

pub struct Viewer {
    pub config: ViewerConfig,
    pub state: ViewerState,
    records: Vec<Record>,
    summary: Option<Summary>,
    rules: Arc<RuleSet>,
    hook: Option<Box<dyn ActivationHook>>,
    palette: Palette,
}

impl Viewer {
    pub fn new(
        config: ViewerConfig,
        records: Vec<Record>,
        summary: Option<Summary>,
        rules: Arc<RuleSet>,
    ) -> Self {
        let state = ViewerState {
            cursor: 0,
            viewport_top: 0,
            visible_rows: 1,
            mouse: config.mouse,
            log: VecDeque::new(),
            needs_sync: false,
            body_rows: 1,
            last_click: None,
        };
        Self { config, state, records, summary, rules, hook: None, palette: Palette::default() }
    }

    pub fn from_capture(
        config: ViewerConfig,
        capture_path: &Path,
        summary: Option<Summary>,
        rules: Arc<RuleSet>,
    ) -> Result<Self, ViewerError> {
        let records = read_all(capture_path)?;
        debug!(path = %capture_path.display(), records = records.len(), "loaded capture");
        Ok(Self::new(config, records, summary, rules))
    }

    pub fn with_hook(mut self, hook: Box<dyn ActivationHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn selected(&self) -> Option<&Record> {
        self.records.get(self.state.cursor)
    }

    pub fn activation_needs_terminal(&self) -> bool {
        self.hook.as_ref().is_some_and(|hook| hook.needs_terminal())
    }

    pub fn handle_event(&mut self, event: Event, now: Instant) -> Action {
        match event {
            Event::Key(key) if key.kind == KeyEventKind::Press => self.handle_key(key),
            Event::Mouse(mouse) => self.handle_mouse(mouse, now),
            Event::Resize(_, _) => {
                self.state.needs_sync = true;
                Action::None
            }
            _ => Action::None,
        }
    }

    pub fn handle_key(&mut self, key: KeyEvent) -> Action {
        let page = self.state.visible_rows.max(1) as isize;
        match key.code {
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => Action::Quit,
            KeyCode::Esc | KeyCode::Char('q') | KeyCode::Char('Q') => Action::Quit,
            KeyCode::Up | KeyCode::Char('k') => self.move_by(-1),
            KeyCode::Down | KeyCode::Char('j') => self.move_by(1),
            KeyCode::PageUp => self.move_by(-page),
            KeyCode::PageDown => self.move_by(page),
            KeyCode::Home | KeyCode::Char('g') => self.set_cursor(0),
            KeyCode::End | KeyCode::Char('G') => {
                self.set_cursor(self.records.len().saturating_sub(1))
            }
            KeyCode::Enter if !self.records.is_empty() => Action::Activate,
            KeyCode::Char('m') | KeyCode::Char('M') => Action::ToggleMouse,
            _ => Action::None,
        }
    }

    pub fn handle_mouse(&mut self, event: MouseEvent, now: Instant) -> Action {
        if !self.state.mouse {
            return Action::None;
        }
        match event.kind {
            MouseEventKind::ScrollUp => self.move_by(-1),
            MouseEventKind::ScrollDown => self.move_by(1),
            MouseEventKind::Down(MouseButton::Left) => {
                let Some(idx) = self.record_at_row(event.row) else {
                    return Action::None;
                };
                self.set_cursor(idx);
                let window = Duration::from_millis(self.config.double_click_ms);
                match self.state.last_click {
                    Some((last, at)) if last == idx && now.saturating_duration_since(at) <= window => {
                        self.state.last_click = None;
                        Action::Activate
                    }
                    _ => {
                        self.state.last_click = Some((idx, now));
                        Action::None
                    }
                }
            }
            _ => Action::None,
        }
    }

    pub fn perform_action(&mut self, action: Action) -> ActionOutcome {
        match action {
            Action::None => ActionOutcome::Idle,
            Action::Quit => ActionOutcome::Quit,
            Action::ToggleMouse => {
                self.state.mouse = !self.state.mouse;
                self.state.last_click = None;
                ActionOutcome::MouseChanged(self.state.mouse)
            }
            Action::Activate => match self.activate_selected() {
                Some(activation) => ActionOutcome::Activated(activation),
                None => ActionOutcome::Idle,
            },
        }
    }

    fn activate_selected(&mut self) -> Option<Activation> {
        let text = self.selected()?.text.clone();
        let hook = self.hook.as_mut()?;
        let activation = hook.activate(&text);
        if !activation.argv.is_empty() {
            self.push_log(&format!("edit: exec: {}", activation.argv.join(" ")));
        }
        if let Some(error) = &activation.error {
            self.push_log(&format!("edit: error: {error}"));
        }
        Some(activation)
    }

    /// Appends to the log pane, one entry per line, keeping only the newest entries.
    pub fn push_log(&mut self, message: &str) {
        for line in message.trim_end_matches(['\r', '\n']).split('\n') {
            self.state.log.push_back(line.trim_end_matches('\r').to_string());
        }
        while self.state.log.len() > self.config.log_lines_max {
            self.state.log.pop_front();
        }
        self.state.needs_sync = true;
    }

    fn move_by(&mut self, delta: isize) -> Action {
        let target = if delta.is_negative() {
            self.state.cursor.saturating_sub(delta.unsigned_abs())
        } else {
            self.state.cursor.saturating_add(delta as usize)
        };
        self.set_cursor(target)
    }

    fn set_cursor(&mut self, idx: usize) -> Action {
        self.state.cursor = idx.min(self.records.len().saturating_sub(1));
        self.scroll_to_cursor();
        Action::None
    }

    /// Restores `top <= cursor < top + rows` with the smallest viewport move.
    fn scroll_to_cursor(&mut self) {
        let rows = self.state.visible_rows.max(1);
        let total = self.records.len();
        if total == 0 {
            self.state.cursor = 0;
            self.state.viewport_top = 0;
            return;
        }
        self.state.cursor = self.state.cursor.min(total - 1);
        if self.state.cursor < self.state.viewport_top {
            self.state.viewport_top = self.state.cursor;
        }
        if self.state.cursor >= self.state.viewport_top + rows {
            self.state.viewport_top = self.state.cursor + 1 - rows;
        }
        self.state.viewport_top = self.state.viewport_top.min(total.saturating_sub(rows));
    }

    fn record_at_row(&self, row: u16) -> Option<usize> {
        let body_top = u16::from(self.config.top_bar);
        let offset = usize::from(row.checked_sub(body_top)?);
        if offset >= self.state.body_rows {
            return None;
        }
        let idx = self.state.viewport_top + offset;
        (idx < self.records.len()).then_some(idx)
    }

    fn areas(&self, area: Rect) -> Areas {
        let mut remaining = area.height;
        let top_rows = u16::from(self.config.top_bar).min(remaining);
        remaining -= top_rows;
        let bottom_rows = u16::from(self.config.bottom_bar).min(remaining);
        remaining -= bottom_rows;
        let wanted_log = self.state.log.len().min(self.config.log_lines_max);
        let log_rows = u16::try_from(wanted_log).unwrap_or(u16::MAX).min(remaining);
        let body_rows = remaining - log_rows;

        let row = |y: u16, height: u16| Rect { x: area.x, y, width: area.width, height };
        let body_y = area.y + top_rows;
        Areas {
            top_bar: (top_rows > 0).then(|| row(area.y, 1)),
            body: row(body_y, body_rows),
            log: row(body_y + body_rows, log_rows),
            bottom_bar: (bottom_rows > 0).then(|| row(body_y + body_rows + log_rows, 1)),
        }
    }

    pub fn status_line(&self) -> String {
        let total = self.records.len();
        let pos = if total == 0 { 0 } else { self.state.cursor + 1 };
        let mut out = format!(" {} | ", self.config.title);
        let (match_lines, matches) = match &self.summary {
            Some(summary) => {
                out.push_str(&format!("input:{}  ", summary.source.mode.as_str()));
                if summary.source.mode == SourceMode::Exec {
                    out.push_str(&format!("exit:{}  ", summary.exit_code.unwrap_or_default()));
                }
                (summary.match_lines, summary.matches_total)
            }
            None => (0, 0),
        };
        out.push_str(&format!(
            "lines:{total}  pos:{pos}/{total}  match-lines:{match_lines}  matches:{matches}  (mouse:{}) ",
            self.state.mouse
        ));
        out
    }

    pub fn render(&mut self, frame: &mut Frame<'_>) {
        let area = frame.area();
        let areas = self.areas(area);
        self.state.body_rows = usize::from(areas.body.height);
        self.state.visible_rows = self.state.body_rows.max(1);
        self.scroll_to_cursor();

        let palette = self.palette;
        let status = self.config.top_bar.then(|| self.status_line());
        let buf = frame.buffer_mut();

        if let (Some(rect), Some(status)) = (areas.top_bar, status) {
            draw_line(buf, rect, &status, palette.top_bar);
        }
        self.render_body(buf, areas.body, &palette);

        let shown = usize::from(areas.log.height);
        let skip = self.state.log.len().saturating_sub(shown);
        for (offset, line) in self.state.log.iter().skip(skip).enumerate() {
            let rect = Rect { y: areas.log.y + offset as u16, height: 1, ..areas.log };
            draw_line(buf, rect, &format!(" {line} "), palette.log);
        }

        if let Some(rect) = areas.bottom_bar {
            draw_line(buf, rect, HELP_TEXT, palette.bottom_bar);
        }
    }

    fn render_body(&self, buf: &mut Buffer, body: Rect, palette: &Palette) {
        let gutter_width = self.config.gutter_width.max(MIN_GUTTER_WIDTH);
        let number_width = gutter_width - 2;
        let right = body.x.saturating_add(body.width);

        for row in 0..body.height {
            let idx = self.state.viewport_top + usize::from(row);
            let Some(record) = self.records.get(idx) else {
                break;
            };
            let y = body.y + row;
            let selected = idx == self.state.cursor;

            let number = format!("{:>number_width$}", record.n);
            let gutter: String = number.chars().take(number_width).chain(": ".chars()).collect();
            let gutter_style = if selected { palette.gutter_cursor } else { palette.gutter };
            let mut x = body.x;
            for ch in gutter.chars() {
                if x >= right {
                    break;
                }
                set_cell(buf, x, y, ch, gutter_style);
                x += 1;
            }

            let spans = self.rules.all_spans(&record.text);
            let spans = char_spans(&byte_to_char_map(&record.text), &spans);
            let base = if selected { palette.cursor } else { palette.normal };
            let highlight = if selected { palette.cursor_matched } else { palette.matched };
            for (char_idx, ch) in record.text.chars().enumerate() {
                if x >= right {
                    break;
                }
                let inside = spans.iter().any(|span| span.contains(&char_idx));
                set_cell(buf, x, y, display_char(ch), if inside { highlight } else { base });
                x += 1;
            }
            while x < right {
                set_cell(buf, x, y, ' ', palette.normal);
                x += 1;
            }
        }
    }
}

fn set_cell(buf: &mut Buffer, x: u16, y: u16, ch: char, style: Style) {
    if let Some(cell) = buf.cell_mut((x, y)) {
        cell.set_char(ch).set_style(style);
    }
}

/// Fills one row with `style` and writes `text` over it, truncated to the row width.
fn draw_line(buf: &mut Buffer, rect: Rect, text: &str, style: Style) {
    let right = rect.x.saturating_add(rect.width);
    let mut chars = text.chars();
    for x in rect.x..right {
        let ch = chars.next().map(display_char).unwrap_or(' ');
        set_cell(buf, x, rect.y, ch, style);
    }
}

/// Drives the viewer until the user quits.
pub fn run_viewer<S: Screen>(viewer: &mut Viewer, screen: &mut S) -> Result<(), ViewerError> {
    screen.set_mouse(viewer.state.mouse)?;
    loop {
        if std::mem::take(&mut viewer.state.needs_sync) {
            screen.sync()?;
        }
        screen.draw(&mut |frame| viewer.render(frame))?;

        let event = screen.next_event()?;
        let action = viewer.handle_event(event, Instant::now());
        let outcome = if action == Action::Activate && viewer.activation_needs_terminal() {
            screen.suspend()?;
            let outcome = viewer.perform_action(action);
            screen.resume()?;
            viewer.state.needs_sync = true;
            outcome
        } else {
            viewer.perform_action(action)
        };

        match outcome {
            ActionOutcome::Quit => return Ok(()),
            ActionOutcome::MouseChanged(enabled) => screen.set_mouse(enabled)?,
            ActionOutcome::Activated(_) | ActionOutcome::Idle => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossterm::event::KeyEventState;
    use ratatui::backend::TestBackend;
    use ratatui::Terminal;
    use rstest::rstest;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct MockHook {
        calls: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    impl ActivationHook for MockHook {
        fn activate(&mut self, line: &str) -> Activation {
            self.calls.lock().expect("lock calls").push(line.to_string());
            Activation {
                argv: vec!["code".to_string(), line.to_string()],
                error: self.fail.then(|| "spawn failed\nsecond line".to_string()),
            }
        }
    }

    struct ScriptedScreen {
        terminal: Terminal<TestBackend>,
        events: VecDeque<Event>,
        syncs: usize,
        mouse: Vec<bool>,
    }

    impl ScriptedScreen {
        fn new(width: u16, height: u16, events: Vec<Event>) -> Self {
            let terminal = Terminal::new(TestBackend::new(width, height)).expect("terminal");
            Self { terminal, events: events.into(), syncs: 0, mouse: Vec::new() }
        }
    }

    impl Screen for ScriptedScreen {
        fn draw(&mut self, render: &mut dyn FnMut(&mut Frame<'_>)) -> Result<(), ViewerError> {
            self.terminal.draw(|frame| render(frame))?;
            Ok(())
        }

        fn sync(&mut self) -> Result<(), ViewerError> {
            self.syncs += 1;
            Ok(())
        }

        fn set_mouse(&mut self, enabled: bool) -> Result<(), ViewerError> {
            self.mouse.push(enabled);
            Ok(())
        }

        fn next_event(&mut self) -> Result<Event, ViewerError> {
            Ok(self.events.pop_front().unwrap_or(Event::Key(key(KeyCode::Esc))))
        }
    }

    fn key(code: KeyCode) -> KeyEvent {
        KeyEvent {
            code,
            modifiers: KeyModifiers::NONE,
            kind: KeyEventKind::Press,
            state: KeyEventState::empty(),
        }
    }

    fn click(row: u16) -> MouseEvent {
        MouseEvent {
            kind: MouseEventKind::Down(MouseButton::Left),
            column: 10,
            row,
            modifiers: KeyModifiers::NONE,
        }
    }

    fn records(count: u64) -> Vec<Record> {
        (1..=count).map(|n| Record::new(n, format!("line {n}"), false, "")).collect()
    }

    fn make_viewer(records: Vec<Record>) -> Viewer {
        Viewer::new(ViewerConfig::default(), records, None, Arc::new(RuleSet::default_rules()))
    }

    fn render_once(viewer: &mut Viewer, width: u16, height: u16) -> Buffer {
        let mut terminal = Terminal::new(TestBackend::new(width, height)).expect("terminal");
        terminal.draw(|frame| viewer.render(frame)).expect("draw");
        terminal.backend().buffer().clone()
    }

    fn row_text(buf: &Buffer, y: u16) -> String {
        (0..buf.area.width).map(|x| buf[(x, y)].symbol().to_string()).collect()
    }

    fn assert_viewport_invariant(viewer: &Viewer) {
        let state = &viewer.state;
        let total = viewer.records().len();
        if total == 0 {
            assert_eq!(state.cursor, 0);
            assert_eq!(state.viewport_top, 0);
            return;
        }
        assert!(state.viewport_top <= state.cursor);
        assert!(state.cursor < state.viewport_top + state.visible_rows);
        assert!(state.viewport_top <= total.saturating_sub(state.visible_rows));
    }

    #[test]
    fn empty_capture_renders_and_ignores_movement() {
        let mut viewer = make_viewer(Vec::new());
        let buf = render_once(&mut viewer, 60, 10);
        assert!(row_text(&buf, 0).contains("lines:0  pos:0/0"));
        assert!(row_text(&buf, 1).trim().is_empty());

        for code in [KeyCode::Down, KeyCode::PageDown, KeyCode::End, KeyCode::Up] {
            assert_eq!(viewer.handle_key(key(code)), Action::None);
        }
        assert_eq!(viewer.state.cursor, 0);
        assert_eq!(viewer.handle_key(key(KeyCode::Enter)), Action::None);
        assert_viewport_invariant(&viewer);
    }

    #[rstest]
    #[case(KeyCode::Down, 1)]
    #[case(KeyCode::Char('j'), 1)]
    #[case(KeyCode::Up, 0)]
    #[case(KeyCode::End, 49)]
    #[case(KeyCode::Char('G'), 49)]
    #[case(KeyCode::PageDown, 8)]
    fn keys_move_cursor_from_start(#[case] code: KeyCode, #[case] expected: usize) {
        let mut viewer = make_viewer(records(50));
        // 10 rows minus top and bottom bars leaves 8 body rows.
        render_once(&mut viewer, 40, 10);
        viewer.handle_key(key(code));
        assert_eq!(viewer.state.cursor, expected);
        assert_viewport_invariant(&viewer);
    }

    #[test]
    fn scrolling_keeps_cursor_visible_with_minimal_moves() {
        let mut viewer = make_viewer(records(50));
        render_once(&mut viewer, 40, 10);

        viewer.handle_key(key(KeyCode::End));
        assert_eq!(viewer.state.viewport_top, 42);

        viewer.handle_key(key(KeyCode::Up));
        assert_eq!(viewer.state.cursor, 48);
        assert_eq!(viewer.state.viewport_top, 42);

        viewer.handle_key(key(KeyCode::PageUp));
        assert_eq!(viewer.state.cursor, 40);
        assert_eq!(viewer.state.viewport_top, 40);

        viewer.handle_key(key(KeyCode::Home));
        assert_eq!(viewer.state.viewport_top, 0);
        assert_viewport_invariant(&viewer);
    }

    #[test]
    fn shrinking_terminal_reestablishes_invariant() {
        let mut viewer = make_viewer(records(50));
        render_once(&mut viewer, 40, 30);
        viewer.handle_key(key(KeyCode::Char('G')));
        render_once(&mut viewer, 40, 5);
        assert_eq!(viewer.state.visible_rows, 3);
        assert_viewport_invariant(&viewer);
    }

    #[test]
    fn renders_bars_gutter_and_highlight() {
        let recs = vec![
            Record::new(1, "compiling".to_string(), false, "out"),
            Record::new(2, "src/a.rs:3:7: error".to_string(), true, "err"),
        ];
        let mut summary = Summary::new(SourceMode::Exec, "cargo build", "/tmp/x.jsonl");
        summary.match_lines = 1;
        summary.matches_total = 1;
        summary.exit_code = Some(101);
        let mut viewer = Viewer::new(
            ViewerConfig::default(),
            recs,
            Some(summary),
            Arc::new(RuleSet::default_rules()),
        );
        let buf = render_once(&mut viewer, 100, 8);

        let top = row_text(&buf, 0);
        assert!(top.starts_with(" output-tool | input:exec  exit:101  lines:2  pos:1/2"));
        assert!(top.contains("match-lines:1  matches:1  (mouse:true)"));
        assert_eq!(&row_text(&buf, 1)[..15], "   1: compiling");
        assert_eq!(&row_text(&buf, 2)[..6], "   2: ");
        assert!(row_text(&buf, 7).starts_with(" ↑/↓ PgUp/PgDn"));

        // Selected row: gutter and text use cursor styles.
        assert_eq!(buf[(0, 1)].bg, Color::Blue);
        assert_eq!(buf[(6, 1)].bg, Color::Yellow);
        // Match on an unselected row is green; text after the span is normal.
        assert_eq!(buf[(6, 2)].bg, Color::Green);
        assert_eq!(buf[(6 + 13, 2)].bg, Color::Black);

        viewer.handle_key(key(KeyCode::Down));
        let buf = render_once(&mut viewer, 100, 8);
        assert_eq!(buf[(6, 2)].bg, Color::Blue);
    }

    #[test]
    fn highlight_uses_char_positions_after_multibyte_text() {
        let recs = vec![
            Record::new(1, "top".to_string(), false, ""),
            Record::new(2, "é→ a.rs:1:2".to_string(), true, ""),
        ];
        let mut viewer = make_viewer(recs);
        let buf = render_once(&mut viewer, 40, 6);
        // Text starts at column 6; "é→ " occupies three cells.
        assert_eq!(buf[(8, 2)].bg, Color::Black);
        assert_eq!(buf[(9, 2)].bg, Color::Green);
        assert_eq!(buf[(9, 2)].symbol(), "a");
    }

    #[test]
    fn long_lines_are_truncated_to_width() {
        let recs = vec![Record::new(1, "x".repeat(200), false, "")];
        let mut viewer = make_viewer(recs);
        let buf = render_once(&mut viewer, 20, 4);
        assert_eq!(row_text(&buf, 1), format!("   1: {}", "x".repeat(14)));
    }

    #[test]
    fn enter_activates_selected_line_and_logs_argv() {
        let hook = MockHook::default();
        let calls = hook.calls.clone();
        let mut viewer = make_viewer(records(3)).with_hook(Box::new(hook));
        render_once(&mut viewer, 40, 10);
        viewer.handle_key(key(KeyCode::Down));

        let action = viewer.handle_key(key(KeyCode::Enter));
        assert_eq!(action, Action::Activate);
        let outcome = viewer.perform_action(action);
        assert!(matches!(outcome, ActionOutcome::Activated(_)));

        assert_eq!(calls.lock().expect("lock").as_slice(), ["line 2"]);
        assert_eq!(viewer.state.log.back().map(String::as_str), Some("edit: exec: code line 2"));
        assert_eq!(viewer.state.cursor, 1);
        assert_eq!(viewer.state.viewport_top, 0);
        assert!(viewer.state.needs_sync);
    }

    #[test]
    fn activation_errors_are_split_into_log_lines() {
        let hook = MockHook { fail: true, ..MockHook::default() };
        let mut viewer = make_viewer(records(1)).with_hook(Box::new(hook));
        viewer.perform_action(Action::Activate);
        let log: Vec<&str> = viewer.state.log.iter().map(String::as_str).collect();
        assert_eq!(log, ["edit: exec: code line 1", "edit: error: spawn failed", "second line"]);

        let buf = render_once(&mut viewer, 40, 12);
        assert!(row_text(&buf, 10).starts_with(" second line "));
        assert!(buf[(0, 10)].modifier.contains(Modifier::REVERSED));
    }

    #[test]
    fn log_pane_keeps_only_newest_lines() {
        let mut viewer = make_viewer(records(1));
        for idx in 0..8 {
            viewer.push_log(&format!("message {idx}"));
        }
        assert_eq!(viewer.state.log.len(), DEFAULT_LOG_LINES);
        assert_eq!(viewer.state.log.front().map(String::as_str), Some("message 3"));

        render_once(&mut viewer, 40, 10);
        // 10 rows - 2 bars - 5 log rows.
        assert_eq!(viewer.state.visible_rows, 3);
    }

    #[test]
    fn double_click_on_same_record_activates_once_per_pair() {
        let mut viewer = make_viewer(records(5));
        render_once(&mut viewer, 40, 10);
        let start = Instant::now();
        let soon = start + Duration::from_millis(120);

        assert_eq!(viewer.handle_mouse(click(2), start), Action::None);
        assert_eq!(viewer.state.cursor, 1);
        assert_eq!(viewer.handle_mouse(click(2), soon), Action::Activate);
        // A third click starts a new pair.
        assert_eq!(viewer.handle_mouse(click(2), soon + Duration::from_millis(10)), Action::None);
    }

    #[test]
    fn click_on_other_record_resets_pairing() {
        let mut viewer = make_viewer(records(5));
        render_once(&mut viewer, 40, 10);
        let start = Instant::now();
        let ms = |n| start + Duration::from_millis(n);

        assert_eq!(viewer.handle_mouse(click(1), start), Action::None);
        assert_eq!(viewer.handle_mouse(click(3), ms(50)), Action::None);
        assert_eq!(viewer.handle_mouse(click(1), ms(100)), Action::None);
        assert_eq!(viewer.state.cursor, 0);
    }

    #[test]
    fn slow_second_click_does_not_activate() {
        let mut viewer = make_viewer(records(5));
        render_once(&mut viewer, 40, 10);
        let start = Instant::now();
        viewer.handle_mouse(click(1), start);
        assert_eq!(viewer.handle_mouse(click(1), start + Duration::from_millis(301)), Action::None);
    }

    #[test]
    fn clicks_outside_body_and_with_mouse_off_are_ignored() {
        let mut viewer = make_viewer(records(2));
        render_once(&mut viewer, 40, 10);
        let now = Instant::now();
        // Top bar, empty body row, bottom bar.
        for row in [0, 5, 9] {
            assert_eq!(viewer.handle_mouse(click(row), now), Action::None);
        }
        assert_eq!(viewer.state.cursor, 0);

        assert_eq!(viewer.handle_key(key(KeyCode::Char('m'))), Action::ToggleMouse);
        assert_eq!(viewer.perform_action(Action::ToggleMouse), ActionOutcome::MouseChanged(false));
        viewer.handle_mouse(click(2), now);
        assert_eq!(viewer.state.cursor, 0);
    }

    #[test]
    fn clicks_are_ignored_when_the_log_pane_fills_the_body() {
        let mut viewer = make_viewer(records(3));
        for idx in 0..5 {
            viewer.push_log(&format!("message {idx}"));
        }
        // 7 rows - 2 bars - 5 log rows leaves no body.
        render_once(&mut viewer, 40, 7);
        let now = Instant::now();
        assert_eq!(viewer.handle_mouse(click(1), now), Action::None);
        assert_eq!(viewer.handle_mouse(click(1), now + Duration::from_millis(50)), Action::None);
        assert_eq!(viewer.state.cursor, 0);
        assert_viewport_invariant(&viewer);
    }

    #[rstest]
    #[case(KeyCode::Char('q'))]
    #[case(KeyCode::Char('Q'))]
    #[case(KeyCode::Esc)]
    fn quit_keys(#[case] code: KeyCode) {
        let mut viewer = make_viewer(records(1));
        assert_eq!(viewer.handle_key(key(code)), Action::Quit);
    }

    #[test]
    fn run_loop_syncs_on_resize_and_toggles_mouse() {
        let mut viewer = make_viewer(records(3));
        let mut screen = ScriptedScreen::new(
            40,
            10,
            vec![
                Event::Resize(40, 10),
                Event::Key(key(KeyCode::Char('M'))),
                Event::Key(key(KeyCode::Down)),
                Event::Key(key(KeyCode::Char('q'))),
            ],
        );
        run_viewer(&mut viewer, &mut screen).expect("run");
        assert_eq!(screen.syncs, 1);
        assert_eq!(screen.mouse, vec![true, false]);
        assert_eq!(viewer.state.cursor, 1);
    }
}
