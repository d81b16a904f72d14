use crate::config::{CameraConfig, SLOT_COUNT};
use crate::layout::{LayoutController, hit_test};
use crate::render::{Palette, PixelSize, RENDER_INTERVAL, Renderer, Surface};
use crate::shutdown::{ShutdownOutcome, ShutdownSequencer, ShutdownTrigger};
use crate::state::{ConnectionState, TileState};
use anyhow::{Context, Result};
use crossterm::event::{
    self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEvent, KeyEventKind,
    KeyModifiers, MouseButton, MouseEvent, MouseEventKind,
};
use crossterm::execute;
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use ratatui::backend::{Backend, CrosstermBackend};
use ratatui::buffer::Buffer;
use ratatui::layout::{Alignment, Constraint, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Paragraph, Widget};
use ratatui::{Frame, Terminal};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

type AppTerminal = Terminal<CrosstermBackend<io::Stdout>>;

const HALF_BLOCK: &str = "▀";
const TITLE_ERROR_CHARS: usize = 48;

/// Runs the wall until a close request or signal, then drives the shutdown
/// sequence. The terminal is restored as the last shutdown step, also when
/// the UI loop itself failed.
pub async fn run_viewer(
    cameras: &[CameraConfig; SLOT_COUNT],
    tiles: [Arc<TileState>; SLOT_COUNT],
    sequencer: &ShutdownSequencer,
    mut triggers: mpsc::UnboundedReceiver<ShutdownTrigger>,
) -> Result<ShutdownOutcome> {
    let mut terminal = match init_terminal() {
        Ok(terminal) => terminal,
        Err(err) => {
            sequencer
                .shutdown(ShutdownTrigger::WindowClose, || {
                    let _ = disable_raw_mode();
                })
                .await;
            return Err(err);
        }
    };

    let mut app = App::new(cameras, tiles, Palette::WALL);
    let loop_result = ui_loop(&mut terminal, &mut app, &mut triggers).await;
    let trigger = match &loop_result {
        Ok(trigger) => *trigger,
        Err(err) => {
            error!("ui loop failed: {err:#}");
            ShutdownTrigger::WindowClose
        }
    };

    let mut restored = Ok(());
    let outcome = sequencer
        .shutdown(trigger, || restored = restore_terminal(&mut terminal))
        .await;

    loop_result?;
    restored?;
    Ok(outcome)
}

fn init_terminal() -> Result<AppTerminal> {
    enable_raw_mode().context("failed to enable raw mode")?;
    let mut stdout = io::stdout();
    if let Err(err) = execute!(stdout, EnterAlternateScreen, EnableMouseCapture) {
        let _ = disable_raw_mode();
        return Err(err).context("failed entering alternate screen");
    }
    let backend = CrosstermBackend::new(stdout);
    Terminal::new(backend).context("failed creating terminal")
}

fn restore_terminal(terminal: &mut AppTerminal) -> Result<()> {
    disable_raw_mode().context("failed disabling raw mode")?;
    execute!(terminal.backend_mut(), DisableMouseCapture, LeaveAlternateScreen)
        .context("failed leaving alternate screen")?;
    terminal.show_cursor().context("failed showing cursor")?;
    Ok(())
}

async fn ui_loop<B: Backend>(
    terminal: &mut Terminal<B>,
    app: &mut App,
    triggers: &mut mpsc::UnboundedReceiver<ShutdownTrigger>,
) -> Result<ShutdownTrigger> {
    let mut ticker = tokio::time::interval(RENDER_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            Some(trigger) = triggers.recv() => return Ok(trigger),
            _ = ticker.tick() => {
                if let Some(trigger) = app.drain_input()? {
                    return Ok(trigger);
                }
                terminal
                    .draw(|frame| app.draw(frame))
                    .context("terminal draw failed")?;
            }
        }
    }
}

struct App {
    labels: [String; SLOT_COUNT],
    tiles: [Arc<TileState>; SLOT_COUNT],
    layout: LayoutController,
    renderer: Renderer,
    slot_rects: [Rect; SLOT_COUNT],
}

impl App {
    fn new(
        cameras: &[CameraConfig; SLOT_COUNT],
        tiles: [Arc<TileState>; SLOT_COUNT],
        palette: Palette,
    ) -> Self {
        Self {
            labels: std::array::from_fn(|idx| cameras[idx].label()),
            tiles,
            layout: LayoutController::new(std::array::from_fn(|idx| !cameras[idx].is_disabled())),
            renderer: Renderer::new(palette),
            slot_rects: [Rect::default(); SLOT_COUNT],
        }
    }

    /// Applies every pending terminal event without blocking.
    fn drain_input(&mut self) -> Result<Option<ShutdownTrigger>> {
        while event::poll(Duration::ZERO).context("event poll failed")? {
            match event::read().context("event read failed")? {
                Event::Key(key) if key.kind == KeyEventKind::Press => {
                    if let Some(trigger) = self.handle_key(key) {
                        return Ok(Some(trigger));
                    }
                }
                Event::Mouse(mouse) => self.handle_mouse(mouse),
                _ => {}
            }
        }
        Ok(None)
    }

    fn handle_key(&mut self, key: KeyEvent) -> Option<ShutdownTrigger> {
        let ctrl = key.modifiers.contains(KeyModifiers::CONTROL);
        match key.code {
            KeyCode::Char('c' | 'C') if ctrl => Some(ShutdownTrigger::Interrupt),
            KeyCode::Char('z' | 'Z') if ctrl => Some(ShutdownTrigger::Suspend),
            KeyCode::Char('q' | 'Q') => Some(ShutdownTrigger::WindowClose),
            KeyCode::Esc => {
                if self.layout.escape() {
                    info!("back to grid");
                }
                None
            }
            KeyCode::Char('f' | 'F') => {
                let mode = self.layout.toggle_fill();
                info!(fill = mode.label(), "fill mode toggled");
                None
            }
            _ => None,
        }
    }

    fn handle_mouse(&mut self, mouse: MouseEvent) {
        if mouse.kind != MouseEventKind::Down(MouseButton::Left) {
            return;
        }
        if let Some(slot) = hit_test(&self.slot_rects, mouse.column, mouse.row)
            && self.layout.click(slot)
        {
            info!(slot, fullscreen = ?self.layout.state().fullscreen, "layout changed");
        }
    }

    fn draw(&mut self, frame: &mut Frame) {
        let palette = *self.renderer.palette();
        frame.render_widget(
            Block::default().style(Style::default().bg(palette.background)),
            frame.area(),
        );

        let [grid_area, footer_area] =
            Layout::vertical([Constraint::Min(1), Constraint::Length(1)]).areas(frame.area());
        self.slot_rects = self.layout.slot_rects(grid_area);
        let fill = self.layout.fill_mode();

        for slot in 0..SLOT_COUNT {
            let area = self.slot_rects[slot];
            if area.is_empty() {
                continue;
            }

            let tile = &self.tiles[slot];
            let block = slot_block(slot, &self.labels[slot], tile, &palette);
            let inner = block.inner(area);
            frame.render_widget(block, area);

            let size = PixelSize::new(usize::from(inner.width), usize::from(inner.height) * 2);
            let surface = self
                .renderer
                .render_slot(slot, tile, &self.labels[slot], size, fill);
            frame.render_widget(SurfaceWidget { surface: &surface }, inner);
        }

        let mut footer = action_hint_spans(
            &[
                ("click", "fullscreen"),
                ("Esc", "grid"),
                ("F", "fill mode"),
                ("q", "quit"),
            ],
            &palette,
        );
        footer.push(Span::styled(
            format!("   {}", fill.label()),
            Style::default().fg(palette.accent),
        ));
        frame.render_widget(
            Paragraph::new(Line::from(footer)).style(Style::default().bg(palette.background)),
            footer_area,
        );
    }
}

fn slot_block<'a>(
    slot: usize,
    label: &'a str,
    tile: &TileState,
    palette: &Palette,
) -> Block<'a> {
    let state = tile.state();
    let border = if state == ConnectionState::Disabled {
        palette.muted
    } else {
        palette.border
    };

    let mut title = vec![
        Span::styled(
            format!(" {} ", slot + 1),
            Style::default()
                .fg(palette.accent)
                .add_modifier(Modifier::BOLD),
        ),
        Span::styled(
            label,
            Style::default()
                .fg(palette.text)
                .add_modifier(Modifier::BOLD),
        ),
        Span::styled(
            format!(" | {} ", state.label()),
            Style::default().fg(state_color(state, palette)),
        ),
    ];

    match state {
        ConnectionState::Streaming => title.push(Span::styled(
            format!("| frames={} ", tile.mailbox().published()),
            Style::default().fg(palette.muted),
        )),
        ConnectionState::Failed | ConnectionState::Connecting => {
            if let Some(err) = tile.last_error() {
                let short: String = err.chars().take(TITLE_ERROR_CHARS).collect();
                title.push(Span::styled(
                    format!("| {short} "),
                    Style::default().fg(palette.muted),
                ));
            }
        }
        ConnectionState::Disabled => {}
    }

    Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(border))
        .style(Style::default().bg(palette.background))
        .title(Line::from(title))
}

fn state_color(state: ConnectionState, palette: &Palette) -> Color {
    match state {
        ConnectionState::Streaming => palette.streaming,
        ConnectionState::Connecting => palette.connecting,
        ConnectionState::Failed => palette.error,
        ConnectionState::Disabled => palette.muted,
    }
}

fn action_hint_spans(
    hints: &[(&'static str, &'static str)],
    palette: &Palette,
) -> Vec<Span<'static>> {
    let mut spans = Vec::new();
    for (idx, (key, label)) in hints.iter().enumerate() {
        if idx > 0 {
            spans.push(Span::styled("  |  ", Style::default().fg(palette.border)));
        }
        spans.push(Span::styled(
            format!("[{key}]"),
            Style::default()
                .fg(palette.accent)
                .add_modifier(Modifier::BOLD),
        ));
        spans.push(Span::styled(
            format!(" {label}"),
            Style::default().fg(palette.muted),
        ));
    }
    spans
}

/// Paints a [`Surface`] into a slot's inner area; one cell holds two
/// vertically stacked pixels.
struct SurfaceWidget<'a> {
    surface: &'a Surface,
}

impl Widget for SurfaceWidget<'_> {
    fn render(self, area: Rect, buf: &mut Buffer) {
        match self.surface {
            Surface::Blank { bg } => paint_half_blocks(area, buf, |_, _| *bg),
            Surface::Picture(picture) => paint_half_blocks(area, buf, |x, y| {
                picture
                    .pixel(x, y)
                    .map_or(Color::Rgb(0, 0, 0), |(r, g, b)| Color::Rgb(r, g, b))
            }),
            Surface::Status { lines, fg, bg } => {
                paint_half_blocks(area, buf, |_, _| *bg);
                let height = u16::try_from(lines.len()).unwrap_or(u16::MAX).min(area.height);
                let text_area = Rect {
                    y: area.y + (area.height - height) / 2,
                    height,
                    ..area
                };
                let text: Vec<Line> = lines.iter().map(|line| Line::from(line.as_str())).collect();
                Paragraph::new(text)
                    .alignment(Alignment::Center)
                    .style(Style::default().fg(*fg).bg(*bg))
                    .render(text_area, buf);
            }
            Surface::ErrorGlyph { fg, bg } => {
                let width = usize::from(area.width);
                let height = usize::from(area.height) * 2;
                paint_half_blocks(area, buf, |x, y| {
                    if on_cross(x, y, width, height) { *fg } else { *bg }
                });
            }
        }
    }
}

fn paint_half_blocks(area: Rect, buf: &mut Buffer, pixel: impl Fn(usize, usize) -> Color) {
    for row in 0..area.height {
        for col in 0..area.width {
            let (x, y) = (usize::from(col), usize::from(row) * 2);
            if let Some(cell) = buf.cell_mut((area.x + col, area.y + row)) {
                cell.set_symbol(HALF_BLOCK)
                    .set_fg(pixel(x, y))
                    .set_bg(pixel(x, y + 1));
            }
        }
    }
}

/// Whether pixel `(x, y)` lies on the diagonals of the centred square that
/// covers most of a `width` x `height` area.
fn on_cross(x: usize, y: usize, width: usize, height: usize) -> bool {
    let side = width.min(height) * 4 / 5;
    if side < 2 {
        return false;
    }
    let left = (width - side) / 2;
    let top = (height - side) / 2;
    if x < left || y < top || x >= left + side || y >= top + side {
        return false;
    }

    let (dx, dy) = (x - left, y - top);
    let thickness = (side / 10).max(1);
    dx.abs_diff(dy) <= thickness || (dx + dy).abs_diff(side - 1) <= thickness
}
