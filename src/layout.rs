//! Grid / fullscreen arrangement and the global fill mode.

use crate::config::SLOT_COUNT;
use ratatui::layout::{Constraint, Direction, Layout, Position, Rect};

const GRID_ROWS: usize = 2;
const GRID_COLS: usize = 2;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum FillMode {
    /// Preserve aspect ratio and letterbox.
    #[default]
    Contain,
    /// Stretch to the slot, ignoring aspect ratio.
    Stretch,
}

impl FillMode {
    #[must_use]
    pub const fn toggled(self) -> Self {
        match self {
            Self::Contain => Self::Stretch,
            Self::Stretch => Self::Contain,
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            Self::Contain => "contain",
            Self::Stretch => "fill",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct LayoutState {
    pub fullscreen: Option<usize>,
    pub fill_mode: FillMode,
}

/// Owns [`LayoutState`]; only the UI thread talks to it.
#[derive(Debug, Clone)]
pub struct LayoutController {
    state: LayoutState,
    clickable: [bool; SLOT_COUNT],
}

impl LayoutController {
    pub fn new(clickable: [bool; SLOT_COUNT]) -> Self {
        Self {
            state: LayoutState::default(),
            clickable,
        }
    }

    pub fn state(&self) -> LayoutState {
        self.state
    }

    pub fn fill_mode(&self) -> FillMode {
        self.state.fill_mode
    }

    pub fn is_clickable(&self, slot: usize) -> bool {
        self.clickable.get(slot).copied().unwrap_or(false)
    }

    /// Click on `slot`: enter fullscreen, leave it, or switch target.
    /// Returns whether the layout changed.
    pub fn click(&mut self, slot: usize) -> bool {
        if !self.is_clickable(slot) {
            return false;
        }
        self.state.fullscreen = match self.state.fullscreen {
            Some(current) if current == slot => None,
            _ => Some(slot),
        };
        true
    }

    pub fn escape(&mut self) -> bool {
        self.state.fullscreen.take().is_some()
    }

    pub fn toggle_fill(&mut self) -> FillMode {
        self.state.fill_mode = self.state.fill_mode.toggled();
        self.state.fill_mode
    }

    /// Area of every slot; hidden slots get an empty rect.
    pub fn slot_rects(&self, area: Rect) -> [Rect; SLOT_COUNT] {
        if let Some(slot) = self.state.fullscreen {
            let mut rects = [Rect::default(); SLOT_COUNT];
            rects[slot] = area;
            return rects;
        }

        let grid = build_grid_rects(area, GRID_ROWS, GRID_COLS);
        std::array::from_fn(|idx| grid.get(idx).copied().unwrap_or_default())
    }
}

pub fn hit_test(rects: &[Rect; SLOT_COUNT], column: u16, row: u16) -> Option<usize> {
    let position = Position::new(column, row);
    rects
        .iter()
        .position(|rect| !rect.is_empty() && rect.contains(position))
}

fn build_grid_rects(area: Rect, rows: usize, cols: usize) -> Vec<Rect> {
    let row_chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints(vec![Constraint::Fill(1); rows.max(1)])
        .split(area);

    let mut rects = Vec::with_capacity(rows.saturating_mul(cols));
    for row_area in row_chunks.iter().copied() {
        let col_chunks = Layout::default()
            .direction(Direction::Horizontal)
            .constraints(vec![Constraint::Fill(1); cols.max(1)])
            .split(row_area);
        rects.extend(col_chunks.iter().copied());
    }

    rects
}
