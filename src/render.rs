//! Per-tick conversion of slot state into something displayable.
//!
//! Runs on the UI thread only and never touches the network: it reads the
//! tile state and the mailbox and nothing else.

use crate::config::SLOT_COUNT;
use crate::error::StreamError;
use crate::layout::FillMode;
use crate::mailbox::{Frame, PixelLayout};
use crate::state::{ConnectionState, TileState};
use fast_image_resize as fir;
use ratatui::style::Color;
use std::time::Duration;
use tracing::debug;

pub const RENDER_INTERVAL: Duration = Duration::from_millis(100);

/// One phase per tick, so a full sweep takes 1.2 s.
pub const SPINNER_PHASES: [&str; 12] = [
    "●      ",
    " ●     ",
    "  ●    ",
    "   ●   ",
    "    ●  ",
    "     ● ",
    "      ●",
    "     ● ",
    "    ●  ",
    "   ●   ",
    "  ●    ",
    " ●     ",
];

/// Colours used by the wall. Slots sit on black, placeholders are white
/// and a failed slot is marked in red.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Palette {
    pub background: Color,
    pub text: Color,
    pub muted: Color,
    pub border: Color,
    pub accent: Color,
    pub streaming: Color,
    pub connecting: Color,
    pub error: Color,
}

impl Palette {
    pub const WALL: Self = Self {
        background: Color::Rgb(0, 0, 0),
        text: Color::Rgb(255, 255, 255),
        muted: Color::Rgb(145, 152, 170),
        border: Color::Rgb(88, 98, 120),
        accent: Color::Rgb(102, 216, 255),
        streaming: Color::Rgb(103, 212, 142),
        connecting: Color::Rgb(255, 198, 109),
        error: Color::Rgb(255, 0, 0),
    };
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PixelSize {
    pub width: usize,
    pub height: usize,
}

impl PixelSize {
    pub const fn new(width: usize, height: usize) -> Self {
        Self { width, height }
    }

    const fn is_empty(self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Packed RGB picture already sized for its slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Picture {
    pub width: usize,
    pub height: usize,
    pub rgb: Vec<u8>,
}

impl Picture {
    pub fn pixel(&self, x: usize, y: usize) -> Option<(u8, u8, u8)> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let idx = (y * self.width + x) * 3;
        let px = self.rgb.get(idx..idx + 3)?;
        Some((px[0], px[1], px[2]))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Surface {
    Blank { bg: Color },
    Picture(Picture),
    Status { lines: Vec<String>, fg: Color, bg: Color },
    /// Large cross drawn over the whole slot.
    ErrorGlyph { fg: Color, bg: Color },
}

pub struct Renderer {
    palette: Palette,
    spinner: [usize; SLOT_COUNT],
    resizer: fir::Resizer,
    options: fir::ResizeOptions,
    converted: Vec<u8>,
}

impl Renderer {
    pub fn new(palette: Palette) -> Self {
        Self {
            palette,
            spinner: [0; SLOT_COUNT],
            resizer: fir::Resizer::new(),
            options: fir::ResizeOptions::new()
                .resize_alg(fir::ResizeAlg::Convolution(fir::FilterType::Bilinear)),
            converted: Vec::new(),
        }
    }

    pub fn palette(&self) -> &Palette {
        &self.palette
    }

    /// Surface for one slot this tick. `State` wins over a held frame: a
    /// stale frame is never shown once the worker has left `Streaming`.
    pub fn render_slot(
        &mut self,
        slot: usize,
        tile: &TileState,
        label: &str,
        size: PixelSize,
        fill: FillMode,
    ) -> Surface {
        match tile.state() {
            ConnectionState::Disabled => Surface::Blank {
                bg: self.palette.background,
            },
            ConnectionState::Connecting => self.connecting(slot, label),
            ConnectionState::Failed => self.error_glyph(),
            ConnectionState::Streaming => {
                let Some(frame) = tile.mailbox().read() else {
                    return self.connecting(slot, label);
                };
                match self.scale_frame(&frame, size, fill) {
                    Ok(picture) => Surface::Picture(picture),
                    Err(err) => {
                        debug!(slot, "frame not renderable this tick: {err}");
                        self.error_glyph()
                    }
                }
            }
        }
    }

    fn connecting(&mut self, slot: usize, label: &str) -> Surface {
        let phase = self.spinner.get_mut(slot).map_or(0, |phase| {
            let current = *phase;
            *phase = (current + 1) % SPINNER_PHASES.len();
            current
        });
        Surface::Status {
            lines: vec![label.to_owned(), SPINNER_PHASES[phase].to_owned()],
            fg: self.palette.text,
            bg: self.palette.background,
        }
    }

    fn error_glyph(&self) -> Surface {
        Surface::ErrorGlyph {
            fg: self.palette.error,
            bg: self.palette.background,
        }
    }

    fn scale_frame(
        &mut self,
        frame: &Frame,
        size: PixelSize,
        fill: FillMode,
    ) -> Result<Picture, StreamError> {
        if frame.width == 0 || frame.height == 0 {
            return Err(StreamError::Decode("frame has no pixels".to_owned()));
        }
        if frame.pixels.len() != frame.expected_len() {
            return Err(StreamError::Decode(format!(
                "frame buffer holds {} bytes, expected {}",
                frame.pixels.len(),
                frame.expected_len()
            )));
        }
        if size.is_empty() {
            return Ok(Picture {
                width: size.width,
                height: size.height,
                rgb: Vec::new(),
            });
        }

        let src_rgb: &[u8] = match frame.layout {
            PixelLayout::Rgb8 => &frame.pixels,
            PixelLayout::Bgr8 => {
                swap_red_blue(&frame.pixels, &mut self.converted);
                &self.converted
            }
        };

        let (fit_width, fit_height) = match fill {
            FillMode::Stretch => (size.width, size.height),
            FillMode::Contain => fit_within(frame.width, frame.height, size.width, size.height),
        };

        let mut scaled = vec![0_u8; fit_width * fit_height * 3];
        {
            let src = fir::images::ImageRef::new(
                to_u32(frame.width)?,
                to_u32(frame.height)?,
                src_rgb,
                fir::PixelType::U8x3,
            )
            .map_err(StreamError::decode)?;
            let mut dst = fir::images::Image::from_slice_u8(
                to_u32(fit_width)?,
                to_u32(fit_height)?,
                scaled.as_mut_slice(),
                fir::PixelType::U8x3,
            )
            .map_err(StreamError::decode)?;
            self.resizer
                .resize(&src, &mut dst, Some(&self.options))
                .map_err(StreamError::decode)?;
        }

        if fit_width == size.width && fit_height == size.height {
            return Ok(Picture {
                width: fit_width,
                height: fit_height,
                rgb: scaled,
            });
        }

        Ok(letterbox(
            &scaled,
            fit_width,
            fit_height,
            size,
            rgb_of(self.palette.background),
        ))
    }
}

/// Largest size with the source aspect ratio that fits inside the target.
pub fn fit_within(
    src_width: usize,
    src_height: usize,
    dst_width: usize,
    dst_height: usize,
) -> (usize, usize) {
    if src_width == 0 || src_height == 0 || dst_width == 0 || dst_height == 0 {
        return (dst_width, dst_height);
    }

    let (width, height) =
        if dst_width.saturating_mul(src_height) > dst_height.saturating_mul(src_width) {
            let w = (dst_height.saturating_mul(src_width) / src_height).max(1);
            (w, dst_height)
        } else {
            let h = (dst_width.saturating_mul(src_height) / src_width).max(1);
            (dst_width, h)
        };

    (width.min(dst_width), height.min(dst_height))
}

fn letterbox(
    content: &[u8],
    content_width: usize,
    content_height: usize,
    size: PixelSize,
    bg: (u8, u8, u8),
) -> Picture {
    let mut rgb = Vec::with_capacity(size.width * size.height * 3);
    for _ in 0..size.width * size.height {
        rgb.extend_from_slice(&[bg.0, bg.1, bg.2]);
    }

    let offset_x = (size.width - content_width) / 2;
    let offset_y = (size.height - content_height) / 2;
    let row_bytes = content_width * 3;
    for row in 0..content_height {
        let src_start = row * row_bytes;
        let dst_start = ((offset_y + row) * size.width + offset_x) * 3;
        rgb[dst_start..dst_start + row_bytes]
            .copy_from_slice(&content[src_start..src_start + row_bytes]);
    }

    Picture {
        width: size.width,
        height: size.height,
        rgb,
    }
}

fn swap_red_blue(bgr: &[u8], out: &mut Vec<u8>) {
    out.clear();
    out.reserve(bgr.len());
    for px in bgr.chunks_exact(3) {
        out.extend_from_slice(&[px[2], px[1], px[0]]);
    }
}

fn to_u32(value: usize) -> Result<u32, StreamError> {
    u32::try_from(value).map_err(StreamError::decode)
}

fn rgb_of(color: Color) -> (u8, u8, u8) {
    match color {
        Color::Rgb(r, g, b) => (r, g, b),
        Color::White => (255, 255, 255),
        _ => (0, 0, 0),
    }
}
