//! Pixel grid, frame and animation model.
//!
//! This is the data model shared by the sandbox (which mutates a live
//! [`Matrix`] while a script draws), the codec (which flattens snapshots into
//! wire packets), the playback scheduler and the snippet cache.
//!
//! # Ownership
//!
//! - [`Matrix`] is mutated in place by drawing operations.
//! - [`Frame`] holds a deep copy taken at a point in time and never aliases
//!   the live matrix.
//! - [`Animation`] owns its frames while a script accumulates them; a render
//!   copies them out by value.

pub mod font;

use serde::{Deserialize, Serialize};

use crate::codec::clamp_byte;
use crate::constants::{
    GLYPH_WIDTH, MATRIX_SIZE, MAX_FRAME_DURATION_MS, MIN_FRAME_DURATION_MS, SCROLL_WINDOW,
};

/// One RGB pixel, each channel already clamped to `0..=255`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pixel {
    /// Red channel.
    pub r: u8,
    /// Green channel.
    pub g: u8,
    /// Blue channel.
    pub b: u8,
}

impl Pixel {
    /// All channels off.
    pub const OFF: Self = Self::new(0, 0, 0);

    /// Create a pixel from byte channels.
    #[must_use]
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Create a pixel from arbitrary numeric channels, clamping each.
    #[must_use]
    pub fn from_components(r: f64, g: f64, b: f64) -> Self {
        Self::new(clamp_byte(r), clamp_byte(g), clamp_byte(b))
    }

    /// Whether every channel is zero.
    #[must_use]
    pub fn is_off(self) -> bool {
        self == Self::OFF
    }
}

/// Named colours exposed to scripts.
pub mod colors {
    use super::Pixel;

    /// Pure red.
    pub const RED: Pixel = Pixel::new(255, 0, 0);
    /// Orange.
    pub const ORANGE: Pixel = Pixel::new(255, 128, 0);
    /// Yellow.
    pub const YELLOW: Pixel = Pixel::new(255, 255, 0);
    /// Pure green.
    pub const GREEN: Pixel = Pixel::new(0, 255, 0);
    /// Cyan.
    pub const CYAN: Pixel = Pixel::new(0, 255, 255);
    /// Pure blue.
    pub const BLUE: Pixel = Pixel::new(0, 0, 255);
    /// Purple.
    pub const PURPLE: Pixel = Pixel::new(128, 0, 255);
    /// Pink.
    pub const PINK: Pixel = Pixel::new(255, 0, 128);
    /// White; also exported as `on`.
    pub const WHITE: Pixel = Pixel::new(255, 255, 255);
    /// Black; also exported as `off`.
    pub const BLACK: Pixel = Pixel::new(0, 0, 0);

    /// Script-visible names, in registration order.
    pub const NAMED: [(&str, Pixel); 10] = [
        ("red", RED),
        ("orange", ORANGE),
        ("yellow", YELLOW),
        ("green", GREEN),
        ("cyan", CYAN),
        ("blue", BLUE),
        ("purple", PURPLE),
        ("pink", PINK),
        ("white", WHITE),
        ("black", BLACK),
    ];
}

/// Errors raised while building a matrix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatrixError {
    /// The source was not an 8x8 nested sequence of pixels.
    InvalidSource(String),
}

impl std::fmt::Display for MatrixError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidSource(msg) => write!(f, "Invalid matrix source: {msg}"),
        }
    }
}

impl std::error::Error for MatrixError {}

/// The 8x8 display grid, stored row-major.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Matrix {
    rows: [[Pixel; MATRIX_SIZE]; MATRIX_SIZE],
}

impl Matrix {
    /// Create an all-off matrix.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a matrix by copying an 8x8 nested sequence.
    ///
    /// # Errors
    ///
    /// Returns [`MatrixError::InvalidSource`] when the outer sequence or any
    /// row does not have exactly eight entries.
    pub fn from_rows<R: AsRef<[Pixel]>>(source: &[R]) -> Result<Self, MatrixError> {
        if source.len() != MATRIX_SIZE {
            return Err(MatrixError::InvalidSource(format!(
                "expected {MATRIX_SIZE} rows, got {}",
                source.len()
            )));
        }
        let mut matrix = Self::new();
        for (y, row) in source.iter().enumerate() {
            let row = row.as_ref();
            if row.len() != MATRIX_SIZE {
                return Err(MatrixError::InvalidSource(format!(
                    "row {y} has {} pixels, expected {MATRIX_SIZE}",
                    row.len()
                )));
            }
            matrix.rows[y].copy_from_slice(row);
        }
        Ok(matrix)
    }

    /// Rows of the grid, top to bottom.
    #[must_use]
    pub fn rows(&self) -> &[[Pixel; MATRIX_SIZE]; MATRIX_SIZE] {
        &self.rows
    }

    /// Iterate all 64 pixels in row-major order.
    pub fn pixels(&self) -> impl Iterator<Item = Pixel> + '_ {
        self.rows.iter().flat_map(|row| row.iter().copied())
    }

    /// Pixel at column `x`, row `y`, if in range.
    #[must_use]
    pub fn get(&self, x: usize, y: usize) -> Option<Pixel> {
        self.rows.get(y).and_then(|row| row.get(x)).copied()
    }

    /// Set the pixel at column `x`, row `y`. Returns `false` when out of range.
    pub fn set(&mut self, x: usize, y: usize, color: Pixel) -> bool {
        match self.rows.get_mut(y).and_then(|row| row.get_mut(x)) {
            Some(pixel) => {
                *pixel = color;
                true
            }
            None => false,
        }
    }

    /// Deep copy of the current state.
    #[must_use]
    pub fn snapshot(&self) -> Self {
        self.clone()
    }

    /// Set every pixel to `color`.
    pub fn background(&mut self, color: Pixel) {
        for row in &mut self.rows {
            row.fill(color);
        }
    }

    /// Draw the glyph for `ch` with its left edge at `x_offset`.
    ///
    /// Only lit glyph pixels are written. Columns outside the grid are
    /// clipped, and nothing is drawn when the offset lies outside `[-8, 8)`.
    pub fn character(&mut self, ch: char, color: Pixel, x_offset: i32) {
        let size = MATRIX_SIZE as i32;
        if !(-size..size).contains(&x_offset) {
            return;
        }
        let rows = font::glyph(ch);
        for (y, bits) in rows.iter().enumerate() {
            for col in 0..GLYPH_WIDTH {
                let x = x_offset + col;
                if (0..size).contains(&x) && bits & (0x80 >> col) != 0 {
                    self.rows[y][x as usize] = color;
                }
            }
        }
    }
}

/// Clamp a frame duration into the range the firmware accepts.
///
/// Non-finite input falls back to the minimum.
#[must_use]
pub fn clamp_duration(ms: f64) -> u32 {
    if ms.is_nan() {
        return MIN_FRAME_DURATION_MS;
    }
    ms.clamp(f64::from(MIN_FRAME_DURATION_MS), f64::from(MAX_FRAME_DURATION_MS)) as u32
}

/// A matrix snapshot with its display duration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    snapshot: Matrix,
    duration_ms: u32,
}

impl Frame {
    /// Snapshot `matrix`, clamping `duration_ms` into `[25, 16_777_215]`.
    #[must_use]
    pub fn new(matrix: &Matrix, duration_ms: u32) -> Self {
        Self {
            snapshot: matrix.snapshot(),
            duration_ms: duration_ms.clamp(MIN_FRAME_DURATION_MS, MAX_FRAME_DURATION_MS),
        }
    }

    /// The captured pixels.
    #[must_use]
    pub fn snapshot(&self) -> &Matrix {
        &self.snapshot
    }

    /// Display duration in milliseconds.
    #[must_use]
    pub fn duration_ms(&self) -> u32 {
        self.duration_ms
    }

    /// Same pixels with a different duration, bounded by `[min, max]`.
    #[must_use]
    pub fn with_duration_bounded(mut self, duration_ms: u32, min: u32, max: u32) -> Self {
        self.duration_ms = duration_ms.clamp(min, max);
        self
    }
}

/// Ordered frames plus a loop count (0 = repeat forever).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Animation {
    frames: Vec<Frame>,
    loop_count: u32,
}

impl Animation {
    /// Create an empty animation.
    #[must_use]
    pub fn new(loop_count: u32) -> Self {
        Self {
            frames: Vec::new(),
            loop_count,
        }
    }

    /// Append a snapshot of `matrix`.
    pub fn add_frame(&mut self, matrix: &Matrix, duration_ms: u32) {
        self.frames.push(Frame::new(matrix, duration_ms));
    }

    /// Drop all frames, keeping the loop count.
    pub fn clear(&mut self) {
        self.frames.clear();
    }

    /// Frames accumulated so far.
    #[must_use]
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    /// Number of accumulated frames.
    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether no frames have been added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Times the animation plays; 0 means forever.
    #[must_use]
    pub fn loop_count(&self) -> u32 {
        self.loop_count
    }

    /// Change the loop count.
    pub fn set_loop_count(&mut self, loop_count: u32) {
        self.loop_count = loop_count;
    }

    /// Append a marquee of `text` to this animation.
    ///
    /// For each character position a window of three glyphs (wrapping
    /// circularly over the text) is drawn at six successive offsets, one frame
    /// per offset, so `text` contributes `6 * len` frames. An empty string
    /// paints `back_color` onto `matrix` and adds nothing.
    pub fn append_scrolling_text(
        &mut self,
        matrix: &mut Matrix,
        text: &str,
        text_color: Pixel,
        back_color: Pixel,
        duration_ms: u32,
    ) {
        let chars: Vec<char> = text.chars().collect();
        if chars.is_empty() {
            matrix.background(back_color);
            return;
        }
        for start in 0..chars.len() {
            for shift in 0..GLYPH_WIDTH {
                matrix.background(back_color);
                for slot in 0..SCROLL_WINDOW {
                    let ch = chars[(start + slot) % chars.len()];
                    matrix.character(ch, text_color, slot as i32 * GLYPH_WIDTH - shift);
                }
                self.add_frame(matrix, duration_ms);
            }
        }
    }
}

/// Frames a marquee of `text` adds: six per character.
#[must_use]
pub fn scrolling_frame_count(text: &str) -> usize {
    text.chars().count().saturating_mul(GLYPH_WIDTH as usize)
}

/// Build a looping marquee animation for `text`.
///
/// See [`Animation::append_scrolling_text`] for the frame layout.
#[must_use]
pub fn scrolling_text(
    matrix: &mut Matrix,
    text: &str,
    text_color: Pixel,
    back_color: Pixel,
    duration_ms: u32,
    loop_count: u32,
) -> Animation {
    let mut animation = Animation::new(loop_count);
    animation.append_scrolling_text(matrix, text, text_color, back_color, duration_ms);
    animation
}
