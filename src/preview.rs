//! Terminal preview of the 8x8 matrix.
//!
//! Two styles: truecolour blocks via `crossterm` for interactive use, and a
//! plain ASCII grid for logs and tests.

use std::fmt::Write as _;
use std::io::Write;

use crossterm::{
    cursor,
    execute, queue,
    style::{Color, Print, Stylize},
};

use crate::constants::MATRIX_SIZE;
use crate::matrix::{Matrix, Pixel};

/// How pixels are drawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PreviewStyle {
    /// Two full blocks per pixel in the pixel's colour.
    #[default]
    Color,
    /// `#` for lit pixels, `.` for off.
    Ascii,
}

fn cell(pixel: Pixel, style: PreviewStyle) -> String {
    match style {
        PreviewStyle::Ascii => {
            let mark = if pixel.is_off() { "." } else { "#" };
            mark.to_string()
        }
        PreviewStyle::Color => {
            if pixel.is_off() {
                "· ".dark_grey().to_string()
            } else {
                "██"
                    .with(Color::Rgb {
                        r: pixel.r,
                        g: pixel.g,
                        b: pixel.b,
                    })
                    .to_string()
            }
        }
    }
}

/// The matrix as eight lines, top row first.
pub fn render_matrix(matrix: &Matrix, style: PreviewStyle) -> String {
    let mut out = String::new();
    for (y, row) in matrix.rows().iter().enumerate() {
        for pixel in row {
            out.push_str(&cell(*pixel, style));
        }
        if y + 1 < MATRIX_SIZE {
            out.push('\n');
        }
    }
    out
}

/// Space-separated lowercase hex.
pub fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for (i, byte) in bytes.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Redraws a matrix in place, for animated previews.
///
/// Hides the cursor while alive and shows it again on drop, including on
/// panic.
#[derive(Debug)]
pub struct LivePreview {
    style: PreviewStyle,
    drawn: bool,
}

impl LivePreview {
    /// Start a preview, hiding the cursor until the preview is dropped.
    pub fn new(style: PreviewStyle) -> Self {
        let _ = execute!(std::io::stdout(), cursor::Hide);
        Self {
            style,
            drawn: false,
        }
    }

    /// Draw `matrix` over the previous drawing with a status line below.
    ///
    /// # Errors
    ///
    /// Returns an error if stdout cannot be written.
    pub fn draw(&mut self, matrix: &Matrix, status: &str) -> std::io::Result<()> {
        let mut stdout = std::io::stdout().lock();
        if self.drawn {
            // Matrix rows plus the status line.
            queue!(stdout, cursor::MoveToPreviousLine(MATRIX_SIZE as u16 + 1))?;
        }
        queue!(
            stdout,
            Print(render_matrix(matrix, self.style)),
            Print("\n"),
            crossterm::terminal::Clear(crossterm::terminal::ClearType::CurrentLine),
            Print(status),
            Print("\n"),
        )?;
        stdout.flush()?;
        self.drawn = true;
        Ok(())
    }
}

impl Drop for LivePreview {
    fn drop(&mut self) {
        let _ = execute!(std::io::stdout(), cursor::Show);
    }
}
