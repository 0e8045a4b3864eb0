//! CLI subcommand implementations for `imagi`.
//!
//! Commands are organized into submodules by domain:
//!
//! - [`script`] - Run, preview and encode learner scripts
//! - [`docs`] - Render documentation snippets through the cache
//!
//! # Usage
//!
//! ```ignore
//! use imagi::commands;
//!
//! commands::script::run("blink.lua", PreviewStyle::Color).await?;
//! commands::docs::render("lesson.md", None).await?;
//! ```

pub mod docs;
pub mod script;

use std::path::PathBuf;

use anyhow::{Context, Result};

/// Expand `~` and read a UTF-8 file.
pub(crate) fn read_source(path: &str) -> Result<(PathBuf, String)> {
    let expanded = PathBuf::from(shellexpand::tilde(path).as_ref());
    let content = std::fs::read_to_string(&expanded)
        .with_context(|| format!("Failed to read {}", expanded.display()))?;
    Ok((expanded, content))
}

#[doc(inline)]
pub use docs::render as render_docs;
#[doc(inline)]
pub use script::{packets, play, run, text};
