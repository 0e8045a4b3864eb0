//! Source rewriting applied before a script runs.
//!
//! Learner code may omit the `require("imagi")` line and the final
//! `render()` call. [`normalize`] adds whichever is missing and records how
//! many lines were injected ahead of the learner's first line, so every error
//! message can be mapped back onto the line numbers the learner sees.

/// Chunk name given to learner code; Lua prefixes positions with it.
pub const CHUNK_NAME: &str = "script";

/// Import line inserted when the script lacks one.
pub const IMPORT_LINE: &str = r#"require("imagi")"#;

/// Lines injected ahead of learner code: the import plus one blank line.
pub const INJECTED_LINE_OFFSET: usize = 2;

/// Render call appended when the script does not end with one.
const RENDER_CALL: &str = "render()";

/// Spellings of the import accepted as "already present".
const IMPORT_FORMS: [&str; 4] = [
    r#"require("imagi")"#,
    "require('imagi')",
    r#"require "imagi""#,
    "require 'imagi'",
];

/// A script ready to hand to the interpreter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedScript {
    /// Rewritten source.
    pub source: String,
    /// Lines inserted before the learner's first line.
    pub line_offset: usize,
}

impl NormalizedScript {
    /// Rewrite `script:N:` positions in `message` into learner line numbers.
    ///
    /// Positions never drop below line 1, so a fault inside injected code is
    /// reported against the first line.
    #[must_use]
    pub fn adjust_message(&self, message: &str) -> String {
        adjust_line_numbers(message, self.line_offset)
    }
}

/// Whether `code` already imports the drawing API outside a comment.
#[must_use]
pub fn has_import(code: &str) -> bool {
    code.lines().any(|line| {
        let line = line.split("--").next().unwrap_or_default().trim();
        IMPORT_FORMS.iter().any(|form| line.contains(form))
    })
}

/// Whether the last non-blank line is a call to `render` on its own.
#[must_use]
pub fn ends_with_render(code: &str) -> bool {
    code.lines()
        .map(str::trim)
        .rfind(|line| !line.is_empty())
        .is_some_and(|line| {
            let line = line.trim_end_matches(';').trim_end();
            line.starts_with("render(") && line.ends_with(')')
        })
}

/// Add the import and trailing render call where missing.
#[must_use]
pub fn normalize(code: &str) -> NormalizedScript {
    let (mut source, line_offset) = if has_import(code) {
        (String::with_capacity(code.len() + RENDER_CALL.len() + 2), 0)
    } else {
        let mut source = String::with_capacity(code.len() + IMPORT_LINE.len() + RENDER_CALL.len() + 4);
        source.push_str(IMPORT_LINE);
        source.push_str("\n\n");
        (source, INJECTED_LINE_OFFSET)
    };
    source.push_str(code);

    if !ends_with_render(code) {
        if !source.ends_with('\n') {
            source.push('\n');
        }
        source.push_str(RENDER_CALL);
        source.push('\n');
    }

    NormalizedScript {
        source,
        line_offset,
    }
}

/// Shift every `script:N:` position in `message` back by `offset` lines.
#[must_use]
pub fn adjust_line_numbers(message: &str, offset: usize) -> String {
    if offset == 0 {
        return message.to_string();
    }

    let marker = format!("{CHUNK_NAME}:");
    let mut out = String::with_capacity(message.len());
    let mut rest = message;

    while let Some(pos) = rest.find(&marker) {
        let after_marker = pos + marker.len();
        out.push_str(&rest[..after_marker]);
        rest = &rest[after_marker..];

        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        let line = rest[..digits].parse::<usize>().ok();
        match line {
            Some(line) if rest[digits..].starts_with(':') => {
                out.push_str(&line.saturating_sub(offset).max(1).to_string());
                rest = &rest[digits..];
            }
            _ => {}
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inserts_import_and_render() {
        let script = normalize("m:set(0, 0, red)");
        assert_eq!(script.line_offset, 2);
        assert_eq!(script.source, "require(\"imagi\")\n\nm:set(0, 0, red)\nrender()\n");
    }

    #[test]
    fn test_keeps_existing_import() {
        let script = normalize("require('imagi')\nbackground(red)\nrender()");
        assert_eq!(script.line_offset, 0);
        assert_eq!(script.source, "require('imagi')\nbackground(red)\nrender()");
    }

    #[test]
    fn test_commented_import_is_not_an_import() {
        assert!(!has_import("-- require(\"imagi\")\nbackground(red)"));
        assert!(!has_import("x = 1 -- require('imagi')"));
        assert!(has_import("require('imagi') -- drawing API"));

        let script = normalize("-- require(\"imagi\")\nbackground(red)");
        assert_eq!(script.line_offset, 2);
        assert!(script.source.starts_with("require(\"imagi\")\n\n-- require"));
    }

    #[test]
    fn test_render_detection() {
        assert!(ends_with_render("x = 1\nrender()\n\n"));
        assert!(ends_with_render("render(anim, 200);"));
        assert!(!ends_with_render("render()\nx = 1"));
        assert!(!ends_with_render("-- render()"));
        assert!(!ends_with_render(""));
    }

    #[test]
    fn test_empty_script_still_renders() {
        let script = normalize("");
        assert!(script.source.ends_with("render()\n"));
    }

    #[test]
    fn test_adjust_line_numbers() {
        assert_eq!(
            adjust_line_numbers("script:5: unexpected symbol near 'x'", 2),
            "script:3: unexpected symbol near 'x'"
        );
        assert_eq!(
            adjust_line_numbers("script:1: boom", 2),
            "script:1: boom",
            "positions inside the injected prefix clamp to line 1"
        );
        assert_eq!(adjust_line_numbers("script:7: a; script:9: b", 2), "script:5: a; script:7: b");
        assert_eq!(adjust_line_numbers("script:x: odd", 2), "script:x: odd");
        assert_eq!(adjust_line_numbers("script:4: same", 0), "script:4: same");
    }
}
