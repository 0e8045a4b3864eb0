//! Documentation snippet renderer.
//!
//! Finds fenced blocks tagged `lua imagi-grid` or `lua imagi-anim` in a
//! markdown document, runs each through the sandbox once, and caches the
//! frames under a hash of (mode, code). Rendering the same page again reads
//! the cache and never re-executes a script.
//!
//! Failures stay per-snippet: a broken block yields an entry with no frames
//! and an error message, and the rest of the document still renders.

pub mod cache;

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::constants::{
    GRID_FRAME_DURATION_MS, MIN_FRAME_DURATION_MS, SNIPPET_MAX_FRAMES,
    SNIPPET_MAX_FRAME_DURATION_MS,
};
use crate::matrix::Frame;
use crate::sandbox::{Render, Sandbox};

pub use cache::{CacheEntry, SnippetCache};

/// Language tag a renderable fence must carry.
pub const SNIPPET_LANGUAGE: &str = "lua";

/// Reported when a script ran cleanly but rendered nothing.
pub const NO_FRAMES_MESSAGE: &str = "No frames generated.";

/// How a snippet's frames are presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnippetMode {
    /// One still picture.
    Grid,
    /// The full animation.
    Anim,
}

impl SnippetMode {
    /// Mode for a fence meta token such as `imagi-grid`.
    pub fn from_meta(token: &str) -> Option<Self> {
        match token {
            "imagi-grid" => Some(Self::Grid),
            "imagi-anim" => Some(Self::Anim),
            _ => None,
        }
    }

    /// Lowercase name used in hashes and the cache file.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Grid => "grid",
            Self::Anim => "anim",
        }
    }
}

impl fmt::Display for SnippetMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A renderable fenced block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snippet {
    /// Fence language tag.
    pub language: String,
    /// Presentation mode from the fence meta.
    pub mode: SnippetMode,
    /// Block body without the fences.
    pub code: String,
    /// 1-based line of the opening fence.
    pub line: usize,
}

impl Snippet {
    /// Cache key for this snippet.
    pub fn hash(&self) -> String {
        snippet_hash(self.mode, &self.code)
    }
}

/// A snippet paired with its (possibly cached) result.
#[derive(Debug, Clone)]
pub struct RenderedSnippet {
    /// The fenced block as found in the document.
    pub snippet: Snippet,
    /// Its frames or error.
    pub entry: CacheEntry,
    /// True when no script ran for this snippet.
    pub from_cache: bool,
}

/// SHA-256 hex digest of `"{mode}\n{code}"`.
pub fn snippet_hash(mode: SnippetMode, code: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(mode.as_str().as_bytes());
    hasher.update(b"\n");
    hasher.update(code.as_bytes());
    format!("{:x}", hasher.finalize())
}

struct OpenFence {
    marker: char,
    width: usize,
    indent: usize,
    snippet: Option<(String, SnippetMode, usize)>,
    body: Vec<String>,
}

/// Opening fence: marker char, run width, info string.
fn fence_open(line: &str) -> Option<(char, usize, usize, &str)> {
    let indent = line.len() - line.trim_start_matches(' ').len();
    if indent > 3 {
        return None;
    }
    let rest = &line[indent..];
    let marker = rest.chars().next().filter(|c| *c == '`' || *c == '~')?;
    let width = rest.chars().take_while(|c| *c == marker).count();
    if width < 3 {
        return None;
    }
    let info = rest[width..].trim();
    if marker == '`' && info.contains('`') {
        return None;
    }
    Some((marker, width, indent, info))
}

fn closes(line: &str, fence: &OpenFence) -> bool {
    let trimmed = line.trim_start_matches(' ');
    if line.len() - trimmed.len() > 3 {
        return false;
    }
    let width = trimmed.chars().take_while(|c| *c == fence.marker).count();
    width >= fence.width && trimmed[width * fence.marker.len_utf8()..].trim().is_empty()
}

/// Classify a fence info string; `None` for ordinary code blocks.
fn classify(info: &str) -> Option<(String, SnippetMode)> {
    let mut tokens = info.split_whitespace();
    let language = tokens.next()?;
    if !language.eq_ignore_ascii_case(SNIPPET_LANGUAGE) {
        return None;
    }
    let mode = tokens.find_map(SnippetMode::from_meta)?;
    Some((language.to_ascii_lowercase(), mode))
}

/// Every renderable snippet in `markdown`, in document order.
///
/// Other fenced blocks are skipped, including their bodies. An unclosed
/// fence runs to the end of the document.
pub fn parse_snippets(markdown: &str) -> Vec<Snippet> {
    let mut snippets = Vec::new();
    let mut open: Option<OpenFence> = None;

    for (index, line) in markdown.lines().enumerate() {
        match open.as_mut() {
            None => {
                if let Some((marker, width, indent, info)) = fence_open(line) {
                    open = Some(OpenFence {
                        marker,
                        width,
                        indent,
                        snippet: classify(info).map(|(lang, mode)| (lang, mode, index + 1)),
                        body: Vec::new(),
                    });
                }
            }
            Some(fence) => {
                if closes(line, fence) {
                    if let Some(done) = open.take() {
                        push_snippet(&mut snippets, done);
                    }
                } else {
                    let strip = line.len() - line.trim_start_matches(' ').len();
                    fence.body.push(line[strip.min(fence.indent)..].to_string());
                }
            }
        }
    }

    if let Some(done) = open {
        push_snippet(&mut snippets, done);
    }
    snippets
}

fn push_snippet(snippets: &mut Vec<Snippet>, fence: OpenFence) {
    if let Some((language, mode, line)) = fence.snippet {
        let mut code = fence.body.join("\n");
        if !code.is_empty() {
            code.push('\n');
        }
        snippets.push(Snippet {
            language,
            mode,
            code,
            line,
        });
    }
}

/// Post-process a render for documentation playback.
///
/// Grid keeps only the last frame, shown for 1000 ms once. Anim keeps at
/// most 256 frames with durations clamped to [25, 4000] ms.
fn shape_frames(mode: SnippetMode, render: Render) -> (Vec<Frame>, u32) {
    match mode {
        SnippetMode::Grid => {
            let frames = render
                .frames
                .into_iter()
                .last()
                .map(|frame| {
                    vec![frame.with_duration_bounded(
                        GRID_FRAME_DURATION_MS,
                        GRID_FRAME_DURATION_MS,
                        GRID_FRAME_DURATION_MS,
                    )]
                })
                .unwrap_or_default();
            (frames, 1)
        }
        SnippetMode::Anim => {
            let frames = render
                .frames
                .into_iter()
                .take(SNIPPET_MAX_FRAMES)
                .map(|frame| {
                    let duration = frame.duration_ms();
                    frame.with_duration_bounded(
                        duration,
                        MIN_FRAME_DURATION_MS,
                        SNIPPET_MAX_FRAME_DURATION_MS,
                    )
                })
                .collect();
            (frames, render.loop_count)
        }
    }
}

/// Run one snippet and build its cache entry. Never fails: errors land in
/// [`CacheEntry::error`].
///
/// Blocks for up to the sandbox timeout.
pub fn render_snippet(sandbox: &Sandbox, snippet: &Snippet) -> CacheEntry {
    let code_hash = snippet.hash();
    let mut entry = CacheEntry::new(snippet, code_hash);

    match sandbox.run(&snippet.code) {
        Ok(outcome) => {
            let shaped = outcome
                .into_last_render()
                .map(|render| shape_frames(snippet.mode, render))
                .filter(|(frames, _)| !frames.is_empty());
            match shaped {
                Some((frames, loop_count)) => {
                    entry.frames = frames;
                    entry.loop_count = loop_count;
                }
                None => entry.error = Some(NO_FRAMES_MESSAGE.to_string()),
            }
        }
        Err(e) => {
            log::debug!("Snippet at line {} failed: {e}", snippet.line);
            entry.error = Some(e.to_string());
        }
    }
    entry
}

/// Render every snippet in `markdown`, consulting `cache` first.
///
/// New entries are inserted into the cache; saving is left to the caller.
pub fn render_document(
    sandbox: &Sandbox,
    cache: &mut SnippetCache,
    markdown: &str,
) -> Vec<RenderedSnippet> {
    let snippets = parse_snippets(markdown);
    log::info!("Rendering {} snippet(s)", snippets.len());

    snippets
        .into_iter()
        .map(|snippet| {
            if let Some(entry) = cache.get(&snippet.hash()) {
                return RenderedSnippet {
                    entry: entry.clone(),
                    snippet,
                    from_cache: true,
                };
            }
            let entry = render_snippet(sandbox, &snippet);
            cache.insert(entry.clone());
            RenderedSnippet {
                snippet,
                entry,
                from_cache: false,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_depends_on_mode_and_code() {
        let a = snippet_hash(SnippetMode::Grid, "background(red)");
        assert_eq!(a, snippet_hash(SnippetMode::Grid, "background(red)"));
        assert_ne!(a, snippet_hash(SnippetMode::Anim, "background(red)"));
        assert_ne!(a, snippet_hash(SnippetMode::Grid, "background(reD)"));
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_parse_recognizes_tagged_fences() {
        let doc = "\
# Colours

```lua imagi-grid
background(red)
```

```lua
print('not a snippet')
```

~~~lua title=x imagi-anim
scrolling_text('HI', red, black)
~~~

```python imagi-grid
background(blue)
```
";
        let snippets = parse_snippets(doc);
        assert_eq!(snippets.len(), 2);
        assert_eq!(snippets[0].mode, SnippetMode::Grid);
        assert_eq!(snippets[0].code, "background(red)\n");
        assert_eq!(snippets[0].line, 3);
        assert_eq!(snippets[1].mode, SnippetMode::Anim);
        assert_eq!(snippets[1].code, "scrolling_text('HI', red, black)\n");
    }

    #[test]
    fn test_longer_fence_contains_shorter() {
        let doc = "````lua imagi-grid\n```\nbackground(red)\n````\n";
        let snippets = parse_snippets(doc);
        assert_eq!(snippets.len(), 1);
        assert_eq!(snippets[0].code, "```\nbackground(red)\n");
    }

    #[test]
    fn test_mode_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&SnippetMode::Anim).unwrap(), "\"anim\"");
    }
}
