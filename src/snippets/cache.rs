//! Content-addressed snippet cache, persisted as JSON.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Snippet, SnippetMode};
use crate::matrix::Frame;

const CACHE_VERSION: u32 = 1;

/// Rendered result of one snippet.
///
/// Exactly one of `frames` (non-empty) or `error` is meaningful.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    /// Short human-readable key, e.g. `lua-grid-3f2a9c01`.
    pub key: String,
    /// Fence language tag.
    pub language: String,
    /// Grid or anim.
    pub mode: SnippetMode,
    /// Source exactly as fenced.
    pub code: String,
    /// Full SHA-256 of (mode, code). The lookup key.
    pub code_hash: String,
    /// Frames after mode shaping; empty on error.
    pub frames: Vec<Frame>,
    /// Times to play; 0 means forever.
    pub loop_count: u32,
    /// Learner-facing failure, or the no-frames notice.
    pub error: Option<String>,
    /// When the snippet was rendered.
    pub created_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Empty entry for `snippet`, to be filled by the renderer.
    pub fn new(snippet: &Snippet, code_hash: String) -> Self {
        let key = format!(
            "{}-{}-{}",
            snippet.language,
            snippet.mode,
            code_hash.get(..8).unwrap_or(&code_hash)
        );
        Self {
            key,
            language: snippet.language.clone(),
            mode: snippet.mode,
            code: snippet.code.clone(),
            code_hash,
            frames: Vec::new(),
            loop_count: 0,
            error: None,
            created_at: Utc::now(),
        }
    }

    /// Whether the snippet rendered frames.
    pub fn is_ok(&self) -> bool {
        self.error.is_none() && !self.frames.is_empty()
    }
}

#[derive(Serialize, Deserialize)]
struct CacheFile {
    version: u32,
    entries: Vec<CacheEntry>,
}

/// Snippet results keyed by code hash.
#[derive(Debug, Default)]
pub struct SnippetCache {
    path: Option<PathBuf>,
    entries: BTreeMap<String, CacheEntry>,
    dirty: bool,
}

impl SnippetCache {
    /// Cache that never touches disk.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load the cache at `path`. A missing file is an empty cache.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut cache = Self {
            path: Some(path.clone()),
            ..Self::default()
        };

        if !path.exists() {
            log::debug!("No snippet cache at {}", path.display());
            return Ok(cache);
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read snippet cache {}", path.display()))?;
        let file: CacheFile = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse snippet cache {}", path.display()))?;

        if file.version != CACHE_VERSION {
            log::warn!(
                "Ignoring snippet cache version {} (expected {CACHE_VERSION})",
                file.version
            );
            return Ok(cache);
        }

        cache.entries = file
            .entries
            .into_iter()
            .map(|entry| (entry.code_hash.clone(), entry))
            .collect();
        log::debug!("Loaded {} cached snippet(s)", cache.entries.len());
        Ok(cache)
    }

    /// Backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Entry for `code_hash`.
    pub fn get(&self, code_hash: &str) -> Option<&CacheEntry> {
        self.entries.get(code_hash)
    }

    /// Insert or replace by code hash.
    pub fn insert(&mut self, entry: CacheEntry) {
        self.entries.insert(entry.code_hash.clone(), entry);
        self.dirty = true;
    }

    /// Number of cached snippets.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Write the cache if it changed since load. No-op for in-memory caches.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or file cannot be written.
    pub fn save(&mut self) -> Result<()> {
        let Some(path) = self.path.as_ref() else {
            return Ok(());
        };
        if !self.dirty {
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let file = CacheFile {
            version: CACHE_VERSION,
            entries: self.entries.values().cloned().collect(),
        };
        let content =
            serde_json::to_string_pretty(&file).context("Failed to serialize snippet cache")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write snippet cache {}", path.display()))?;

        self.dirty = false;
        log::debug!("Saved {} snippet(s) to {}", self.entries.len(), path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::{colors, Matrix};
    use tempfile::TempDir;

    fn entry() -> CacheEntry {
        let snippet = Snippet {
            language: "lua".to_string(),
            mode: SnippetMode::Grid,
            code: "background(red)\n".to_string(),
            line: 1,
        };
        let mut entry = CacheEntry::new(&snippet, snippet.hash());
        let mut matrix = Matrix::new();
        matrix.background(colors::RED);
        entry.frames.push(Frame::new(&matrix, 1000));
        entry.loop_count = 1;
        entry
    }

    #[test]
    fn test_key_uses_hash_prefix() {
        let entry = entry();
        assert!(entry.key.starts_with("lua-grid-"));
        assert!(entry.code_hash.starts_with(entry.key.trim_start_matches("lua-grid-")));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("snippets.json");

        let mut cache = SnippetCache::load(&path).unwrap();
        assert!(cache.is_empty());
        let entry = entry();
        cache.insert(entry.clone());
        cache.save().unwrap();

        let reloaded = SnippetCache::load(&path).unwrap();
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.get(&entry.code_hash), Some(&entry));
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("snippets.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(SnippetCache::load(&path).is_err());
    }

    #[test]
    fn test_in_memory_save_is_noop() {
        let mut cache = SnippetCache::in_memory();
        cache.insert(entry());
        assert!(cache.save().is_ok());
        assert!(cache.path().is_none());
    }
}
