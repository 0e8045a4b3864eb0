//! Documentation snippet rendering command.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Result};

use super::read_source;
use crate::config::Config;
use crate::sandbox::{Sandbox, SandboxConfig};
use crate::snippets::{render_document, RenderedSnippet, SnippetCache};

/// Render every snippet in `path`, reusing and updating the snippet cache.
///
/// Per-snippet failures are reported, not returned. Only I/O and cache
/// problems fail the command.
pub async fn render(path: &str, cache_path: Option<&str>) -> Result<()> {
    let config = Config::load()?;
    let (doc_path, markdown) = read_source(path)?;
    let cache_path = cache_path.map_or_else(
        || config.cache_path.clone(),
        |p| PathBuf::from(shellexpand::tilde(p).as_ref()),
    );

    let mut cache = SnippetCache::load(&cache_path)?;
    let sandbox = Arc::new(Sandbox::new(SandboxConfig::from(&config)).await?);

    // Snippets run synchronously; keep them off the async workers.
    let (rendered, mut cache) = tokio::task::spawn_blocking(move || {
        let rendered = render_document(&sandbox, &mut cache, &markdown);
        (rendered, cache)
    })
    .await
    .map_err(|e| anyhow!("Snippet task failed: {e}"))?;

    println!("{}", doc_path.display());
    for item in &rendered {
        println!("  {}", describe(item));
    }

    cache.save()?;
    let failed = rendered.iter().filter(|item| !item.entry.is_ok()).count();
    println!(
        "{} snippet(s), {} from cache, {} with errors",
        rendered.len(),
        rendered.iter().filter(|item| item.from_cache).count(),
        failed
    );
    Ok(())
}

fn describe(item: &RenderedSnippet) -> String {
    let source = if item.from_cache { "cached" } else { "rendered" };
    match &item.entry.error {
        Some(error) => format!(
            "line {} [{}] {}: error: {error}",
            item.snippet.line, item.snippet.mode, item.entry.key
        ),
        None => format!(
            "line {} [{}] {}: {} frame(s), loop {} ({source})",
            item.snippet.line,
            item.snippet.mode,
            item.entry.key,
            item.entry.frames.len(),
            item.entry.loop_count
        ),
    }
}
