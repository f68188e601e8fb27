use std::path::{Path, PathBuf};

use anyhow::Context as _;
use chrono::{DateTime, Utc};

/// Archive path for one fetched page: `<root>/<YYYY-MM-DD>/<site>_page<N>.html`.
pub fn raw_page_path(root: &Path, site_id: &str, page: u32, at: DateTime<Utc>) -> PathBuf {
    root.join(at.format("%Y-%m-%d").to_string())
        .join(format!("{site_id}_page{page}.html"))
}

/// Writes the raw response text before any parsing happens, so a selector
/// bug never loses the bytes. Re-fetching the same page on a resumed run
/// overwrites the previous snapshot.
pub fn write_raw_page(path: &Path, text: &str) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("raw page path must have parent: {}", path.display()))?;
    std::fs::create_dir_all(parent)
        .with_context(|| format!("create raw archive dir: {}", parent.display()))?;
    std::fs::write(path, text)
        .with_context(|| format!("write raw page: {}", path.display()))?;
    Ok(())
}
