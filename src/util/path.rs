use std::path::Path;

use anyhow::{Context, Result};

/// Strip trailing separators from a path given on the command line.
/// `/src/` and `/src` must name the same tree.
pub fn strip_trailing_sep(raw: &str) -> &str {
    let mut s = raw;
    while s.len() > 1 && s.ends_with('/') {
        s = &s[..s.len() - 1];
    }
    s
}

/// Path of `full` relative to `base`, as a `/`-joined string of segments.
/// Empty when the two name the same directory.
pub fn relative_path(base: &Path, full: &Path) -> Result<String> {
    let suffix = full
        .strip_prefix(base)
        .with_context(|| format!("{} is outside {}", full.display(), base.display()))?;

    let parts: Vec<String> = suffix
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(parts.join("/"))
}

/// Split a relative path into its non-empty segments.
pub fn segments(rel: &str) -> impl Iterator<Item = &str> {
    rel.split('/').filter(|s| !s.is_empty())
}
