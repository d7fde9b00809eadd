use anyhow::{Context, Result};
use regex::Regex;

/// Preset rule bundles toggled from the command line.
#[derive(Debug, Clone, Copy, Default)]
pub struct Presets {
    pub temp: bool,
    pub dotfiles: bool,
    pub backups: bool,
    pub logs: bool,
}

/// Temp files: `*.tmp`/`*.temp`, hidden names containing tmp/temp as a word,
/// editor swap files, `#autosave#` names.
const TEMP_RULES: &[&str] = &[
    r"\.te?mp$",
    r"(?:^|/)\.[^/]*\b(?:te?mp)\b[^/]*$",
    r"(?:^|/)[._][^/]*\.swp$",
    r"(?:^|/)#[^/]+#$",
];

/// Any path segment beginning with a dot.
const DOTFILE_RULES: &[&str] = &[r"(?:^|/)\."];

const BACKUP_RULES: &[&str] = &[r"\.(?:bak|backup|old|orig)$", r"~$"];

/// Names ending in `log` behind a separator, and `log`/`logs` path segments.
const LOG_RULES: &[&str] = &[r"[._-]log$", r"(?:^|/)logs?(?:/|$)"];

/// Ordered list of exclusion rules applied to every path the agent touches:
/// watch registration and event processing use the same predicate.
///
/// Rules match the path relative to the source root, forward-slash separated.
pub struct IgnoreFilter {
    rules: Vec<Regex>,
}

impl IgnoreFilter {
    /// Compile user patterns plus any enabled preset bundles.
    /// An invalid user pattern is a configuration error.
    pub fn build(user_patterns: &[String], presets: Presets) -> Result<Self> {
        let mut rules = Vec::with_capacity(user_patterns.len());

        for pattern in user_patterns {
            let rewritten = rewrite_anchor(pattern);
            rules.push(
                Regex::new(&rewritten)
                    .with_context(|| format!("invalid ignore pattern: {pattern}"))?,
            );
        }

        let mut bundles: Vec<&[&str]> = Vec::new();
        if presets.temp {
            bundles.push(TEMP_RULES);
        }
        if presets.dotfiles {
            bundles.push(DOTFILE_RULES);
        }
        if presets.backups {
            bundles.push(BACKUP_RULES);
        }
        if presets.logs {
            bundles.push(LOG_RULES);
        }
        for bundle in bundles {
            for pattern in bundle {
                rules.push(
                    Regex::new(pattern)
                        .with_context(|| format!("invalid preset pattern: {pattern}"))?,
                );
            }
        }

        Ok(Self { rules })
    }

    /// A path is ignored if any rule matches.
    pub fn is_ignored(&self, relative: &str) -> bool {
        self.rules.iter().any(|rule| rule.is_match(relative))
    }
}

/// Rewrite a leading `^` to a segment-boundary anchor so `^foo` matches
/// `foo` both at the start of the path and directly after a separator.
fn rewrite_anchor(pattern: &str) -> String {
    match pattern.strip_prefix('^') {
        Some(rest) => format!("(?:^|/){rest}"),
        None => pattern.to_string(),
    }
}
