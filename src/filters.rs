use std::path::Path;

use anyhow::{Context, Result};
use ignore::gitignore::{Gitignore, GitignoreBuilder};

/// Suffix attached to quarantine metadata files; these never sync.
pub const QUARANTINE_META_SUFFIX: &str = ".kbsync-error.json";

const DEFAULT_IGNORE_LINES: &[&str] = &[
    // editor/droppings
    ".*",
    "*.swp",
    "*.tmp",
    "*~",
    // quarantine metadata written next to rejected files
    "*.kbsync-error.json",
];

/// Decides whether a path participates in sync. Stateless after
/// construction; matching is against names relative to the watch root.
#[derive(Clone)]
pub struct IgnoreFilter {
    ignore: Gitignore,
}

impl IgnoreFilter {
    pub fn new(base_dir: &Path, quarantine_dir: &str) -> Result<Self> {
        let mut builder = GitignoreBuilder::new(base_dir);
        for line in DEFAULT_IGNORE_LINES {
            builder
                .add_line(None, line)
                .with_context(|| format!("add default ignore line: {line}"))?;
        }
        // Anchor the quarantine dir at the watch root so a same-named
        // regular file deeper in the tree still syncs.
        let quarantine_line = format!("/{quarantine_dir}/");
        builder
            .add_line(None, &quarantine_line)
            .with_context(|| format!("add quarantine ignore line: {quarantine_line}"))?;

        let ignore = builder.build().context("build ignore matcher")?;
        Ok(Self { ignore })
    }

    /// Basename-level check used by the watcher before any further work.
    pub fn should_ignore_name(&self, name: &str) -> bool {
        let p = Path::new(name);
        self.ignore.matched(p, false).is_ignore() || self.ignore.matched(p, true).is_ignore()
    }

    pub fn should_ignore_rel(&self, rel_path: &Path, is_dir: bool) -> bool {
        self.ignore
            .matched_path_or_any_parents(rel_path, is_dir)
            .is_ignore()
    }
}
