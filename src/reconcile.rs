use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use walkdir::WalkDir;

use crate::filters::IgnoreFilter;
use crate::logging;
use crate::queue::JobQueue;
use crate::remote::{self, RemoteStore};
use crate::store::PathMappingStore;

/// Periodic full-tree pass that repairs drift between local files,
/// mappings, and remote objects. This is the only mechanism that recovers
/// from events missed while the process was down and from partial
/// failures that left a mapping and its remote object out of sync. It
/// never touches local files.
pub struct ReconciliationScanner {
    watch_dir: PathBuf,
    filter: Arc<IgnoreFilter>,
    queue: Arc<JobQueue>,
    mappings: Arc<PathMappingStore>,
    remote: Arc<dyn RemoteStore>,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub local_files: usize,
    pub remote_entries: usize,
    pub enqueued: usize,
    pub pruned_mappings: usize,
    pub orphans_removed: usize,
}

impl ReconciliationScanner {
    pub fn new(
        watch_dir: PathBuf,
        filter: Arc<IgnoreFilter>,
        queue: Arc<JobQueue>,
        mappings: Arc<PathMappingStore>,
        remote: Arc<dyn RemoteStore>,
    ) -> Self {
        Self {
            watch_dir,
            filter,
            queue,
            mappings,
            remote,
        }
    }

    /// Runs a pass immediately, then every `interval`. The first pass is
    /// what resolves any local/remote inconsistency accumulated while the
    /// process was down.
    pub async fn run(self, interval: Duration) {
        loop {
            match self.pass().await {
                Ok(summary) => logging::info_kv(
                    "reconcile pass complete",
                    &[
                        ("local", &summary.local_files.to_string()),
                        ("remote", &summary.remote_entries.to_string()),
                        ("enqueued", &summary.enqueued.to_string()),
                        ("pruned_mappings", &summary.pruned_mappings.to_string()),
                        ("orphans_removed", &summary.orphans_removed.to_string()),
                    ],
                ),
                Err(err) => logging::error_kv(
                    "reconcile pass failed",
                    &[("error", &format!("{err:#}"))],
                ),
            }
            tokio::time::sleep(interval).await;
        }
    }

    pub async fn pass(&self) -> Result<PassSummary> {
        let mut summary = PassSummary::default();
        let local = self.scan_local()?;
        summary.local_files = local.len();

        // Local files without a mapping need an upload; enqueue is
        // idempotent so overlap with the watcher is safe.
        for rel in &local {
            if self.mappings.get(rel).is_none() && self.queue.enqueue(rel)? {
                summary.enqueued += 1;
            }
        }

        let entries = self.remote.list().await.context("list remote collection")?;
        summary.remote_entries = entries.len();
        let mut name_counts: HashMap<&str, usize> = HashMap::new();
        for entry in &entries {
            *name_counts.entry(entry.display_name.as_str()).or_default() += 1;
        }

        // Mappings whose local file is gone: the delete event was missed
        // or its remote call failed. Remove the remote object, then the
        // mapping.
        let mut handled_ids: HashSet<String> = HashSet::new();
        for (rel, object_id) in self.mappings.list_all() {
            if local.contains(&rel) {
                continue;
            }
            match remote::remove_object(self.remote.as_ref(), &object_id).await {
                Ok(()) => {
                    self.mappings
                        .remove(&rel)
                        .with_context(|| format!("remove mapping for {rel}"))?;
                    handled_ids.insert(object_id.clone());
                    summary.pruned_mappings += 1;
                    logging::info_kv(
                        "reconcile: removed remote object for missing local file",
                        &[("path", &rel), ("object_id", &object_id)],
                    );
                }
                Err(err) => logging::error_kv(
                    "reconcile: remote removal failed, keeping mapping",
                    &[
                        ("path", &rel),
                        ("object_id", &object_id),
                        ("error", &err.to_string()),
                    ],
                ),
            }
        }

        // Remote orphans: no local file under that name and no mapping
        // pointing at them. Only remove when the name is unambiguous; one
        // of several duplicate-named uploads is left for a human.
        let mapped_ids: HashSet<String> = self
            .mappings
            .list_all()
            .into_iter()
            .map(|(_, id)| id)
            .collect();
        for entry in &entries {
            if local.contains(&entry.display_name) {
                continue;
            }
            if name_counts[entry.display_name.as_str()] != 1 {
                logging::warn_kv(
                    "reconcile: leaving ambiguous duplicate-named remote entries",
                    &[("name", &entry.display_name)],
                );
                continue;
            }
            if handled_ids.contains(&entry.object_id) || mapped_ids.contains(&entry.object_id) {
                continue;
            }
            match remote::remove_object(self.remote.as_ref(), &entry.object_id).await {
                Ok(()) => {
                    summary.orphans_removed += 1;
                    logging::info_kv(
                        "reconcile: removed orphaned remote object",
                        &[
                            ("name", &entry.display_name),
                            ("object_id", &entry.object_id),
                        ],
                    );
                }
                Err(err) => logging::error_kv(
                    "reconcile: orphan removal failed",
                    &[
                        ("name", &entry.display_name),
                        ("object_id", &entry.object_id),
                        ("error", &err.to_string()),
                    ],
                ),
            }
        }

        Ok(summary)
    }

    /// Current set of eligible local relative paths. Zero-byte files are
    /// skipped: they are usually placeholders still being written.
    fn scan_local(&self) -> Result<HashSet<String>> {
        let mut out = HashSet::new();
        let filter = self.filter.clone();
        let watch_dir = self.watch_dir.clone();
        let walk = WalkDir::new(&self.watch_dir).into_iter().filter_entry(|e| {
            let rel = match e.path().strip_prefix(&watch_dir) {
                Ok(rel) => rel,
                Err(_) => return true,
            };
            if rel.as_os_str().is_empty() {
                return true;
            }
            !filter.should_ignore_rel(rel, e.file_type().is_dir())
        });
        for entry in walk {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    logging::warn_kv("reconcile: scan error", &[("error", &err.to_string())]);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            match entry.metadata() {
                Ok(meta) if meta.len() == 0 => continue,
                Ok(_) => {}
                Err(_) => continue,
            }
            let rel = entry
                .path()
                .strip_prefix(&self.watch_dir)
                .with_context(|| format!("strip prefix {}", entry.path().display()))?;
            out.insert(rel.to_string_lossy().to_string());
        }
        Ok(out)
    }
}
