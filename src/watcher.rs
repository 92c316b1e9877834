use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};

use crate::filters::IgnoreFilter;
use crate::logging;
use crate::queue::JobQueue;
use crate::remote::{self, RemoteStore};
use crate::store::PathMappingStore;

/// Consumes filesystem change events and feeds the queue (creations) or
/// applies removals directly. Runs as one long-lived loop; the settle
/// delay blocks only this loop, never the workers.
pub struct ChangeWatcher {
    watch_dir: PathBuf,
    filter: Arc<IgnoreFilter>,
    queue: Arc<JobQueue>,
    mappings: Arc<PathMappingStore>,
    remote: Arc<dyn RemoteStore>,
    settle_delay: Duration,
}

impl ChangeWatcher {
    pub fn new(
        watch_dir: PathBuf,
        filter: Arc<IgnoreFilter>,
        queue: Arc<JobQueue>,
        mappings: Arc<PathMappingStore>,
        remote: Arc<dyn RemoteStore>,
        settle_delay: Duration,
    ) -> Self {
        Self {
            watch_dir,
            filter,
            queue,
            mappings,
            remote,
            settle_delay,
        }
    }

    pub async fn run(self) -> Result<()> {
        let (tx, mut rx) = tokio::sync::mpsc::channel(256);
        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = tx.blocking_send(res);
            },
            notify::Config::default(),
        )
        .context("create filesystem watcher")?;
        watcher
            .watch(&self.watch_dir, RecursiveMode::Recursive)
            .with_context(|| format!("watch {}", self.watch_dir.display()))?;
        logging::info_kv(
            "watching for changes",
            &[("dir", &self.watch_dir.display().to_string())],
        );

        while let Some(res) = rx.recv().await {
            let event = match res {
                Ok(event) => event,
                Err(err) => {
                    logging::warn_kv("watch event error", &[("error", &err.to_string())]);
                    continue;
                }
            };
            match event.kind {
                EventKind::Create(_) | EventKind::Modify(_) => {
                    for path in &event.paths {
                        self.handle_upsert(path).await;
                    }
                }
                EventKind::Remove(_) => {
                    for path in &event.paths {
                        self.handle_remove(path).await;
                    }
                }
                _ => {}
            }
        }
        anyhow::bail!("watch event stream closed")
    }

    async fn handle_upsert(&self, path: &Path) {
        let Some(rel) = self.rel_of(path) else {
            return;
        };
        if self.should_skip(&rel, path) {
            return;
        }

        // Settle delay: give a file still being written a moment to
        // finish before uploading it.
        tokio::time::sleep(self.settle_delay).await;
        match std::fs::metadata(path) {
            Ok(meta) if meta.is_dir() => return,
            Ok(meta) if meta.len() == 0 => {
                logging::info_kv("skipping empty file", &[("path", &rel)]);
                return;
            }
            Ok(_) => {}
            Err(_) => {
                // A rename out of the watch tree surfaces as a modify for
                // the old path; by now the file is gone either way, so this
                // ends in the same place as an explicit remove.
                logging::info_kv("file gone after settle delay, applying removal", &[("path", &rel)]);
                process_removed(&rel, &self.queue, &self.mappings, self.remote.as_ref()).await;
                return;
            }
        }

        match self.queue.enqueue(&rel) {
            Ok(true) => logging::info_kv("queued for upload", &[("path", &rel)]),
            Ok(false) => {}
            Err(err) => logging::error_kv(
                "enqueue failed",
                &[("path", &rel), ("error", &format!("{err:#}"))],
            ),
        }
    }

    async fn handle_remove(&self, path: &Path) {
        let Some(rel) = self.rel_of(path) else {
            return;
        };
        if self.filter.should_ignore_rel(Path::new(&rel), false) {
            return;
        }
        process_removed(&rel, &self.queue, &self.mappings, self.remote.as_ref()).await;
    }

    fn rel_of(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.watch_dir).ok()?;
        if rel.as_os_str().is_empty() {
            return None;
        }
        Some(rel.to_string_lossy().to_string())
    }

    fn should_skip(&self, rel: &str, path: &Path) -> bool {
        let name = Path::new(rel)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        if self.filter.should_ignore_name(&name) {
            return true;
        }
        if self.filter.should_ignore_rel(Path::new(rel), false) {
            return true;
        }
        // Directory events only matter through the paths of the files
        // inside them.
        path.is_dir()
    }
}

/// Applies a local deletion: drop any pending upload for the path, then
/// remove the remote object and the mapping. The mapping is cleared only
/// after the remote removal succeeds; on failure it stays so the next
/// reconciliation pass can retry. A job already claimed by a worker can
/// still finish its upload after this runs; reconciliation repairs that.
pub async fn process_removed(
    rel: &str,
    queue: &JobQueue,
    mappings: &PathMappingStore,
    remote: &dyn RemoteStore,
) {
    match queue.remove_path(rel) {
        Ok(true) => logging::info_kv("dropped pending upload for deleted file", &[("path", rel)]),
        Ok(false) => {}
        Err(err) => logging::error_kv(
            "dropping pending upload failed",
            &[("path", rel), ("error", &format!("{err:#}"))],
        ),
    }

    let Some(object_id) = mappings.get(rel) else {
        return;
    };
    match remote::remove_object(remote, &object_id).await {
        Ok(()) => {
            if let Err(err) = mappings.remove(rel) {
                logging::error_kv(
                    "mapping removal failed",
                    &[("path", rel), ("error", &format!("{err:#}"))],
                );
                return;
            }
            logging::info_kv(
                "removed remote object for deleted file",
                &[("path", rel), ("object_id", &object_id)],
            );
        }
        Err(err) => logging::error_kv(
            "remote removal failed, keeping mapping for reconciliation",
            &[
                ("path", rel),
                ("object_id", &object_id),
                ("error", &err.to_string()),
            ],
        ),
    }
}
