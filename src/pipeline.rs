use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::SecondsFormat;

use crate::filters::QUARANTINE_META_SUFFIX;
use crate::logging;
use crate::remote::{ProcessingState, RemoteError, RemoteStore};
use crate::store::PathMappingStore;

/// Turns a claimed job into a remote object: upload, wait for remote
/// processing, link into the collection, then record the mapping. The
/// mapping is written only after the link succeeds, so a failed attempt
/// leaves no partial state and a retried job re-runs from the top.
pub struct UploadPipeline {
    remote: Arc<dyn RemoteStore>,
    mappings: Arc<PathMappingStore>,
    watch_dir: PathBuf,
    quarantine_dir: PathBuf,
    status_poll: Duration,
}

impl UploadPipeline {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        mappings: Arc<PathMappingStore>,
        watch_dir: PathBuf,
        quarantine_dir: PathBuf,
        status_poll: Duration,
    ) -> Self {
        Self {
            remote,
            mappings,
            watch_dir,
            quarantine_dir,
            status_poll,
        }
    }

    pub async fn process(&self, rel_path: &str) -> Result<()> {
        // A mapping means a prior attempt completed the full sequence
        // (possibly just before a crash); nothing to do.
        if self.mappings.get(rel_path).is_some() {
            logging::info_kv("already synced, skipping upload", &[("path", rel_path)]);
            return Ok(());
        }

        let abs = self.watch_dir.join(rel_path);
        let object_id = match self.remote.upload(rel_path, &abs).await {
            Ok(id) => id,
            Err(err) if err.is_permanent() => {
                self.quarantine(rel_path, &abs, &err.to_string());
                return Err(err).with_context(|| format!("upload {rel_path}"));
            }
            Err(err) => return Err(err).with_context(|| format!("upload {rel_path}")),
        };

        loop {
            let state = self
                .remote
                .status(&object_id)
                .await
                .with_context(|| format!("poll status of {object_id} for {rel_path}"))?;
            match state {
                ProcessingState::Completed => break,
                ProcessingState::Failed => anyhow::bail!(
                    "remote processing failed for {rel_path} (object {object_id})"
                ),
                ProcessingState::Pending | ProcessingState::Unknown => {
                    tokio::time::sleep(self.status_poll).await;
                }
            }
        }

        self.remote
            .link(&object_id)
            .await
            .with_context(|| format!("link {object_id} for {rel_path}"))?;

        self.mappings
            .upsert(rel_path, &object_id)
            .with_context(|| format!("record mapping for {rel_path}"))?;
        logging::info_kv(
            "synced",
            &[("path", rel_path), ("object_id", &object_id)],
        );
        Ok(())
    }

    /// Moves a permanently rejected file out of the watch tree so it is
    /// not retried forever, and leaves a metadata file naming the reason
    /// next to it. Best-effort: any failure here is logged and the job
    /// error still propagates.
    fn quarantine(&self, rel_path: &str, abs: &Path, reason: &str) {
        let dest = self.quarantine_dir.join(rel_path);
        if let Some(parent) = dest.parent() {
            if let Err(err) = fs::create_dir_all(parent) {
                logging::error_kv(
                    "quarantine failed",
                    &[("path", rel_path), ("error", &err.to_string())],
                );
                return;
            }
        }
        let dest = collision_free(&dest);
        match fs::rename(abs, &dest) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                logging::info_kv("quarantine skipped, file disappeared", &[("path", rel_path)]);
                return;
            }
            Err(err) => {
                logging::error_kv(
                    "quarantine failed",
                    &[("path", rel_path), ("error", &err.to_string())],
                );
                return;
            }
        }

        let meta = serde_json::json!({
            "reason": reason,
            "original_relative_path": rel_path,
            "quarantined_at": chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        });
        let meta_path = meta_path_for(&dest);
        if let Err(err) = fs::write(&meta_path, serde_json::to_vec_pretty(&meta).unwrap_or_default())
        {
            logging::warn_kv(
                "quarantine metadata write failed",
                &[("path", rel_path), ("error", &err.to_string())],
            );
        }
        logging::warn_kv(
            "quarantined rejected file",
            &[("path", rel_path), ("reason", reason)],
        );
    }
}

fn meta_path_for(dest: &Path) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    name.push_str(QUARANTINE_META_SUFFIX);
    dest.with_file_name(name)
}

/// `report.pdf` -> `report.failed1.pdf`, `report.failed2.pdf`, ... until
/// a free name is found.
fn collision_free(dest: &Path) -> PathBuf {
    if !dest.exists() {
        return dest.to_path_buf();
    }
    let stem = dest
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let ext = dest.extension().map(|e| e.to_string_lossy().to_string());
    let mut suffix = 1;
    loop {
        let name = match &ext {
            Some(ext) => format!("{stem}.failed{suffix}.{ext}"),
            None => format!("{stem}.failed{suffix}"),
        };
        let candidate = dest.with_file_name(name);
        if !candidate.exists() {
            return candidate;
        }
        suffix += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::RemoteEntry;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::SystemTime;

    fn make_temp_dir(prefix: &str) -> PathBuf {
        let mut root = std::env::temp_dir();
        let nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        root.push(format!("{prefix}-{nanos}"));
        fs::create_dir_all(&root).unwrap();
        root
    }

    #[derive(Default)]
    struct MockRemote {
        statuses: Mutex<VecDeque<ProcessingState>>,
        uploads: Mutex<Vec<String>>,
        links: Mutex<Vec<String>>,
        reject_upload: Option<(u16, String)>,
        fail_link: bool,
    }

    impl MockRemote {
        fn upload_count(&self) -> usize {
            self.uploads.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl RemoteStore for MockRemote {
        async fn upload(&self, display_name: &str, _path: &Path) -> Result<String, RemoteError> {
            if let Some((status, detail)) = &self.reject_upload {
                return Err(RemoteError::Permanent {
                    status: *status,
                    detail: detail.clone(),
                });
            }
            self.uploads.lock().unwrap().push(display_name.to_string());
            Ok(format!("obj-{display_name}"))
        }

        async fn status(&self, _object_id: &str) -> Result<ProcessingState, RemoteError> {
            Ok(self
                .statuses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(ProcessingState::Completed))
        }

        async fn link(&self, object_id: &str) -> Result<(), RemoteError> {
            if self.fail_link {
                return Err(RemoteError::Transient("link refused".into()));
            }
            self.links.lock().unwrap().push(object_id.to_string());
            Ok(())
        }

        async fn unlink(&self, _object_id: &str) -> Result<(), RemoteError> {
            Ok(())
        }

        async fn delete(&self, _object_id: &str) -> Result<(), RemoteError> {
            Ok(())
        }

        async fn list(&self) -> Result<Vec<RemoteEntry>, RemoteError> {
            Ok(Vec::new())
        }
    }

    fn pipeline_with(remote: Arc<MockRemote>, watch_dir: &Path) -> (UploadPipeline, Arc<PathMappingStore>) {
        let mappings =
            Arc::new(PathMappingStore::load(&watch_dir.join("..").join("mappings.json")).unwrap());
        let pipeline = UploadPipeline::new(
            remote,
            mappings.clone(),
            watch_dir.to_path_buf(),
            watch_dir.join("_upload_failed"),
            Duration::from_millis(1),
        );
        (pipeline, mappings)
    }

    #[tokio::test]
    async fn uploads_polls_links_then_records_mapping() {
        let root = make_temp_dir("kbsync-pipeline-happy");
        let watch = root.join("inbox");
        fs::create_dir_all(&watch).unwrap();
        fs::write(watch.join("notes.txt"), b"hello").unwrap();

        let remote = Arc::new(MockRemote {
            statuses: Mutex::new(VecDeque::from(vec![
                ProcessingState::Pending,
                ProcessingState::Pending,
                ProcessingState::Completed,
            ])),
            ..Default::default()
        });
        let (pipeline, mappings) = pipeline_with(remote.clone(), &watch);

        pipeline.process("notes.txt").await.unwrap();
        assert_eq!(mappings.get("notes.txt").as_deref(), Some("obj-notes.txt"));
        assert_eq!(remote.upload_count(), 1);
        assert_eq!(remote.links.lock().unwrap().as_slice(), ["obj-notes.txt"]);
    }

    #[tokio::test]
    async fn existing_mapping_short_circuits_without_remote_calls() {
        let root = make_temp_dir("kbsync-pipeline-idempotent");
        let watch = root.join("inbox");
        fs::create_dir_all(&watch).unwrap();
        fs::write(watch.join("notes.txt"), b"hello").unwrap();

        let remote = Arc::new(MockRemote::default());
        let (pipeline, mappings) = pipeline_with(remote.clone(), &watch);
        mappings.upsert("notes.txt", "obj-prior").unwrap();

        pipeline.process("notes.txt").await.unwrap();
        assert_eq!(remote.upload_count(), 0);
        assert_eq!(mappings.get("notes.txt").as_deref(), Some("obj-prior"));
    }

    #[tokio::test]
    async fn link_failure_leaves_no_mapping() {
        let root = make_temp_dir("kbsync-pipeline-linkfail");
        let watch = root.join("inbox");
        fs::create_dir_all(&watch).unwrap();
        fs::write(watch.join("notes.txt"), b"hello").unwrap();

        let remote = Arc::new(MockRemote {
            fail_link: true,
            ..Default::default()
        });
        let (pipeline, mappings) = pipeline_with(remote.clone(), &watch);

        assert!(pipeline.process("notes.txt").await.is_err());
        assert!(mappings.get("notes.txt").is_none());
    }

    #[tokio::test]
    async fn remote_processing_failure_fails_the_attempt() {
        let root = make_temp_dir("kbsync-pipeline-procfail");
        let watch = root.join("inbox");
        fs::create_dir_all(&watch).unwrap();
        fs::write(watch.join("notes.txt"), b"hello").unwrap();

        let remote = Arc::new(MockRemote {
            statuses: Mutex::new(VecDeque::from(vec![ProcessingState::Failed])),
            ..Default::default()
        });
        let (pipeline, mappings) = pipeline_with(remote.clone(), &watch);

        assert!(pipeline.process("notes.txt").await.is_err());
        assert!(mappings.get("notes.txt").is_none());
        assert!(remote.links.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn permanent_rejection_quarantines_the_file() {
        let root = make_temp_dir("kbsync-pipeline-quarantine");
        let watch = root.join("inbox");
        fs::create_dir_all(&watch).unwrap();
        fs::write(watch.join("bad.bin"), b"\x00").unwrap();

        let remote = Arc::new(MockRemote {
            reject_upload: Some((415, "unsupported file type".into())),
            ..Default::default()
        });
        let (pipeline, mappings) = pipeline_with(remote.clone(), &watch);

        assert!(pipeline.process("bad.bin").await.is_err());
        assert!(mappings.get("bad.bin").is_none());
        assert!(!watch.join("bad.bin").exists());
        let dest = watch.join("_upload_failed").join("bad.bin");
        assert!(dest.exists());
        let meta_path = watch
            .join("_upload_failed")
            .join(format!("bad.bin{QUARANTINE_META_SUFFIX}"));
        let meta: serde_json::Value =
            serde_json::from_slice(&fs::read(meta_path).unwrap()).unwrap();
        assert_eq!(meta["original_relative_path"], "bad.bin");
        assert!(meta["reason"]
            .as_str()
            .unwrap()
            .contains("unsupported file type"));
    }

    #[test]
    fn collision_free_appends_failed_suffix() {
        let root = make_temp_dir("kbsync-pipeline-collision");
        let dest = root.join("report.pdf");
        fs::write(&dest, b"x").unwrap();
        let next = collision_free(&dest);
        assert_eq!(next, root.join("report.failed1.pdf"));
        fs::write(&next, b"x").unwrap();
        assert_eq!(collision_free(&dest), root.join("report.failed2.pdf"));
    }
}
