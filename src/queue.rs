use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::logging;

/// One unit of "ensure this relative path has a remote object".
/// Identity is `relative_path`; the record file name is only a
/// creation-ordered storage key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Job {
    pub relative_path: String,
    pub attempts: u32,
}

/// A job checked out by exactly one worker. Holds the record name so the
/// worker can complete or requeue the same physical record.
#[derive(Debug)]
pub struct ClaimedJob {
    pub job: Job,
    record: String,
}

/// Durable queue of pending work, one JSON record per job. A record lives
/// in `queued/` or `claimed/`; its location is its status. Claiming moves
/// the record between partitions with a rename, which is atomic on one
/// filesystem, and the scan-plus-rename runs under an in-process lock so
/// two workers can never both win the same record.
pub struct JobQueue {
    queued_dir: PathBuf,
    claimed_dir: PathBuf,
    lock: Mutex<()>,
}

impl JobQueue {
    pub fn open(dir: &Path) -> Result<Self> {
        let queued_dir = dir.join("queued");
        let claimed_dir = dir.join("claimed");
        fs::create_dir_all(&queued_dir)
            .with_context(|| format!("create {}", queued_dir.display()))?;
        fs::create_dir_all(&claimed_dir)
            .with_context(|| format!("create {}", claimed_dir.display()))?;
        Ok(Self {
            queued_dir,
            claimed_dir,
            lock: Mutex::new(()),
        })
    }

    /// Idempotent: a path already queued or claimed is not enqueued again.
    /// Returns whether a new job record was created.
    pub fn enqueue(&self, rel_path: &str) -> Result<bool> {
        let _guard = self.lock.lock().expect("queue lock");
        if self.find_record(&self.queued_dir, rel_path)?.is_some()
            || self.find_record(&self.claimed_dir, rel_path)?.is_some()
        {
            return Ok(false);
        }
        let job = Job {
            relative_path: rel_path.to_string(),
            attempts: 0,
        };
        let record = next_record_name();
        write_record(&self.queued_dir.join(&record), &job)?;
        Ok(true)
    }

    /// Transitions the oldest queued job to claimed. At most one caller
    /// can claim a given job.
    pub fn claim(&self) -> Result<Option<ClaimedJob>> {
        let _guard = self.lock.lock().expect("queue lock");
        for path in list_records(&self.queued_dir)? {
            let Some(job) = read_record(&path) else {
                continue;
            };
            let record = file_name_of(&path);
            let target = self.claimed_dir.join(&record);
            match fs::rename(&path, &target) {
                Ok(()) => return Ok(Some(ClaimedJob { job, record })),
                // Raced with remove_path; the record is gone, move on.
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("claim {}", path.display()))
                }
            }
        }
        Ok(None)
    }

    /// Drops the record entirely (processing succeeded, the job was
    /// abandoned, or its file disappeared).
    pub fn complete(&self, claimed: &ClaimedJob) -> Result<()> {
        let path = self.claimed_dir.join(&claimed.record);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("complete {}", path.display())),
        }
    }

    /// Moves a claimed job back to queued with its attempt counter bumped.
    /// Written to the queued partition before the claimed record is
    /// removed, so a crash in between never loses the job; recovery then
    /// collapses the pair back to a single queued record.
    pub fn requeue(&self, claimed: &ClaimedJob) -> Result<()> {
        let _guard = self.lock.lock().expect("queue lock");
        let job = Job {
            relative_path: claimed.job.relative_path.clone(),
            attempts: claimed.job.attempts + 1,
        };
        write_record(&self.queued_dir.join(&claimed.record), &job)?;
        let old = self.claimed_dir.join(&claimed.record);
        match fs::remove_file(&old) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("requeue {}", old.display())),
        }
    }

    /// Removes a pending (queued, unclaimed) job for the path, if any.
    /// Used when a delete supersedes an upload that never started.
    pub fn remove_path(&self, rel_path: &str) -> Result<bool> {
        let _guard = self.lock.lock().expect("queue lock");
        if let Some(path) = self.find_record(&self.queued_dir, rel_path)? {
            match fs::remove_file(&path) {
                Ok(()) => return Ok(true),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("remove {}", path.display()))
                }
            }
        }
        Ok(false)
    }

    /// Startup recovery: any job still claimed belonged to a worker that no
    /// longer exists, and whether its remote side effects landed is
    /// unknowable. Move every such record back to queued; the upload
    /// pipeline's mapping check keeps a completed prior attempt from
    /// uploading twice.
    pub fn recover(&self) -> Result<usize> {
        let _guard = self.lock.lock().expect("queue lock");
        let mut moved = 0;
        for path in list_records(&self.claimed_dir)? {
            let record = file_name_of(&path);
            let target = self.queued_dir.join(&record);
            fs::rename(&path, &target)
                .with_context(|| format!("recover {}", path.display()))?;
            moved += 1;
        }
        Ok(moved)
    }

    pub fn pending_count(&self) -> Result<usize> {
        Ok(list_records(&self.queued_dir)?.len())
    }

    pub fn claimed_count(&self) -> Result<usize> {
        Ok(list_records(&self.claimed_dir)?.len())
    }

    fn find_record(&self, dir: &Path, rel_path: &str) -> Result<Option<PathBuf>> {
        for path in list_records(dir)? {
            if let Some(job) = read_record(&path) {
                if job.relative_path == rel_path {
                    return Ok(Some(path));
                }
            }
        }
        Ok(None)
    }
}

fn next_record_name() -> String {
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("{nanos:020}-{}.json", uuid::Uuid::new_v4().as_simple())
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn list_records(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("read {}", dir.display()))? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("json") {
            out.push(path);
        }
    }
    out.sort();
    Ok(out)
}

fn write_record(path: &Path, job: &Job) -> Result<()> {
    let data = serde_json::to_vec(job).context("encode job record")?;
    fs::write(path, data).with_context(|| format!("write {}", path.display()))
}

/// Malformed records are dropped with a warning, never fatal.
fn read_record(path: &Path) -> Option<Job> {
    let data = fs::read(path).ok()?;
    match serde_json::from_slice::<Job>(&data) {
        Ok(job) => Some(job),
        Err(err) => {
            logging::warn_kv(
                "dropping malformed job record",
                &[
                    ("path", &path.display().to_string()),
                    ("error", &err.to_string()),
                ],
            );
            let _ = fs::remove_file(path);
            None
        }
    }
}
