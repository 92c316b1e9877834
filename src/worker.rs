use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::logging;
use crate::pipeline::UploadPipeline;
use crate::queue::JobQueue;
use crate::retry::RetryPolicy;

/// Sleep between empty polls of the queue; bounded wait, not busy-spin.
const IDLE_POLL: Duration = Duration::from_millis(150);

/// Spawns `count` independent worker loops draining the queue.
pub fn spawn(
    count: usize,
    queue: Arc<JobQueue>,
    pipeline: Arc<UploadPipeline>,
    policy: RetryPolicy,
    watch_dir: PathBuf,
) -> Vec<JoinHandle<()>> {
    (0..count)
        .map(|worker_id| {
            let queue = queue.clone();
            let pipeline = pipeline.clone();
            let watch_dir = watch_dir.clone();
            tokio::spawn(async move {
                loop {
                    match drain_once(&queue, &pipeline, policy, &watch_dir).await {
                        Ok(true) => {}
                        Ok(false) => sleep(IDLE_POLL).await,
                        Err(err) => {
                            logging::error_kv(
                                "worker iteration failed",
                                &[
                                    ("worker", &worker_id.to_string()),
                                    ("error", &format!("{err:#}")),
                                ],
                            );
                            sleep(IDLE_POLL).await;
                        }
                    }
                }
            })
        })
        .collect()
}

/// Claims and fully handles at most one job, including any backoff sleep
/// before a requeue. Returns whether a job was claimed.
pub async fn drain_once(
    queue: &JobQueue,
    pipeline: &UploadPipeline,
    policy: RetryPolicy,
    watch_dir: &Path,
) -> Result<bool> {
    let Some(claimed) = queue.claim()? else {
        return Ok(false);
    };
    let rel = claimed.job.relative_path.clone();
    let attempts = claimed.job.attempts;

    // The file being gone is not a failure: the deletion path owns the
    // cleanup, this job is simply stale.
    if !watch_dir.join(&rel).is_file() {
        logging::info_kv("discarding job for vanished file", &[("path", &rel)]);
        queue.complete(&claimed)?;
        return Ok(true);
    }

    match pipeline.process(&rel).await {
        Ok(()) => {
            queue.complete(&claimed)?;
        }
        Err(err) if policy.should_retry(attempts) => {
            let delay = policy.delay_for(attempts);
            logging::warn_kv(
                "job failed, will retry",
                &[
                    ("path", &rel),
                    ("attempts", &attempts.to_string()),
                    ("delay_ms", &delay.as_millis().to_string()),
                    ("error", &format!("{err:#}")),
                ],
            );
            // The job stays claimed through the backoff so no other
            // worker picks up the same path meanwhile.
            sleep(delay).await;
            queue.requeue(&claimed)?;
        }
        Err(err) => {
            queue.complete(&claimed)?;
            logging::error_kv(
                "job abandoned after exhausting retries",
                &[
                    ("path", &rel),
                    ("attempts", &attempts.to_string()),
                    ("error", &format!("{err:#}")),
                ],
            );
        }
    }
    Ok(true)
}
