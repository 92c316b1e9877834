use std::fs;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::Config;
use crate::filters::IgnoreFilter;
use crate::logging;
use crate::pipeline::UploadPipeline;
use crate::queue::JobQueue;
use crate::reconcile::ReconciliationScanner;
use crate::remote::{ApiClient, RemoteStore};
use crate::retry::RetryPolicy;
use crate::store::PathMappingStore;
use crate::watcher::ChangeWatcher;
use crate::worker;

/// Wires the sync engine together and runs until a shutdown signal.
/// Shutdown does not wait for in-flight jobs; they are recovered on the
/// next start by queue recovery plus the pipeline's mapping check.
pub async fn run(cfg: Config) -> Result<()> {
    logging::init_log_file(&cfg.log_path())?;
    logging::info_kv(
        "daemon start",
        &[
            ("version", env!("CARGO_PKG_VERSION")),
            ("watch_dir", &cfg.watch_dir.display().to_string()),
            ("workers", &cfg.workers.to_string()),
        ],
    );

    fs::create_dir_all(&cfg.watch_dir)
        .with_context(|| format!("create watch dir {}", cfg.watch_dir.display()))?;
    fs::create_dir_all(&cfg.state_dir)
        .with_context(|| format!("create state dir {}", cfg.state_dir.display()))?;

    let filter = Arc::new(IgnoreFilter::new(&cfg.watch_dir, &cfg.quarantine_dir)?);
    let mappings = Arc::new(PathMappingStore::load(&cfg.mappings_path())?);
    let queue = Arc::new(JobQueue::open(&cfg.queue_dir())?);

    // Jobs claimed by a previous run go back to queued before any worker
    // starts; whether their remote side effects landed is unknown.
    let recovered = queue.recover()?;
    if recovered > 0 {
        logging::info_kv(
            "requeued jobs left claimed by a previous run",
            &[("count", &recovered.to_string())],
        );
    }

    let remote: Arc<dyn RemoteStore> = Arc::new(ApiClient::new(
        &cfg.server_url,
        &cfg.api_key,
        &cfg.collection_id,
    )?);

    let pipeline = Arc::new(UploadPipeline::new(
        remote.clone(),
        mappings.clone(),
        cfg.watch_dir.clone(),
        cfg.quarantine_path(),
        cfg.status_poll(),
    ));
    let policy = RetryPolicy::new(cfg.max_retries, cfg.base_backoff());
    let workers = worker::spawn(
        cfg.workers,
        queue.clone(),
        pipeline,
        policy,
        cfg.watch_dir.clone(),
    );

    let reconciler = cfg.reconcile_interval().map(|interval| {
        let scanner = ReconciliationScanner::new(
            cfg.watch_dir.clone(),
            filter.clone(),
            queue.clone(),
            mappings.clone(),
            remote.clone(),
        );
        tokio::spawn(scanner.run(interval))
    });
    if reconciler.is_none() {
        logging::info("reconciliation disabled by configuration");
    }

    let watcher = ChangeWatcher::new(
        cfg.watch_dir.clone(),
        filter,
        queue,
        mappings,
        remote,
        cfg.settle_delay(),
    );
    let watcher_task = tokio::spawn(watcher.run());

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("listen for shutdown signal")?;
            logging::info("shutdown signal received");
        }
        res = watcher_task => {
            match res {
                Ok(Err(err)) => return Err(err).context("change watcher stopped"),
                Ok(Ok(())) => {}
                Err(err) => anyhow::bail!("change watcher panicked: {err}"),
            }
        }
    }

    for handle in workers {
        handle.abort();
    }
    if let Some(handle) = reconciler {
        handle.abort();
    }
    logging::info("stopped");
    Ok(())
}
