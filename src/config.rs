use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use url::Url;

const DEFAULT_QUARANTINE_DIR: &str = "_upload_failed";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server_url: String,
    pub api_key: String,
    pub collection_id: String,
    pub watch_dir: PathBuf,
    pub state_dir: PathBuf,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_backoff_secs")]
    pub base_backoff_secs: f64,
    #[serde(default = "default_status_poll_secs")]
    pub status_poll_secs: f64,
    #[serde(default = "default_reconcile_secs")]
    pub reconcile_secs: i64,
    #[serde(default = "default_settle_delay_secs")]
    pub settle_delay_secs: f64,
    #[serde(default = "default_quarantine_dir")]
    pub quarantine_dir: String,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

fn default_workers() -> usize {
    4
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_backoff_secs() -> f64 {
    1.0
}

fn default_status_poll_secs() -> f64 {
    2.0
}

fn default_reconcile_secs() -> i64 {
    300
}

fn default_settle_delay_secs() -> f64 {
    1.0
}

fn default_quarantine_dir() -> String {
    DEFAULT_QUARANTINE_DIR.to_string()
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let mut cfg: Config = serde_json::from_str(&data).context("parse config json")?;
        cfg.normalize();
        cfg.validate()?;
        Ok(cfg)
    }

    fn normalize(&mut self) {
        self.server_url = self.server_url.trim_end_matches('/').to_string();
        self.quarantine_dir = sanitize_quarantine_dir(&self.quarantine_dir);
        if self.watch_dir.is_relative() {
            if let Ok(abs) = std::fs::canonicalize(&self.watch_dir) {
                self.watch_dir = abs;
            }
        }
    }

    fn validate(&self) -> Result<()> {
        validate_url(&self.server_url).context("server_url")?;
        if self.api_key.trim().is_empty() {
            anyhow::bail!("api_key is empty");
        }
        if self.collection_id.trim().is_empty() {
            anyhow::bail!("collection_id is empty");
        }
        if self.workers == 0 {
            anyhow::bail!("workers must be at least 1");
        }
        if self.base_backoff_secs <= 0.0 {
            anyhow::bail!("base_backoff_secs must be positive");
        }
        if self.status_poll_secs <= 0.0 {
            anyhow::bail!("status_poll_secs must be positive");
        }
        if self.settle_delay_secs < 0.0 {
            anyhow::bail!("settle_delay_secs must not be negative");
        }
        Ok(())
    }

    pub fn base_backoff(&self) -> Duration {
        Duration::from_secs_f64(self.base_backoff_secs)
    }

    pub fn status_poll(&self) -> Duration {
        Duration::from_secs_f64(self.status_poll_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs_f64(self.settle_delay_secs)
    }

    /// Reconciliation interval; `None` disables the periodic pass.
    pub fn reconcile_interval(&self) -> Option<Duration> {
        if self.reconcile_secs > 0 {
            Some(Duration::from_secs(self.reconcile_secs as u64))
        } else {
            None
        }
    }

    pub fn log_path(&self) -> PathBuf {
        self.log_file
            .clone()
            .unwrap_or_else(|| self.state_dir.join("kbsync.log"))
    }

    pub fn mappings_path(&self) -> PathBuf {
        self.state_dir.join("mappings.json")
    }

    pub fn queue_dir(&self) -> PathBuf {
        self.state_dir.join("queue")
    }

    pub fn quarantine_path(&self) -> PathBuf {
        self.watch_dir.join(&self.quarantine_dir)
    }
}

fn validate_url(raw: &str) -> Result<()> {
    let url = Url::parse(raw)?;
    if url.scheme() != "http" && url.scheme() != "https" {
        anyhow::bail!("url must be http or https");
    }
    Ok(())
}

// The quarantine dir must stay a bare directory name directly under the
// watch root; anything path-like in the config collapses to its basename.
fn sanitize_quarantine_dir(raw: &str) -> String {
    let trimmed = raw.trim().trim_matches(|c| c == '/' || c == '\\');
    let base = trimmed.rsplit(['/', '\\']).next().unwrap_or("");
    match base {
        "" | "." | ".." => DEFAULT_QUARANTINE_DIR.to_string(),
        name => name.to_string(),
    }
}
