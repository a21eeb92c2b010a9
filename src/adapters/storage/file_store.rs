//! FileRunStore - one directory per run.
//!
//! ```text
//! <runs_dir>/<timestamp>-<id>/
//!   config.yaml           effective configuration
//!   transitions.jsonl     one TransitionRecord per line, append-only
//!   states/state_<n>.json control snapshots, highest n is latest
//!   models/model_<tag>.json  scorer snapshots (written by the scorer)
//! ```

use async_trait::async_trait;
use chrono::Utc;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{Config, ControlSnapshot, TransitionRecord};
use crate::domain::ports::{StateStore, TransitionLog};

const TRANSITIONS_FILE: &str = "transitions.jsonl";
const CONFIG_FILE: &str = "config.yaml";
const STATES_DIR: &str = "states";
const MODELS_DIR: &str = "models";

/// Run directory holding the transition log and state snapshots.
pub struct FileRunStore {
    dir: PathBuf,
    log: Mutex<File>,
}

impl FileRunStore {
    /// Create a fresh run directory under `runs_dir`.
    pub async fn create(runs_dir: &Path) -> DomainResult<Self> {
        let name = format!(
            "{}-{}",
            Utc::now().format("%Y-%m-%d.%H%M%S"),
            &Uuid::new_v4().simple().to_string()[..8]
        );
        let dir = runs_dir.join(name);
        fs::create_dir_all(&dir).await?;
        info!(dir = %dir.display(), "Created run directory");
        Self::open(&dir).await
    }

    /// Open an existing run directory for appending.
    pub async fn open(dir: &Path) -> DomainResult<Self> {
        fs::create_dir_all(dir.join(STATES_DIR)).await?;
        fs::create_dir_all(dir.join(MODELS_DIR)).await?;
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(TRANSITIONS_FILE))
            .await?;
        Ok(Self {
            dir: dir.to_path_buf(),
            log: Mutex::new(log),
        })
    }

    /// Most recently created run under `runs_dir`.
    pub async fn latest_run(runs_dir: &Path) -> DomainResult<Option<PathBuf>> {
        let mut entries = match fs::read_dir(runs_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut latest: Option<PathBuf> = None;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let path = entry.path();
            if latest.as_ref().is_none_or(|l| path.file_name() > l.file_name()) {
                latest = Some(path);
            }
        }
        Ok(latest)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Where scorer snapshots for this run live.
    pub fn models_dir(&self) -> PathBuf {
        self.dir.join(MODELS_DIR)
    }

    /// Record the effective configuration next to the run's data.
    pub async fn write_config(&self, config: &Config) -> DomainResult<()> {
        let yaml = serde_yaml::to_string(config)
            .map_err(|e| DomainError::SerializationError(e.to_string()))?;
        fs::write(self.dir.join(CONFIG_FILE), yaml).await?;
        Ok(())
    }

    fn state_path(&self, iteration: u64) -> PathBuf {
        self.dir.join(STATES_DIR).join(format!("state_{iteration}.json"))
    }
}

fn state_iteration(path: &Path) -> Option<u64> {
    path.file_name()?
        .to_str()?
        .strip_prefix("state_")?
        .strip_suffix(".json")?
        .parse()
        .ok()
}

#[async_trait]
impl TransitionLog for FileRunStore {
    async fn append(&self, record: &TransitionRecord) -> DomainResult<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let mut log = self.log.lock().await;
        log.write_all(&line).await?;
        Ok(())
    }

    async fn records(&self) -> DomainResult<Vec<TransitionRecord>> {
        let text = match fs::read_to_string(self.dir.join(TRANSITIONS_FILE)).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut records = Vec::new();
        let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
        for (n, line) in lines.iter().enumerate() {
            match serde_json::from_str::<TransitionRecord>(line) {
                Ok(record) => records.push(record),
                // A crash can tear the final line; anything earlier is corruption.
                Err(e) if n + 1 == lines.len() => {
                    warn!(line = n + 1, error = %e, "Skipping torn final transition record");
                }
                Err(e) => return Err(DomainError::Persistence(format!("transition log line {}: {e}", n + 1))),
            }
        }
        records.sort_by_key(|r| r.iteration);
        Ok(records)
    }

    async fn flush(&self) -> DomainResult<()> {
        let mut log = self.log.lock().await;
        log.flush().await?;
        log.sync_data().await?;
        Ok(())
    }
}

#[async_trait]
impl StateStore for FileRunStore {
    async fn save_state(&self, snapshot: &ControlSnapshot) -> DomainResult<()> {
        let path = self.state_path(snapshot.iteration);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(snapshot)?).await?;
        fs::rename(&tmp, &path).await?;
        debug!(iteration = snapshot.iteration, path = %path.display(), "Saved control state");
        Ok(())
    }

    async fn load_latest_state(&self) -> DomainResult<Option<ControlSnapshot>> {
        let mut entries = match fs::read_dir(self.dir.join(STATES_DIR)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut latest: Option<(u64, PathBuf)> = None;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if let Some(iteration) = state_iteration(&path) {
                if latest.as_ref().is_none_or(|(best, _)| iteration > *best) {
                    latest = Some((iteration, path));
                }
            }
        }
        let Some((_, path)) = latest else {
            return Ok(None);
        };
        let bytes = fs::read(&path).await?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }
}
