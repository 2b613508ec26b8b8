//! Experiment-tracking service abstraction.
//!
//! Discovery searches runs by tag and the resolver downloads checkpoint artifacts through
//! [`TrackingService`]. The HTTP implementation lives in the `champion-tracking` crate;
//! [`InMemoryTrackingService`] backs tests and offline use.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::TrackingError;

/// Lifecycle status of a tracked run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Running,
    Scheduled,
    Finished,
    Failed,
    Killed,
}

/// A run as reported by the tracking service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRun {
    pub run_id: String,
    pub status: RunStatus,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_uri: Option<String>,
}

impl RemoteRun {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            status: RunStatus::Finished,
            tags: BTreeMap::new(),
            metrics: BTreeMap::new(),
            artifact_uri: None,
        }
    }

    pub fn with_tags(mut self, tags: BTreeMap<String, String>) -> Self {
        self.tags.extend(tags);
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }

    pub fn with_status(mut self, status: RunStatus) -> Self {
        self.status = status;
        self
    }
}

/// Tag-equality search over runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunQuery {
    pub tags: BTreeMap<String, String>,
    pub limit: usize,
    pub status: Option<RunStatus>,
}

impl RunQuery {
    pub fn new(limit: usize) -> Self {
        Self {
            tags: BTreeMap::new(),
            limit,
            status: None,
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_status(mut self, status: RunStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn matches(&self, run: &RemoteRun) -> bool {
        self.status.is_none_or(|s| s == run.status)
            && self
                .tags
                .iter()
                .all(|(k, v)| run.tags.get(k).is_some_and(|rv| rv == v))
    }
}

/// Remote experiment-tracking backend.
#[async_trait]
pub trait TrackingService: Send + Sync {
    /// Name used in diagnostics and logs.
    fn name(&self) -> &str;

    /// Runs matching every tag filter, at most `query.limit` of them.
    async fn search_runs(&self, query: &RunQuery) -> Result<Vec<RemoteRun>, TrackingError>;

    /// Download `artifact_path` of `run_id` into `dest`, returning the local path of the
    /// downloaded file or directory. Partial output is left for the caller to remove.
    async fn download_artifact(
        &self,
        run_id: &str,
        artifact_path: &str,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, TrackingError>;
}

/// In-process tracking service.
#[derive(Debug, Default)]
pub struct InMemoryTrackingService {
    runs: Mutex<Vec<RemoteRun>>,
    artifacts: Mutex<HashMap<(String, String), PathBuf>>,
    unavailable: AtomicBool,
    fail_next: AtomicU32,
    latency: Mutex<Option<Duration>>,
    search_calls: AtomicU32,
    download_calls: AtomicU32,
}

impl InMemoryTrackingService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_run(&self, run: RemoteRun) {
        if let Ok(mut runs) = self.runs.lock() {
            runs.push(run);
        }
    }

    /// Serve `source` (a file or directory) as `artifact_path` of `run_id`.
    pub fn add_artifact(&self, run_id: &str, artifact_path: &str, source: impl Into<PathBuf>) {
        if let Ok(mut artifacts) = self.artifacts.lock() {
            artifacts.insert(
                (run_id.to_string(), artifact_path.to_string()),
                source.into(),
            );
        }
    }

    /// Simulate a full outage.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Fail the next `n` calls with a transient error.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Delay every call, honouring cancellation during downloads.
    pub fn set_latency(&self, latency: Duration) {
        if let Ok(mut l) = self.latency.lock() {
            *l = Some(latency);
        }
    }

    pub fn search_calls(&self) -> u32 {
        self.search_calls.load(Ordering::SeqCst)
    }

    pub fn download_calls(&self) -> u32 {
        self.download_calls.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), TrackingError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(TrackingError::Unreachable {
                message: "in-memory service marked unavailable".into(),
            });
        }
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(TrackingError::Http {
                status: 503,
                message: "injected failure".into(),
            });
        }
        Ok(())
    }

    fn latency(&self) -> Option<Duration> {
        self.latency.lock().ok().and_then(|l| *l)
    }
}

#[async_trait]
impl TrackingService for InMemoryTrackingService {
    fn name(&self) -> &str {
        "in-memory"
    }

    async fn search_runs(&self, query: &RunQuery) -> Result<Vec<RemoteRun>, TrackingError> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency() {
            tokio::time::sleep(latency).await;
        }
        self.check_available()?;
        let runs = self.runs.lock().map_err(|e| TrackingError::Unreachable {
            message: e.to_string(),
        })?;
        Ok(runs
            .iter()
            .filter(|r| query.matches(r))
            .take(query.limit)
            .cloned()
            .collect())
    }

    async fn download_artifact(
        &self,
        run_id: &str,
        artifact_path: &str,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, TrackingError> {
        self.download_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(TrackingError::Cancelled),
                _ = tokio::time::sleep(latency) => {}
            }
        }
        self.check_available()?;
        let source = self
            .artifacts
            .lock()
            .ok()
            .and_then(|a| a.get(&(run_id.to_string(), artifact_path.to_string())).cloned())
            .ok_or_else(|| TrackingError::NotFound {
                what: format!("artifact '{artifact_path}' of run {run_id}"),
            })?;
        let name = source
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| artifact_path.into());
        let target = dest.join(name);
        copy_tree(&source, &target, cancel)?;
        Ok(target)
    }
}

fn copy_tree(
    source: &Path,
    target: &Path,
    cancel: &CancellationToken,
) -> Result<(), TrackingError> {
    let transfer = |e: std::io::Error| TrackingError::Transfer {
        message: e.to_string(),
    };
    if source.is_file() {
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(transfer)?;
        }
        std::fs::copy(source, target).map_err(transfer)?;
        return Ok(());
    }
    for entry in walkdir::WalkDir::new(source) {
        if cancel.is_cancelled() {
            return Err(TrackingError::Cancelled);
        }
        let entry = entry.map_err(|e| TrackingError::Transfer {
            message: e.to_string(),
        })?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| TrackingError::Transfer {
                message: e.to_string(),
            })?;
        let out = target.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&out).map_err(transfer)?;
        } else {
            std::fs::copy(entry.path(), &out).map_err(transfer)?;
        }
    }
    Ok(())
}
