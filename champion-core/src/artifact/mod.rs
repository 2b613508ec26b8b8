//! Artifact resolution for selected trials.
//!
//! [`ArtifactResolver::resolve_artifact`] walks an ordered probe chain and stops at the
//! first step that yields a validated directory:
//!
//! 1. the local `checkpoint/` directory of the trial,
//! 2. a local checkpoint archive, extracted into the scratch directory,
//! 3. the checkpoint artifact of the trial's tracking run, extracted when archived,
//! 4. the offline backup root, direct or archived.
//!
//! Scratch extractions are written to a `.partial` directory and renamed into place, so a
//! concurrent reader never sees half an artifact. They are kept on success and removed on
//! failure or cancellation. A kept extraction is reused only while the content hash of
//! its source archive is unchanged.

pub mod archive;
mod validate;

pub use validate::{ArtifactValidator, ValidationMode};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::{ChampionConfig, RetryConfig};
use crate::error::{ResolveError, TrackingError};
use crate::layout::{self, CheckpointState, StudyLayout};
use crate::record::TrialRecord;
use crate::retry::with_retry;
use crate::tracking::TrackingService;

/// One step of the probe chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProbeStep {
    LocalDirect,
    LocalArchive,
    Remote,
    Backup,
}

impl ProbeStep {
    pub const CHAIN: [ProbeStep; 4] = [
        ProbeStep::LocalDirect,
        ProbeStep::LocalArchive,
        ProbeStep::Remote,
        ProbeStep::Backup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeStep::LocalDirect => "local-direct",
            ProbeStep::LocalArchive => "local-archive",
            ProbeStep::Remote => "remote",
            ProbeStep::Backup => "backup",
        }
    }
}

impl fmt::Display for ProbeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a probe step did not produce an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    NotFound,
    Unreachable,
    ValidationFailed,
    Skipped,
    Cancelled,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::NotFound => "not found",
            FailureKind::Unreachable => "unreachable",
            FailureKind::ValidationFailed => "failed validation",
            FailureKind::Skipped => "skipped",
            FailureKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFailure {
    pub step: ProbeStep,
    pub kind: FailureKind,
    pub detail: String,
}

impl StepFailure {
    pub fn new(step: ProbeStep, kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            step,
            kind,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} ({})", self.step, self.kind, self.detail)
    }
}

/// A validated artifact directory and how it was obtained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactLocation {
    pub path: PathBuf,
    pub step: ProbeStep,
    /// Whether the directory was produced by extracting an archive.
    pub extracted: bool,
    /// The validation mode the directory passed.
    pub validation: ValidationMode,
    /// Directory, archive or `run:<id>/<path>` the artifact came from.
    pub origin: String,
}

type StepResult = Result<ArtifactLocation, StepFailure>;

/// File inside an extracted scratch slot holding the source archive's content hash.
const SOURCE_MARKER: &str = ".source-sha256";

/// Resolves a trial record to a validated artifact directory.
#[derive(Clone)]
pub struct ArtifactResolver {
    layout: StudyLayout,
    backup: Option<PathBuf>,
    scratch_dir: PathBuf,
    validator: ArtifactValidator,
    tracking: Option<Arc<dyn TrackingService>>,
    retry: RetryConfig,
    artifact_path: String,
    remote_timeout: Duration,
}

impl fmt::Debug for ArtifactResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArtifactResolver")
            .field("root", &self.layout.root())
            .field("backup", &self.backup)
            .field("scratch_dir", &self.scratch_dir)
            .field("mode", &self.validator.mode())
            .field("tracking", &self.tracking.as_ref().map(|t| t.name().to_string()))
            .finish()
    }
}

impl ArtifactResolver {
    pub fn new(
        layout: StudyLayout,
        scratch_dir: impl Into<PathBuf>,
        validator: ArtifactValidator,
    ) -> Self {
        Self {
            layout,
            backup: None,
            scratch_dir: scratch_dir.into(),
            validator,
            tracking: None,
            retry: RetryConfig::default(),
            artifact_path: layout::CHECKPOINT_DIR.to_string(),
            remote_timeout: Duration::from_secs(600),
        }
    }

    /// Resolver over the configured roots, without a tracking service.
    pub fn from_config(config: &ChampionConfig) -> Self {
        let mut resolver = Self::new(
            StudyLayout::new(&config.storage.root),
            config.storage.scratch_dir(),
            ArtifactValidator::from_config(&config.validation),
        );
        resolver.backup = config.storage.backup_root.clone();
        resolver.retry = config.tracking.retry.clone();
        resolver.artifact_path = config.tracking.artifact_path.clone();
        resolver.remote_timeout = config.tracking.download_timeout();
        resolver
    }

    pub fn with_backup(mut self, root: impl Into<PathBuf>) -> Self {
        self.backup = Some(root.into());
        self
    }

    pub fn with_tracking(mut self, service: Arc<dyn TrackingService>, retry: RetryConfig) -> Self {
        self.tracking = Some(service);
        self.retry = retry;
        self
    }

    /// Artifact path used when a record carries none.
    pub fn with_artifact_path(mut self, artifact_path: impl Into<String>) -> Self {
        self.artifact_path = artifact_path.into();
        self
    }

    pub fn with_remote_timeout(mut self, timeout: Duration) -> Self {
        self.remote_timeout = timeout;
        self
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    pub fn validator(&self) -> &ArtifactValidator {
        &self.validator
    }

    /// Probe each step in order and return the first validated artifact.
    pub async fn resolve_artifact(
        &self,
        record: &TrialRecord,
        cancel: &CancellationToken,
    ) -> Result<ArtifactLocation, ResolveError> {
        let trial = record.trial.to_string();
        let mut attempts = Vec::with_capacity(ProbeStep::CHAIN.len());
        for step in ProbeStep::CHAIN {
            if cancel.is_cancelled() {
                tracing::info!(trial = %trial, step = %step, "Artifact resolution cancelled");
                return Err(ResolveError::Cancelled { trial });
            }
            let result = match step {
                ProbeStep::LocalDirect | ProbeStep::LocalArchive | ProbeStep::Backup => {
                    self.probe_blocking(step, record).await
                }
                ProbeStep::Remote => self.probe_remote(record, cancel).await,
            };
            match result {
                Ok(location) => {
                    tracing::info!(
                        trial = %trial,
                        step = %location.step,
                        path = %location.path.display(),
                        extracted = location.extracted,
                        validation = %location.validation,
                        "Resolved artifact"
                    );
                    return Ok(location);
                }
                Err(failure) if failure.kind == FailureKind::Cancelled => {
                    tracing::info!(trial = %trial, step = %step, "Artifact resolution cancelled");
                    return Err(ResolveError::Cancelled { trial });
                }
                Err(failure) => {
                    tracing::debug!(trial = %trial, failure = %failure, "Probe step failed");
                    attempts.push(failure);
                }
            }
        }
        tracing::warn!(trial = %trial, attempts = attempts.len(), "No usable artifact found");
        Err(ResolveError::ArtifactNotFound { trial, attempts })
    }

    /// Cheap check used to filter candidates before selection: a lenient-valid local
    /// checkpoint directory or any local checkpoint archive. Nothing is extracted.
    pub fn is_locally_available(&self, record: &TrialRecord) -> bool {
        let lenient = self.validator.with_mode(ValidationMode::Lenient);
        let trial_dir = self.local_trial_dir(record);
        match layout::find_checkpoint(&trial_dir) {
            CheckpointState::Directory(dir) => {
                lenient.locate(&dir).is_ok()
                    || layout::find_checkpoint_archive(&trial_dir).is_some()
            }
            CheckpointState::Archive(_) => true,
            CheckpointState::Absent => false,
        }
    }

    /// False only when no step could possibly produce the artifact: nothing local, no
    /// reachable tracking run and no backup root.
    pub fn may_resolve(&self, record: &TrialRecord) -> bool {
        self.is_locally_available(record)
            || (self.tracking.is_some() && record.location.run_id.is_some())
            || self.backup.as_deref().is_some_and(Path::is_dir)
    }

    fn local_trial_dir(&self, record: &TrialRecord) -> PathBuf {
        if let Some(path) = &record.location.path {
            return path.clone();
        }
        if let Some(relative) = &record.location.relative_path {
            return self.layout.root().join(relative);
        }
        self.layout.trial_dir(&record.study, &record.trial)
    }

    fn relative_trial_dir(&self, record: &TrialRecord) -> Option<PathBuf> {
        if let Some(relative) = &record.location.relative_path {
            return Some(relative.clone());
        }
        self.layout.relative_to_root(&self.local_trial_dir(record))
    }

    async fn probe_blocking(&self, step: ProbeStep, record: &TrialRecord) -> StepResult {
        let this = self.clone();
        let record = record.clone();
        tokio::task::spawn_blocking(move || match step {
            ProbeStep::LocalDirect => this.probe_local_direct(&record),
            ProbeStep::LocalArchive => this.probe_local_archive(&record),
            _ => this.probe_backup(&record),
        })
        .await
        .unwrap_or_else(|e| {
            Err(StepFailure::new(
                step,
                FailureKind::Unreachable,
                format!("probe task failed: {e}"),
            ))
        })
    }

    fn probe_local_direct(&self, record: &TrialRecord) -> StepResult {
        let trial_dir = self.local_trial_dir(record);
        let dir = trial_dir.join(layout::CHECKPOINT_DIR);
        if !dir.is_dir() {
            return Err(StepFailure::new(
                ProbeStep::LocalDirect,
                FailureKind::NotFound,
                format!("no {}", dir.display()),
            ));
        }
        self.validated(ProbeStep::LocalDirect, &dir, false, dir.display().to_string())
    }

    fn probe_local_archive(&self, record: &TrialRecord) -> StepResult {
        let trial_dir = self.local_trial_dir(record);
        let Some(archive) = layout::find_checkpoint_archive(&trial_dir) else {
            return Err(StepFailure::new(
                ProbeStep::LocalArchive,
                FailureKind::NotFound,
                format!("no checkpoint archive in {}", trial_dir.display()),
            ));
        };
        self.extract_to_scratch(ProbeStep::LocalArchive, record, &archive)
    }

    fn probe_backup(&self, record: &TrialRecord) -> StepResult {
        let Some(backup_root) = &self.backup else {
            return Err(StepFailure::new(
                ProbeStep::Backup,
                FailureKind::Skipped,
                "no backup root configured",
            ));
        };
        let Some(relative) = self.relative_trial_dir(record) else {
            return Err(StepFailure::new(
                ProbeStep::Backup,
                FailureKind::Skipped,
                "trial directory is not under the primary root",
            ));
        };
        let trial_dir = backup_root.join(relative);
        if !backup_root.is_dir() {
            return Err(StepFailure::new(
                ProbeStep::Backup,
                FailureKind::Unreachable,
                format!("backup root {} is not mounted", backup_root.display()),
            ));
        }
        match layout::find_checkpoint(&trial_dir) {
            CheckpointState::Directory(dir) => {
                let direct =
                    self.validated(ProbeStep::Backup, &dir, false, dir.display().to_string());
                match (direct, layout::find_checkpoint_archive(&trial_dir)) {
                    (Ok(location), _) => Ok(location),
                    (Err(_), Some(archive)) => {
                        self.extract_to_scratch(ProbeStep::Backup, record, &archive)
                    }
                    (Err(failure), None) => Err(failure),
                }
            }
            CheckpointState::Archive(archive) => {
                self.extract_to_scratch(ProbeStep::Backup, record, &archive)
            }
            CheckpointState::Absent => Err(StepFailure::new(
                ProbeStep::Backup,
                FailureKind::NotFound,
                format!("no checkpoint under {}", trial_dir.display()),
            )),
        }
    }

    async fn probe_remote(&self, record: &TrialRecord, cancel: &CancellationToken) -> StepResult {
        let step = ProbeStep::Remote;
        let Some(service) = &self.tracking else {
            return Err(StepFailure::new(
                step,
                FailureKind::Skipped,
                "no tracking service configured",
            ));
        };
        let Some(run_id) = record.location.run_id.as_deref() else {
            return Err(StepFailure::new(step, FailureKind::Skipped, "record has no tracking run"));
        };
        let artifact_path = record
            .location
            .artifact_path
            .as_deref()
            .unwrap_or(self.artifact_path.as_str());
        let origin = format!("run:{run_id}/{artifact_path}");

        let download_dir = self
            .scratch_dir
            .join(format!(".download-{}", uuid::Uuid::new_v4()));
        let download = with_retry(&self.retry, || {
            service.download_artifact(run_id, artifact_path, &download_dir, cancel)
        });
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(TrackingError::Cancelled),
            r = tokio::time::timeout(self.remote_timeout, download) => r.unwrap_or(Err(
                TrackingError::Timeout { timeout_secs: self.remote_timeout.as_secs() },
            )),
        };
        let downloaded = match result {
            Ok(path) => path,
            Err(e) => {
                remove_scratch(&download_dir);
                let kind = match e {
                    TrackingError::Cancelled => FailureKind::Cancelled,
                    TrackingError::NotFound { .. } => FailureKind::NotFound,
                    _ => FailureKind::Unreachable,
                };
                return Err(StepFailure::new(step, kind, format!("{origin}: {e}")));
            }
        };
        if cancel.is_cancelled() {
            remove_scratch(&download_dir);
            return Err(StepFailure::new(step, FailureKind::Cancelled, origin));
        }

        let this = self.clone();
        let record = record.clone();
        let cleanup = download_dir.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            if downloaded.is_file() && archive::ArchiveFormat::detect(&downloaded).is_some() {
                this.extract_to_scratch(step, &record, &downloaded)
                    .map(|loc| ArtifactLocation { origin: origin.clone(), ..loc })
            } else if downloaded.is_dir() {
                this.adopt_download(&record, &downloaded, origin)
            } else {
                Err(StepFailure::new(
                    step,
                    FailureKind::ValidationFailed,
                    format!("{origin}: downloaded artifact is neither a directory nor an archive"),
                ))
            }
        })
        .await
        .unwrap_or_else(|e| {
            Err(StepFailure::new(
                step,
                FailureKind::Unreachable,
                format!("probe task failed: {e}"),
            ))
        });
        remove_scratch(&cleanup);
        outcome
    }

    /// Move a fresh download into its scratch slot, replacing any earlier one, and
    /// validate it there.
    fn adopt_download(
        &self,
        record: &TrialRecord,
        downloaded: &Path,
        origin: String,
    ) -> StepResult {
        let step = ProbeStep::Remote;
        let target = self.scratch_slot(record, step);
        remove_scratch(&target);
        if let Err(e) = std::fs::rename(downloaded, &target) {
            return Err(StepFailure::new(step, FailureKind::Unreachable, format!("{origin}: {e}")));
        }
        let result = self.validated(step, &target, true, origin);
        if result.is_err() {
            remove_scratch(&target);
        }
        result
    }

    fn scratch_slot(&self, record: &TrialRecord, step: ProbeStep) -> PathBuf {
        let hash = record.trial.hash().as_str();
        let prefix = &hash[..hash.len().min(16)];
        self.scratch_dir.join(format!("{prefix}-{step}"))
    }

    /// Extract `archive` into the trial's scratch slot for `step`. An earlier extraction
    /// is reused only when it came from an archive with the same content hash.
    fn extract_to_scratch(
        &self,
        step: ProbeStep,
        record: &TrialRecord,
        archive: &Path,
    ) -> StepResult {
        let origin = archive.display().to_string();
        let source = archive::content_hash(archive).map_err(|e| {
            StepFailure::new(step, FailureKind::Unreachable, format!("{origin}: {e}"))
        })?;
        let target = self.scratch_slot(record, step);
        if target.is_dir() {
            if slot_source(&target).as_deref() == Some(source.as_str()) {
                if let Ok(location) = self.validated(step, &target, true, origin.clone()) {
                    tracing::debug!(path = %target.display(), "Reusing extracted artifact");
                    return Ok(location);
                }
            } else {
                tracing::info!(
                    path = %target.display(),
                    archive = %origin,
                    "Archive changed since last extraction"
                );
            }
            remove_scratch(&target);
        }

        let partial = self.scratch_dir.join(format!(
            ".{}.{}.partial",
            target.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default(),
            uuid::Uuid::new_v4()
        ));
        let files = match archive::extract(archive, &partial)
            .and_then(|n| std::fs::write(partial.join(SOURCE_MARKER), &source).map(|()| n))
        {
            Ok(n) => n,
            Err(e) => {
                remove_scratch(&partial);
                tracing::warn!(archive = %origin, error = %e, "Archive extraction failed");
                return Err(StepFailure::new(
                    step,
                    FailureKind::ValidationFailed,
                    format!("{origin}: extraction failed: {e}"),
                ));
            }
        };
        if let Err(e) = std::fs::rename(&partial, &target) {
            // Another process may have installed the same archive first.
            remove_scratch(&partial);
            if slot_source(&target).as_deref() != Some(source.as_str()) {
                return Err(StepFailure::new(
                    step,
                    FailureKind::Unreachable,
                    format!("{origin}: cannot install extraction: {e}"),
                ));
            }
        }
        tracing::debug!(archive = %origin, files, dest = %target.display(), "Extracted archive");

        let result = self.validated(step, &target, true, origin);
        if result.is_err() {
            remove_scratch(&target);
        }
        result
    }

    /// Strict first; the configured lenient mode is tried only when strict fails.
    fn validated(
        &self,
        step: ProbeStep,
        dir: &Path,
        extracted: bool,
        origin: String,
    ) -> StepResult {
        let strict = self.validator.with_mode(ValidationMode::Strict);
        let (path, validation) = match strict.locate(dir) {
            Ok(path) => (path, ValidationMode::Strict),
            Err(reason) if self.validator.mode() == ValidationMode::Lenient => {
                match self.validator.locate(dir) {
                    Ok(path) => (path, ValidationMode::Lenient),
                    Err(_) => {
                        return Err(StepFailure::new(step, FailureKind::ValidationFailed, reason));
                    }
                }
            }
            Err(reason) => {
                return Err(StepFailure::new(step, FailureKind::ValidationFailed, reason));
            }
        };
        Ok(ArtifactLocation {
            path,
            step,
            extracted,
            validation,
            origin,
        })
    }
}

/// Content hash of the archive a scratch slot was extracted from.
fn slot_source(slot: &Path) -> Option<String> {
    std::fs::read_to_string(slot.join(SOURCE_MARKER))
        .ok()
        .map(|s| s.trim().to_string())
}

fn remove_scratch(path: &Path) {
    if !path.exists() {
        return;
    }
    if let Err(e) = std::fs::remove_dir_all(path) {
        tracing::warn!(path = %path.display(), error = %e, "Failed to remove scratch directory");
    }
}
