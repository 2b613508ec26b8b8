//! On-disk layout of studies and trials.
//!
//! ```text
//! <root>/study-<short>/trial-<short>/trial_meta.json
//!                                   /checkpoint/ | checkpoint.tar.gz | checkpoint.tgz | checkpoint.zip
//!                                   /folds/fold-<k>/trial_meta.json
//! <root>/<study name>/trial_<n>/trial_meta.json      (legacy, v1 only)
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use crate::artifact::archive;
use crate::keys::{Identity, KeyHash, SchemaVersion};
use crate::persistence::{self, JsonRead};

pub const TRIAL_META_FILE: &str = "trial_meta.json";
pub const CHECKPOINT_DIR: &str = "checkpoint";
/// Preferred archive names next to a trial, in order. Any other archive in the trial
/// directory is picked up after these.
pub const CHECKPOINT_ARCHIVES: &[&str] =
    &["checkpoint.tar.gz", "checkpoint.tgz", "checkpoint.zip"];
pub const FOLDS_DIR: &str = "folds";

const STUDY_PREFIX: &str = "study-";
const TRIAL_PREFIX: &str = "trial-";
const LEGACY_TRIAL_PREFIX: &str = "trial_";
const FOLD_PREFIX: &str = "fold-";

pub fn study_dir_name(study: &Identity) -> String {
    format!("{STUDY_PREFIX}{}", study.short())
}

pub fn trial_dir_name(trial: &Identity) -> String {
    format!("{TRIAL_PREFIX}{}", trial.short())
}

pub fn fold_dir_name(fold_index: u32) -> String {
    format!("{FOLD_PREFIX}{fold_index}")
}

/// Short hash of a `trial-<short>` directory name.
pub fn parse_trial_dir_name(name: &str) -> Option<&str> {
    name.strip_prefix(TRIAL_PREFIX)
}

pub fn parse_fold_dir_name(name: &str) -> Option<u32> {
    name.strip_prefix(FOLD_PREFIX)?.parse().ok()
}

/// Trial number of a legacy `trial_<n>` directory name.
pub fn parse_legacy_trial_dir_name(name: &str) -> Option<u32> {
    name.strip_prefix(LEGACY_TRIAL_PREFIX)?.parse().ok()
}

/// Path arithmetic over a storage root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StudyLayout {
    root: PathBuf,
}

impl StudyLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn study_dir(&self, study: &Identity) -> PathBuf {
        self.root.join(study_dir_name(study))
    }

    pub fn legacy_study_dir(&self, study_name: &str) -> PathBuf {
        self.root.join(study_name)
    }

    pub fn trial_dir(&self, study: &Identity, trial: &Identity) -> PathBuf {
        self.study_dir(study).join(trial_dir_name(trial))
    }

    pub fn legacy_trial_dir(&self, study_name: &str, trial_number: u32) -> PathBuf {
        self.legacy_study_dir(study_name)
            .join(format!("{LEGACY_TRIAL_PREFIX}{trial_number}"))
    }

    pub fn fold_dir(trial_dir: &Path, fold_index: u32) -> PathBuf {
        trial_dir.join(FOLDS_DIR).join(fold_dir_name(fold_index))
    }

    /// Path of `dir` relative to the root, if it lives under it.
    pub fn relative_to_root(&self, dir: &Path) -> Option<PathBuf> {
        dir.strip_prefix(&self.root).ok().map(Path::to_path_buf)
    }
}

/// Lifecycle state recorded by the producer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrialStatus {
    Running,
    #[default]
    Completed,
    Failed,
    Pruned,
}

/// Contents of `trial_meta.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialMetadata {
    pub schema_version: SchemaVersion,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub study_key_hash: Option<KeyHash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trial_key_hash: Option<KeyHash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trial_number: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fold_index: Option<u32>,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    #[serde(default)]
    pub hyperparameters: serde_json::Value,
    #[serde(default)]
    pub status: TrialStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl TrialMetadata {
    /// Completed-trial metadata stamped with the current time.
    pub fn completed(
        study: &Identity,
        trial: &Identity,
        trial_number: Option<u32>,
        metrics: BTreeMap<String, f64>,
    ) -> Self {
        Self {
            schema_version: study.version(),
            study_key_hash: Some(study.hash().clone()),
            trial_key_hash: Some(trial.hash().clone()),
            trial_number,
            fold_index: None,
            metrics,
            hyperparameters: serde_json::Value::Null,
            status: TrialStatus::Completed,
            run_id: None,
            created_at: Some(Utc::now()),
        }
    }

    pub fn with_fold(mut self, fold_index: u32) -> Self {
        self.fold_index = Some(fold_index);
        self
    }

    pub fn with_hyperparameters(mut self, hyperparameters: serde_json::Value) -> Self {
        self.hyperparameters = hyperparameters;
        self
    }
}

/// Atomically write `trial_meta.json` into `dir`, returning the file path.
pub fn write_trial_metadata(dir: &Path, meta: &TrialMetadata) -> io::Result<PathBuf> {
    let path = dir.join(TRIAL_META_FILE);
    persistence::atomic_write_json(&path, meta)?;
    Ok(path)
}

pub fn read_trial_metadata(dir: &Path) -> JsonRead<TrialMetadata> {
    persistence::read_json(&dir.join(TRIAL_META_FILE))
}

/// What a trial directory holds as its checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointState {
    Directory(PathBuf),
    Archive(PathBuf),
    Absent,
}

/// Directory first, then archives as found by [`find_checkpoint_archive`].
pub fn find_checkpoint(trial_dir: &Path) -> CheckpointState {
    let dir = trial_dir.join(CHECKPOINT_DIR);
    if dir.is_dir() {
        return CheckpointState::Directory(dir);
    }
    match find_checkpoint_archive(trial_dir) {
        Some(archive) => CheckpointState::Archive(archive),
        None => CheckpointState::Absent,
    }
}

/// The [`CHECKPOINT_ARCHIVES`] names first, then any recognised archive file in the
/// trial directory in file name order.
pub fn find_checkpoint_archive(trial_dir: &Path) -> Option<PathBuf> {
    if let Some(preferred) = CHECKPOINT_ARCHIVES
        .iter()
        .map(|name| trial_dir.join(name))
        .find(|p| p.is_file())
    {
        return Some(preferred);
    }
    let mut archives: Vec<PathBuf> = std::fs::read_dir(trial_dir)
        .ok()?
        .flatten()
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .map(|e| e.path())
        .filter(|p| archive::ArchiveFormat::detect(p).is_some())
        .collect();
    archives.sort();
    archives.into_iter().next()
}

/// Pack `<trial_dir>/checkpoint/` into `<trial_dir>/checkpoint.tar.gz`.
///
/// With `remove_dir`, the directory is deleted once the archive is in place, leaving an
/// archive-only trial.
pub fn pack_checkpoint(trial_dir: &Path, remove_dir: bool) -> io::Result<PathBuf> {
    let source = trial_dir.join(CHECKPOINT_DIR);
    let dest = trial_dir.join(CHECKPOINT_ARCHIVES[0]);
    archive::pack_tar_gz(&source, &dest)?;
    if remove_dir {
        std::fs::remove_dir_all(&source)?;
    }
    tracing::debug!(archive = %dest.display(), "Packed checkpoint");
    Ok(dest)
}
