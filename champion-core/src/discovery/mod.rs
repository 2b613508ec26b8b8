//! Trial discovery across the local directory tree and the tracking service.
//!
//! Both backends are queried concurrently and normalized into [`TrialRecord`]s. Backend
//! and record-level problems never fail discovery; they are reported as [`Diagnostic`]s
//! next to whatever records could be found.

mod disk;
mod merge;
mod remote;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{DiscoveryConfig, RetryConfig};
use crate::error::DiscoveryError;
use crate::keys::{Identity, KeyBuilder, SchemaVersion};
use crate::layout::StudyLayout;
use crate::naming::NamingContext;
use crate::record::TrialRecord;
use crate::tracking::TrackingService;

/// Which identity scheme discovery searches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaPreference {
    V1,
    V2,
    /// v2, falling back to v1 when no v2 records exist.
    #[default]
    Auto,
}

impl SchemaPreference {
    /// Schemes to try, most preferred first.
    pub fn versions(self) -> &'static [SchemaVersion] {
        match self {
            SchemaPreference::V1 => &[SchemaVersion::V1],
            SchemaPreference::V2 => &[SchemaVersion::V2],
            SchemaPreference::Auto => &[SchemaVersion::V2, SchemaVersion::V1],
        }
    }
}

impl fmt::Display for SchemaPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaPreference::V1 => write!(f, "v1"),
            SchemaPreference::V2 => write!(f, "v2"),
            SchemaPreference::Auto => write!(f, "auto"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryOptions {
    pub schema: SchemaPreference,
    pub remote_limit: usize,
    pub include_folds: bool,
    pub remote_timeout: Duration,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self::from(&DiscoveryConfig::default())
    }
}

impl From<&DiscoveryConfig> for DiscoveryOptions {
    fn from(config: &DiscoveryConfig) -> Self {
        Self {
            schema: config.schema,
            remote_limit: config.remote_limit,
            include_folds: config.include_folds,
            remote_timeout: Duration::from_secs(config.remote_timeout_secs),
        }
    }
}

/// A recovered problem or notable event during discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "diagnostic", rename_all = "snake_case")]
pub enum Diagnostic {
    /// A backend or record failed and was skipped.
    Recovered { error: DiscoveryError },
    /// Disk and tracking service disagree on a metric; the disk value was kept.
    MetricMismatch {
        trial: Identity,
        fold_index: Option<u32>,
        metric: String,
        disk: f64,
        remote: f64,
    },
    /// Metadata still being written; treated as not yet present.
    IncompleteRecord { location: String },
    /// The name-based legacy layout was scanned.
    LegacyLayout { path: PathBuf },
    /// No records under the preferred scheme; results come from the fallback.
    SchemaFallback {
        preferred: SchemaVersion,
        used: SchemaVersion,
    },
    /// The remote query returned as many runs as allowed; more may exist.
    RemoteLimitReached { limit: usize },
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::Recovered { error } => write!(f, "{error}"),
            Diagnostic::MetricMismatch {
                trial,
                fold_index,
                metric,
                disk,
                remote,
            } => write!(
                f,
                "Metric '{metric}' of trial {trial} (fold {}) differs: \
                 disk {disk}, remote {remote}",
                fold_index.map_or("-".to_string(), |k| k.to_string())
            ),
            Diagnostic::IncompleteRecord { location } => {
                write!(f, "Incomplete record at {location}")
            }
            Diagnostic::LegacyLayout { path } => {
                write!(f, "Used legacy layout at {}", path.display())
            }
            Diagnostic::SchemaFallback { preferred, used } => {
                write!(f, "No {preferred} records; fell back to {used}")
            }
            Diagnostic::RemoteLimitReached { limit } => {
                write!(f, "Remote query hit its limit of {limit} runs")
            }
        }
    }
}

impl From<DiscoveryError> for Diagnostic {
    fn from(error: DiscoveryError) -> Self {
        Diagnostic::Recovered { error }
    }
}

/// Records found for one study plus everything that went wrong finding them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryReport {
    /// Sorted by trial identity, then fold (aggregate first).
    pub records: Vec<TrialRecord>,
    pub diagnostics: Vec<Diagnostic>,
    /// Scheme the records belong to; `None` when nothing was found.
    pub schema_used: Option<SchemaVersion>,
}

impl DiscoveryReport {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn backend_unavailable(&self) -> bool {
        self.diagnostics.iter().any(|d| {
            matches!(
                d,
                Diagnostic::Recovered {
                    error: DiscoveryError::BackendUnavailable { .. }
                }
            )
        })
    }
}

/// Identity fields of one study under one scheme, detached from the context so the
/// blocking disk scan can own them.
#[derive(Debug, Clone)]
pub(crate) struct ScanTarget {
    pub version: SchemaVersion,
    pub study: Identity,
    pub family: Identity,
    pub backbone: String,
    pub study_name: String,
    pub legacy_study_key: Option<String>,
}

impl ScanTarget {
    fn new(context: &NamingContext, version: SchemaVersion) -> Self {
        Self {
            version,
            study: context.study_identity(version).clone(),
            family: context.family_identity(version).clone(),
            backbone: context.backbone().to_string(),
            study_name: context.study_name().to_string(),
            legacy_study_key: (version == SchemaVersion::V1)
                .then(|| context.study_key(version).as_str().to_string()),
        }
    }
}

/// Discovers trial records for a study.
#[derive(Clone)]
pub struct TrialDiscovery {
    layout: StudyLayout,
    keys: KeyBuilder,
    tracking: Option<Arc<dyn TrackingService>>,
    retry: RetryConfig,
}

impl fmt::Debug for TrialDiscovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrialDiscovery")
            .field("root", &self.layout.root())
            .field("tracking", &self.tracking.as_ref().map(|t| t.name().to_string()))
            .finish()
    }
}

impl TrialDiscovery {
    pub fn new(layout: StudyLayout, keys: KeyBuilder) -> Self {
        Self {
            layout,
            keys,
            tracking: None,
            retry: RetryConfig::default(),
        }
    }

    pub fn with_tracking(mut self, service: Arc<dyn TrackingService>, retry: RetryConfig) -> Self {
        self.tracking = Some(service);
        self.retry = retry;
        self
    }

    pub fn layout(&self) -> &StudyLayout {
        &self.layout
    }

    /// Find every completed trial of the context's study. Never fails.
    pub async fn find_trials_for_study(
        &self,
        context: &NamingContext,
        options: &DiscoveryOptions,
    ) -> DiscoveryReport {
        let versions = options.schema.versions();
        let mut diagnostics = Vec::new();
        for (idx, &version) in versions.iter().enumerate() {
            let target = ScanTarget::new(context, version);
            let (records, mut diags) = self.discover_version(target, options).await;
            diagnostics.append(&mut diags);
            if !records.is_empty() {
                if idx > 0 {
                    let fallback = Diagnostic::SchemaFallback {
                        preferred: versions[0],
                        used: version,
                    };
                    tracing::warn!(
                        backbone = context.backbone(),
                        preferred = %versions[0],
                        used = %version,
                        "Falling back to legacy identity scheme"
                    );
                    diagnostics.push(fallback);
                }
                tracing::info!(
                    backbone = context.backbone(),
                    study = %context.study_identity(version),
                    records = records.len(),
                    diagnostics = diagnostics.len(),
                    "Discovered trial records"
                );
                return DiscoveryReport {
                    records,
                    diagnostics,
                    schema_used: Some(version),
                };
            }
        }
        tracing::info!(
            backbone = context.backbone(),
            schema = %options.schema,
            diagnostics = diagnostics.len(),
            "No trial records found"
        );
        DiscoveryReport {
            records: Vec::new(),
            diagnostics,
            schema_used: None,
        }
    }

    async fn discover_version(
        &self,
        target: ScanTarget,
        options: &DiscoveryOptions,
    ) -> (Vec<TrialRecord>, Vec<Diagnostic>) {
        let layout = self.layout.clone();
        let keys = self.keys.clone();
        let disk_target = target.clone();
        let include_folds = options.include_folds;
        let disk = tokio::task::spawn_blocking(move || {
            disk::scan(&layout, &keys, &disk_target, include_folds)
        });
        let remote = async {
            match &self.tracking {
                Some(service) => {
                    remote::query(service.as_ref(), &self.retry, &target, options).await
                }
                None => remote::RemoteScan::default(),
            }
        };
        let (disk, remote) = tokio::join!(disk, remote);

        let mut diagnostics = Vec::new();
        let disk = match disk {
            Ok(scan) => {
                diagnostics.extend(scan.diagnostics);
                scan.records
            }
            Err(e) => {
                tracing::warn!(error = %e, "Disk scan task failed");
                diagnostics.push(
                    DiscoveryError::BackendUnavailable {
                        backend: "disk".into(),
                        message: e.to_string(),
                    }
                    .into(),
                );
                Vec::new()
            }
        };
        diagnostics.extend(remote.diagnostics);
        let records = merge::merge(disk, remote.records, &mut diagnostics);
        (records, diagnostics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::StudyInputs;
    use crate::layout::{TrialMetadata, write_trial_metadata};
    use crate::naming::tags;
    use crate::record::RecordSource;
    use crate::tracking::{InMemoryTrackingService, RemoteRun};
    use serde_json::json;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn context() -> NamingContext {
        let inputs = StudyInputs::new(&json!({"dataset": "ner"}), &json!({"lr": [1, 2]}), "bert")
            .unwrap();
        NamingContext::build(&KeyBuilder::default(), &inputs)
    }

    fn metrics(v: f64) -> BTreeMap<String, f64> {
        let mut m = BTreeMap::new();
        m.insert("eval_f1".to_string(), v);
        m
    }

    fn write_trial(
        layout: &StudyLayout,
        ctx: &NamingContext,
        version: SchemaVersion,
        lr: f64,
        f1: f64,
    ) -> Identity {
        let keys = KeyBuilder::default();
        let study = ctx.study_identity(version);
        let hp = json!({"lr": lr});
        let trial = keys.trial_key(study, &hp).unwrap();
        let dir = layout.trial_dir(study, trial.identity());
        let meta = TrialMetadata::completed(study, trial.identity(), None, metrics(f1))
            .with_hyperparameters(hp);
        write_trial_metadata(&dir, &meta).unwrap();
        trial.identity().clone()
    }

    fn options() -> DiscoveryOptions {
        DiscoveryOptions {
            remote_timeout: Duration::from_secs(2),
            ..Default::default()
        }
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_retries: 1,
            initial_backoff_ms: 1,
            max_backoff_ms: 1,
            backoff_multiplier: 1.0,
            jitter: false,
        }
    }

    #[tokio::test]
    async fn test_disk_only_discovery() {
        let dir = TempDir::new().unwrap();
        let layout = StudyLayout::new(dir.path());
        let ctx = context();
        write_trial(&layout, &ctx, SchemaVersion::V2, 1e-5, 0.8);
        write_trial(&layout, &ctx, SchemaVersion::V2, 2e-5, 0.9);

        let discovery = TrialDiscovery::new(layout, KeyBuilder::default());
        let report = discovery.find_trials_for_study(&ctx, &options()).await;
        assert_eq!(report.records.len(), 2);
        assert_eq!(report.schema_used, Some(SchemaVersion::V2));
        assert!(report.diagnostics.is_empty());
        assert!(report.records[0].trial < report.records[1].trial);
    }

    #[tokio::test]
    async fn test_discovery_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let layout = StudyLayout::new(dir.path());
        let ctx = context();
        for i in 0..4 {
            write_trial(&layout, &ctx, SchemaVersion::V2, i as f64 * 1e-5, 0.5);
        }
        let discovery = TrialDiscovery::new(layout, KeyBuilder::default());
        let a = discovery.find_trials_for_study(&ctx, &options()).await;
        let b = discovery.find_trials_for_study(&ctx, &options()).await;
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_auto_falls_back_to_v1() {
        let dir = TempDir::new().unwrap();
        let layout = StudyLayout::new(dir.path());
        let ctx = context();
        write_trial(&layout, &ctx, SchemaVersion::V1, 1e-5, 0.7);

        let discovery = TrialDiscovery::new(layout, KeyBuilder::default());
        let report = discovery.find_trials_for_study(&ctx, &options()).await;
        assert_eq!(report.schema_used, Some(SchemaVersion::V1));
        assert_eq!(report.records[0].schema_version(), SchemaVersion::V1);
        assert!(
            report
                .diagnostics
                .iter()
                .any(|d| matches!(d, Diagnostic::SchemaFallback { .. }))
        );
    }

    #[tokio::test]
    async fn test_explicit_v2_ignores_v1_records() {
        let dir = TempDir::new().unwrap();
        let layout = StudyLayout::new(dir.path());
        let ctx = context();
        write_trial(&layout, &ctx, SchemaVersion::V1, 1e-5, 0.7);
        let discovery = TrialDiscovery::new(layout, KeyBuilder::default());
        let opts = DiscoveryOptions {
            schema: SchemaPreference::V2,
            ..options()
        };
        let report = discovery.find_trials_for_study(&ctx, &opts).await;
        assert!(report.is_empty());
        assert_eq!(report.schema_used, None);
    }

    #[tokio::test]
    async fn test_remote_outage_degrades_to_disk() {
        let dir = TempDir::new().unwrap();
        let layout = StudyLayout::new(dir.path());
        let ctx = context();
        write_trial(&layout, &ctx, SchemaVersion::V2, 1e-5, 0.8);

        let service = Arc::new(InMemoryTrackingService::new());
        service.set_available(false);
        let discovery = TrialDiscovery::new(layout, KeyBuilder::default())
            .with_tracking(service.clone(), fast_retry());
        let report = discovery.find_trials_for_study(&ctx, &options()).await;
        assert_eq!(report.records.len(), 1);
        assert!(report.backend_unavailable());
        assert_eq!(service.search_calls(), 2);
    }

    #[tokio::test]
    async fn test_remote_records_merge_with_disk() {
        let dir = TempDir::new().unwrap();
        let layout = StudyLayout::new(dir.path());
        let ctx = context();
        let on_disk = write_trial(&layout, &ctx, SchemaVersion::V2, 1e-5, 0.8);

        let keys = KeyBuilder::default();
        let remote_only = keys
            .trial_key(ctx.study_identity(SchemaVersion::V2), &json!({"lr": 9e-5}))
            .unwrap();
        let service = Arc::new(InMemoryTrackingService::new());
        service.add_run(
            RemoteRun::new("run-disk")
                .with_tags(ctx.tracking_tags(SchemaVersion::V2))
                .with_tag(tags::TRIAL_KEY_HASH, on_disk.hash().as_str())
                .with_metric("eval_f1", 0.8),
        );
        service.add_run(
            RemoteRun::new("run-remote")
                .with_tags(ctx.tracking_tags(SchemaVersion::V2))
                .with_tag(tags::TRIAL_KEY_HASH, remote_only.hash().as_str())
                .with_metric("eval_f1", 0.85),
        );

        let discovery = TrialDiscovery::new(layout, KeyBuilder::default())
            .with_tracking(service, fast_retry());
        let report = discovery.find_trials_for_study(&ctx, &options()).await;
        assert_eq!(report.records.len(), 2);
        let merged = report
            .records
            .iter()
            .find(|r| r.trial == on_disk)
            .unwrap();
        assert_eq!(merged.source, RecordSource::Disk);
        assert_eq!(merged.location.run_id.as_deref(), Some("run-disk"));
        let remote = report
            .records
            .iter()
            .find(|r| r.trial == *remote_only.identity())
            .unwrap();
        assert_eq!(remote.source, RecordSource::TrackingService);
    }

    #[tokio::test]
    async fn test_remote_timeout_is_diagnosed() {
        let dir = TempDir::new().unwrap();
        let ctx = context();
        let service = Arc::new(InMemoryTrackingService::new());
        service.set_latency(Duration::from_secs(30));
        let discovery = TrialDiscovery::new(StudyLayout::new(dir.path()), KeyBuilder::default())
            .with_tracking(service, fast_retry());
        let opts = DiscoveryOptions {
            schema: SchemaPreference::V2,
            remote_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let report = discovery.find_trials_for_study(&ctx, &opts).await;
        assert!(report.is_empty());
        assert!(report.backend_unavailable());
    }

    #[tokio::test]
    async fn test_excluding_folds_keeps_only_aggregates() {
        let dir = TempDir::new().unwrap();
        let layout = StudyLayout::new(dir.path());
        let ctx = context();
        let study = ctx.study_identity(SchemaVersion::V2).clone();
        let on_disk = write_trial(&layout, &ctx, SchemaVersion::V2, 1e-5, 0.8);
        let trial_dir = layout.trial_dir(&study, &on_disk);
        for k in 0..3 {
            let meta = TrialMetadata::completed(&study, &on_disk, None, metrics(0.8)).with_fold(k);
            write_trial_metadata(&StudyLayout::fold_dir(&trial_dir, k), &meta).unwrap();
        }

        let remote_trial = KeyBuilder::default()
            .trial_key(&study, &json!({"lr": 9e-5}))
            .unwrap();
        let service = Arc::new(InMemoryTrackingService::new());
        service.add_run(
            RemoteRun::new("remote-fold")
                .with_tags(ctx.tracking_tags(SchemaVersion::V2))
                .with_tag(tags::TRIAL_KEY_HASH, remote_trial.hash().as_str())
                .with_tag(tags::FOLD_INDEX, "0")
                .with_metric("eval_f1", 0.9),
        );
        let discovery = TrialDiscovery::new(layout, KeyBuilder::default())
            .with_tracking(service, fast_retry());

        let everything = discovery.find_trials_for_study(&ctx, &options()).await;
        assert_eq!(everything.records.len(), 5);

        let opts = DiscoveryOptions {
            include_folds: false,
            ..options()
        };
        let report = discovery.find_trials_for_study(&ctx, &opts).await;
        assert_eq!(report.records.len(), 1);
        assert!(report.records.iter().all(|r| r.fold_index.is_none()));
        assert_eq!(report.records[0].trial, on_disk);
    }
}
