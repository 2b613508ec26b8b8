//! Tracking-service half of discovery.

use std::collections::BTreeSet;

use super::{Diagnostic, DiscoveryOptions, ScanTarget};
use crate::config::RetryConfig;
use crate::error::{DiscoveryError, TrackingError};
use crate::keys::{Identity, KeyHash};
use crate::naming::tags;
use crate::record::{LocationHint, RecordSource, TrialRecord};
use crate::retry::with_retry;
use crate::tracking::{RemoteRun, RunQuery, RunStatus, TrackingService};

#[derive(Debug, Default)]
pub(crate) struct RemoteScan {
    pub records: Vec<TrialRecord>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Search finished runs of the target study, bounded by the remote timeout.
pub(crate) async fn query(
    service: &dyn TrackingService,
    retry: &RetryConfig,
    target: &ScanTarget,
    options: &DiscoveryOptions,
) -> RemoteScan {
    let mut out = RemoteScan::default();
    let searches = search(service, retry, target, options);
    let runs = match tokio::time::timeout(options.remote_timeout, searches).await {
        Ok(Ok(runs)) => runs,
        Ok(Err(e)) => {
            unavailable(&mut out, service, e.to_string());
            return out;
        }
        Err(_) => {
            let message = format!(
                "query timed out after {}ms",
                options.remote_timeout.as_millis()
            );
            unavailable(&mut out, service, message);
            return out;
        }
    };
    if runs.len() >= options.remote_limit {
        tracing::warn!(
            backend = service.name(),
            limit = options.remote_limit,
            "Remote run query reached its limit"
        );
        out.diagnostics.push(Diagnostic::RemoteLimitReached {
            limit: options.remote_limit,
        });
    }
    for run in &runs {
        match normalize(run, target) {
            Ok(Some(record)) => {
                if options.include_folds || record.fold_index.is_none() {
                    out.records.push(record);
                }
            }
            Ok(None) => {}
            Err(reason) => {
                tracing::warn!(
                    backend = service.name(),
                    run_id = %run.run_id,
                    reason = %reason,
                    "Skipping malformed remote run"
                );
                out.diagnostics.push(
                    DiscoveryError::MalformedRecord {
                        location: format!("{}:run/{}", service.name(), run.run_id),
                        reason,
                    }
                    .into(),
                );
            }
        }
    }
    tracing::debug!(
        backend = service.name(),
        study = %target.study,
        runs = runs.len(),
        records = out.records.len(),
        "Remote query finished"
    );
    out
}

fn unavailable(out: &mut RemoteScan, service: &dyn TrackingService, message: String) {
    tracing::warn!(backend = service.name(), error = %message, "Tracking backend unavailable");
    out.diagnostics.push(
        DiscoveryError::BackendUnavailable {
            backend: service.name().to_string(),
            message,
        }
        .into(),
    );
}

/// Runs tagged with the study hash; for v1 studies, also runs tagged only with the
/// legacy study key string. De-duplicated by run id, capped at the limit.
async fn search(
    service: &dyn TrackingService,
    retry: &RetryConfig,
    target: &ScanTarget,
    options: &DiscoveryOptions,
) -> Result<Vec<RemoteRun>, TrackingError> {
    let by_hash = RunQuery::new(options.remote_limit)
        .with_tag(tags::STUDY_KEY_HASH, target.study.hash().as_str())
        .with_status(RunStatus::Finished);
    let mut runs = with_retry(retry, || service.search_runs(&by_hash)).await?;

    if let Some(legacy_key) = &target.legacy_study_key {
        if runs.len() < options.remote_limit {
            let by_key = RunQuery::new(options.remote_limit)
                .with_tag(tags::STUDY_KEY, legacy_key.as_str())
                .with_status(RunStatus::Finished);
            let legacy = with_retry(retry, || service.search_runs(&by_key)).await?;
            let mut seen: BTreeSet<String> = runs.iter().map(|r| r.run_id.clone()).collect();
            runs.extend(legacy.into_iter().filter(|r| seen.insert(r.run_id.clone())));
        }
    }
    runs.truncate(options.remote_limit);
    Ok(runs)
}

/// `Ok(None)` for runs that belong elsewhere or are not finished yet.
fn normalize(run: &RemoteRun, target: &ScanTarget) -> Result<Option<TrialRecord>, String> {
    if let Some(version) = run.tags.get(tags::SCHEMA_VERSION) {
        if version.as_str() != target.version.as_str() {
            return Ok(None);
        }
    }
    if let Some(study) = run.tags.get(tags::STUDY_KEY_HASH) {
        if KeyHash::parse(study).as_ref() != Some(target.study.hash()) {
            return Ok(None);
        }
    }
    let trial_hash = run
        .tags
        .get(tags::TRIAL_KEY_HASH)
        .ok_or_else(|| format!("missing tag {}", tags::TRIAL_KEY_HASH))?;
    let trial_hash = KeyHash::parse(trial_hash)
        .ok_or_else(|| format!("invalid trial hash '{trial_hash}'"))?;
    let fold_index = match run.tags.get(tags::FOLD_INDEX) {
        Some(raw) if raw.is_empty() || raw == "None" => None,
        Some(raw) => Some(
            raw.parse::<u32>()
                .map_err(|_| format!("invalid fold index '{raw}'"))?,
        ),
        None => None,
    };
    if run.metrics.is_empty() {
        tracing::debug!(run_id = %run.run_id, "Remote run has no metrics yet");
        return Ok(None);
    }
    let trial_number = run
        .tags
        .get(tags::TRIAL_NUMBER)
        .and_then(|n| n.parse().ok());
    Ok(Some(TrialRecord {
        trial: Identity::new(target.version, trial_hash),
        study: target.study.clone(),
        family: target.family.clone(),
        backbone: target.backbone.clone(),
        metrics: run.metrics.clone(),
        fold_index,
        trial_number,
        source: RecordSource::TrackingService,
        location: LocationHint {
            path: None,
            run_id: Some(run.run_id.clone()),
            relative_path: run.tags.get(tags::RELATIVE_PATH).map(Into::into),
            artifact_path: run.tags.get(tags::ARTIFACT_PATH).cloned(),
        },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{KeyBuilder, SchemaVersion, StudyInputs};
    use crate::naming::NamingContext;
    use crate::tracking::InMemoryTrackingService;
    use serde_json::json;
    use std::time::Duration;

    fn setup(version: SchemaVersion) -> (NamingContext, ScanTarget) {
        let inputs = StudyInputs::new(&json!({"d": 1}), &json!({"s": 1}), "bert").unwrap();
        let ctx = NamingContext::build(&KeyBuilder::default(), &inputs);
        let target = ScanTarget::new(&ctx, version);
        (ctx, target)
    }

    fn trial_hash(seed: &str) -> String {
        KeyHash::digest(seed.as_bytes()).to_string()
    }

    fn options(limit: usize) -> DiscoveryOptions {
        DiscoveryOptions {
            remote_limit: limit,
            remote_timeout: Duration::from_secs(5),
            ..Default::default()
        }
    }

    #[test]
    fn test_normalize_parses_fold_and_location() {
        let (ctx, target) = setup(SchemaVersion::V2);
        let run = RemoteRun::new("abc")
            .with_tags(ctx.tracking_tags(SchemaVersion::V2))
            .with_tag(tags::TRIAL_KEY_HASH, trial_hash("t1"))
            .with_tag(tags::FOLD_INDEX, "2")
            .with_tag(tags::RELATIVE_PATH, "study-x/trial-y")
            .with_metric("eval_f1", 0.5);
        let record = normalize(&run, &target).unwrap().unwrap();
        assert_eq!(record.fold_index, Some(2));
        assert_eq!(record.location.run_id.as_deref(), Some("abc"));
        assert_eq!(
            record.location.relative_path,
            Some(std::path::PathBuf::from("study-x/trial-y"))
        );
    }

    #[test]
    fn test_normalize_rejects_missing_trial_hash() {
        let (ctx, target) = setup(SchemaVersion::V2);
        let run = RemoteRun::new("abc")
            .with_tags(ctx.tracking_tags(SchemaVersion::V2))
            .with_metric("eval_f1", 0.5);
        assert!(normalize(&run, &target).is_err());
    }

    #[test]
    fn test_normalize_skips_other_schema() {
        let (ctx, target) = setup(SchemaVersion::V2);
        let run = RemoteRun::new("abc")
            .with_tags(ctx.tracking_tags(SchemaVersion::V2))
            .with_tag(tags::SCHEMA_VERSION, "v1")
            .with_tag(tags::TRIAL_KEY_HASH, trial_hash("t1"))
            .with_metric("eval_f1", 0.5);
        assert!(normalize(&run, &target).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_v1_searches_legacy_study_key_too() {
        let (ctx, target) = setup(SchemaVersion::V1);
        let service = InMemoryTrackingService::new();
        service.add_run(
            RemoteRun::new("tagged-by-hash")
                .with_tags(ctx.tracking_tags(SchemaVersion::V1))
                .with_tag(tags::TRIAL_KEY_HASH, trial_hash("a"))
                .with_metric("eval_f1", 0.5),
        );
        service.add_run(
            RemoteRun::new("tagged-by-key-only")
                .with_tag(tags::STUDY_KEY, ctx.study_key(SchemaVersion::V1).as_str())
                .with_tag(tags::TRIAL_KEY_HASH, trial_hash("b"))
                .with_metric("eval_f1", 0.6),
        );
        let scan = query(&service, &RetryConfig::default(), &target, &options(100)).await;
        assert_eq!(scan.records.len(), 2);
        assert_eq!(service.search_calls(), 2);
    }

    #[tokio::test]
    async fn test_limit_reached_is_diagnosed() {
        let (ctx, target) = setup(SchemaVersion::V2);
        let service = InMemoryTrackingService::new();
        for i in 0..3 {
            service.add_run(
                RemoteRun::new(format!("r{i}"))
                    .with_tags(ctx.tracking_tags(SchemaVersion::V2))
                    .with_tag(tags::TRIAL_KEY_HASH, trial_hash(&i.to_string()))
                    .with_metric("eval_f1", 0.1),
            );
        }
        let scan = query(&service, &RetryConfig::default(), &target, &options(2)).await;
        assert_eq!(scan.records.len(), 2);
        assert!(
            scan.diagnostics
                .contains(&Diagnostic::RemoteLimitReached { limit: 2 })
        );
    }

    #[tokio::test]
    async fn test_fold_runs_dropped_when_folds_excluded() {
        let (ctx, target) = setup(SchemaVersion::V2);
        let service = InMemoryTrackingService::new();
        service.add_run(
            RemoteRun::new("aggregate")
                .with_tags(ctx.tracking_tags(SchemaVersion::V2))
                .with_tag(tags::TRIAL_KEY_HASH, trial_hash("t"))
                .with_metric("eval_f1", 0.7),
        );
        for k in 0..2 {
            service.add_run(
                RemoteRun::new(format!("fold-{k}"))
                    .with_tags(ctx.tracking_tags(SchemaVersion::V2))
                    .with_tag(tags::TRIAL_KEY_HASH, trial_hash("t"))
                    .with_tag(tags::FOLD_INDEX, k.to_string())
                    .with_metric("eval_f1", 0.7),
            );
        }

        let all = query(&service, &RetryConfig::default(), &target, &options(100)).await;
        assert_eq!(all.records.len(), 3);

        let opts = DiscoveryOptions {
            include_folds: false,
            ..options(100)
        };
        let aggregates = query(&service, &RetryConfig::default(), &target, &opts).await;
        assert_eq!(aggregates.records.len(), 1);
        assert_eq!(aggregates.records[0].fold_index, None);
        assert_eq!(aggregates.records[0].location.run_id.as_deref(), Some("aggregate"));
    }
}
