//! Blocking scan of the local study tree.

use std::path::{Path, PathBuf};

use super::{Diagnostic, ScanTarget};
use crate::error::DiscoveryError;
use crate::keys::{Identity, KeyBuilder, KeyHash, SchemaVersion};
use crate::layout::{self, FOLDS_DIR, StudyLayout, TrialMetadata, TrialStatus};
use crate::persistence::JsonRead;
use crate::record::{LocationHint, RecordSource, TrialRecord};

#[derive(Debug, Default)]
pub(crate) struct DiskScan {
    pub records: Vec<TrialRecord>,
    pub diagnostics: Vec<Diagnostic>,
}

impl DiskScan {
    fn malformed(&mut self, location: &Path, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::warn!(
            location = %location.display(),
            reason = %reason,
            "Skipping malformed trial record"
        );
        self.diagnostics.push(
            DiscoveryError::MalformedRecord {
                location: location.display().to_string(),
                reason,
            }
            .into(),
        );
    }

    fn incomplete(&mut self, location: &Path) {
        tracing::debug!(location = %location.display(), "Trial metadata not yet complete");
        self.diagnostics.push(Diagnostic::IncompleteRecord {
            location: location.display().to_string(),
        });
    }
}

pub(crate) fn scan(
    layout: &StudyLayout,
    keys: &KeyBuilder,
    target: &ScanTarget,
    include_folds: bool,
) -> DiskScan {
    let mut out = DiskScan::default();
    let study_dir = layout.study_dir(&target.study);
    if study_dir.is_dir() {
        for trial_dir in sorted_subdirs(&study_dir) {
            let Some(short) = trial_dir
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(layout::parse_trial_dir_name)
                .map(str::to_string)
            else {
                continue;
            };
            let hashed = TrialName::Hashed(short);
            scan_trial(layout, keys, target, &trial_dir, hashed, include_folds, &mut out);
        }
    } else if target.version == SchemaVersion::V1 {
        let legacy_dir = layout.legacy_study_dir(&target.study_name);
        if legacy_dir.is_dir() {
            tracing::info!(path = %legacy_dir.display(), "Scanning legacy name-based study layout");
            out.diagnostics.push(Diagnostic::LegacyLayout {
                path: legacy_dir.clone(),
            });
            for trial_dir in sorted_subdirs(&legacy_dir) {
                let Some(name) = trial_dir.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                let Some(number) = layout::parse_legacy_trial_dir_name(name) else {
                    continue;
                };
                let legacy = TrialName::Legacy {
                    name: name.to_string(),
                    number,
                };
                scan_trial(layout, keys, target, &trial_dir, legacy, include_folds, &mut out);
            }
        }
    }
    tracing::debug!(
        study = %target.study,
        records = out.records.len(),
        "Disk scan finished"
    );
    out
}

enum TrialName {
    /// `trial-<short>`: the metadata hash must match the short form.
    Hashed(String),
    /// `trial_<n>`: hashes may be missing entirely.
    Legacy { name: String, number: u32 },
}

fn sorted_subdirs(dir: &Path) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .flatten()
            .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .map(|e| e.path())
            .collect(),
        Err(e) => {
            tracing::debug!(dir = %dir.display(), error = %e, "Cannot list directory");
            Vec::new()
        }
    };
    dirs.sort();
    dirs
}

/// Read metadata, recording diagnostics for anything other than a ready document.
fn read_meta(dir: &Path, out: &mut DiskScan) -> Option<TrialMetadata> {
    let location = dir.join(layout::TRIAL_META_FILE);
    match layout::read_trial_metadata(dir) {
        JsonRead::Ready(meta) => Some(meta),
        JsonRead::Missing => {
            tracing::debug!(dir = %dir.display(), "No trial metadata yet");
            None
        }
        JsonRead::Incomplete => {
            out.incomplete(&location);
            None
        }
        JsonRead::Malformed(reason) => {
            out.malformed(&location, reason);
            None
        }
    }
}

fn scan_trial(
    layout: &StudyLayout,
    keys: &KeyBuilder,
    target: &ScanTarget,
    trial_dir: &Path,
    name: TrialName,
    include_folds: bool,
    out: &mut DiskScan,
) {
    let location = trial_dir.join(layout::TRIAL_META_FILE);
    let Some(meta) = read_meta(trial_dir, out) else {
        return;
    };
    if meta.schema_version != target.version {
        tracing::debug!(
            dir = %trial_dir.display(),
            schema = %meta.schema_version,
            "Trial belongs to another scheme"
        );
        return;
    }
    if let Some(study_hash) = &meta.study_key_hash {
        if *study_hash != *target.study.hash() {
            let reason = format!(
                "study hash {} does not match {}",
                study_hash.short(),
                target.study.short()
            );
            out.malformed(&location, reason);
            return;
        }
    }
    if meta.status != TrialStatus::Completed {
        tracing::debug!(
            dir = %trial_dir.display(),
            status = ?meta.status,
            "Skipping unfinished trial"
        );
        return;
    }
    let trial = match trial_identity(keys, target, &meta, &name) {
        Ok(trial) => trial,
        Err(reason) => {
            out.malformed(&location, reason);
            return;
        }
    };
    let trial_number = meta.trial_number.or(match &name {
        TrialName::Legacy { number, .. } => Some(*number),
        TrialName::Hashed(_) => None,
    });
    let location_hint = LocationHint {
        path: Some(trial_dir.to_path_buf()),
        run_id: meta.run_id.clone(),
        relative_path: layout.relative_to_root(trial_dir),
        artifact_path: None,
    };
    let record = |metrics, fold_index| TrialRecord {
        trial: trial.clone(),
        study: target.study.clone(),
        family: target.family.clone(),
        backbone: target.backbone.clone(),
        metrics,
        fold_index,
        trial_number,
        source: RecordSource::Disk,
        location: location_hint.clone(),
    };

    let has_aggregate = !meta.metrics.is_empty();
    if has_aggregate && (include_folds || meta.fold_index.is_none()) {
        out.records.push(record(meta.metrics.clone(), meta.fold_index));
    }

    let mut folds_found = 0;
    let folds_dir = trial_dir.join(FOLDS_DIR);
    if include_folds && folds_dir.is_dir() {
        for fold_dir in sorted_subdirs(&folds_dir) {
            let Some(fold_index) = fold_dir
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(layout::parse_fold_dir_name)
            else {
                continue;
            };
            let fold_location = fold_dir.join(layout::TRIAL_META_FILE);
            let Some(fold_meta) = read_meta(&fold_dir, out) else {
                continue;
            };
            if fold_meta.fold_index.is_some_and(|k| k != fold_index) {
                out.malformed(
                    &fold_location,
                    format!(
                        "fold index {:?} does not match directory fold-{fold_index}",
                        fold_meta.fold_index
                    ),
                );
                continue;
            }
            if fold_meta
                .trial_key_hash
                .as_ref()
                .is_some_and(|h| h != trial.hash())
            {
                out.malformed(&fold_location, "fold trial hash does not match parent trial");
                continue;
            }
            if fold_meta.status != TrialStatus::Completed {
                continue;
            }
            if fold_meta.metrics.is_empty() {
                out.incomplete(&fold_location);
                continue;
            }
            out.records.push(record(fold_meta.metrics, Some(fold_index)));
            folds_found += 1;
        }
    }

    // A trial may record metrics only per fold.
    if !has_aggregate && folds_found == 0 {
        out.incomplete(&location);
    }
}

fn trial_identity(
    keys: &KeyBuilder,
    target: &ScanTarget,
    meta: &TrialMetadata,
    name: &TrialName,
) -> Result<Identity, String> {
    let hash: KeyHash = match (&meta.trial_key_hash, name) {
        (Some(hash), _) => hash.clone(),
        (None, _) if !meta.hyperparameters.is_null() => keys
            .trial_key(&target.study, &meta.hyperparameters)
            .map_err(|e| e.to_string())?
            .hash()
            .clone(),
        (None, TrialName::Legacy { name, .. }) => {
            keys.legacy_trial_key(&target.study, name).hash().clone()
        }
        (None, TrialName::Hashed(_)) => {
            return Err("no trial hash and no hyperparameters to derive it from".into());
        }
    };
    if let TrialName::Hashed(short) = name {
        if hash.short() != short {
            return Err(format!(
                "directory trial-{short} does not match trial hash {}",
                hash.short()
            ));
        }
    }
    Ok(Identity::new(target.version, hash))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::StudyInputs;
    use crate::layout::write_trial_metadata;
    use crate::naming::NamingContext;
    use serde_json::json;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn target(version: SchemaVersion) -> ScanTarget {
        let inputs = StudyInputs::new(&json!({"d": 1}), &json!({"s": 1}), "bert").unwrap();
        let ctx = NamingContext::build(&KeyBuilder::default(), &inputs);
        ScanTarget::new(&ctx, version)
    }

    fn metrics(v: f64) -> BTreeMap<String, f64> {
        [("eval_f1".to_string(), v)].into_iter().collect()
    }

    fn trial(target: &ScanTarget, lr: f64) -> Identity {
        KeyBuilder::default()
            .trial_key(&target.study, &json!({"lr": lr}))
            .unwrap()
            .identity()
            .clone()
    }

    #[test]
    fn test_folds_are_discovered() {
        let dir = TempDir::new().unwrap();
        let layout = StudyLayout::new(dir.path());
        let t = target(SchemaVersion::V2);
        let id = trial(&t, 1e-5);
        let trial_dir = layout.trial_dir(&t.study, &id);
        let aggregate = TrialMetadata::completed(&t.study, &id, Some(0), metrics(0.85));
        write_trial_metadata(&trial_dir, &aggregate).unwrap();
        for k in 0..3 {
            let score = metrics(0.8 + k as f64 * 0.05);
            let meta = TrialMetadata::completed(&t.study, &id, Some(0), score).with_fold(k);
            write_trial_metadata(&StudyLayout::fold_dir(&trial_dir, k), &meta).unwrap();
        }

        let scan_all = scan(&layout, &KeyBuilder::default(), &t, true);
        assert_eq!(scan_all.records.len(), 4);
        assert_eq!(scan_all.records.iter().filter(|r| r.fold_index.is_some()).count(), 3);

        let aggregates = scan(&layout, &KeyBuilder::default(), &t, false);
        assert_eq!(aggregates.records.len(), 1);
        assert!(aggregates.records[0].is_aggregate());
        assert_eq!(
            aggregates.records[0].location.relative_path,
            layout.relative_to_root(&trial_dir)
        );
    }

    #[test]
    fn test_partial_metadata_is_incomplete_not_malformed() {
        let dir = TempDir::new().unwrap();
        let layout = StudyLayout::new(dir.path());
        let t = target(SchemaVersion::V2);
        let id = trial(&t, 1e-5);
        let trial_dir = layout.trial_dir(&t.study, &id);
        std::fs::create_dir_all(&trial_dir).unwrap();
        std::fs::write(
            trial_dir.join(layout::TRIAL_META_FILE),
            r#"{"schema_version": "v2", "met"#,
        )
        .unwrap();

        let result = scan(&layout, &KeyBuilder::default(), &t, true);
        assert!(result.records.is_empty());
        assert!(matches!(result.diagnostics[0], Diagnostic::IncompleteRecord { .. }));
    }

    #[test]
    fn test_malformed_and_mismatched_records_are_skipped() {
        let dir = TempDir::new().unwrap();
        let layout = StudyLayout::new(dir.path());
        let t = target(SchemaVersion::V2);
        let good = trial(&t, 1e-5);
        write_trial_metadata(
            &layout.trial_dir(&t.study, &good),
            &TrialMetadata::completed(&t.study, &good, None, metrics(0.9)),
        )
        .unwrap();

        let bad_dir = layout.study_dir(&t.study).join("trial-00000000");
        std::fs::create_dir_all(&bad_dir).unwrap();
        std::fs::write(bad_dir.join(layout::TRIAL_META_FILE), r#"{"schema_version": 2}"#).unwrap();

        let misplaced = trial(&t, 5e-5);
        let wrong_dir = layout.study_dir(&t.study).join("trial-ffffffff");
        let meta = TrialMetadata::completed(&t.study, &misplaced, None, metrics(0.99));
        write_trial_metadata(&wrong_dir, &meta).unwrap();

        let result = scan(&layout, &KeyBuilder::default(), &t, true);
        assert_eq!(result.records.len(), 1);
        assert_eq!(result.records[0].trial, good);
        let malformed = result
            .diagnostics
            .iter()
            .filter(|d| {
                matches!(
                    d,
                    Diagnostic::Recovered {
                        error: DiscoveryError::MalformedRecord { .. }
                    }
                )
            })
            .count();
        assert_eq!(malformed, 2);
    }

    #[test]
    fn test_running_trials_are_skipped() {
        let dir = TempDir::new().unwrap();
        let layout = StudyLayout::new(dir.path());
        let t = target(SchemaVersion::V2);
        let id = trial(&t, 1e-5);
        let mut meta = TrialMetadata::completed(&t.study, &id, None, metrics(0.9));
        meta.status = TrialStatus::Running;
        write_trial_metadata(&layout.trial_dir(&t.study, &id), &meta).unwrap();
        let result = scan(&layout, &KeyBuilder::default(), &t, true);
        assert!(result.records.is_empty());
        assert!(result.diagnostics.is_empty());
    }

    #[test]
    fn test_legacy_layout_for_v1() {
        let dir = TempDir::new().unwrap();
        let layout = StudyLayout::new(dir.path());
        let t = target(SchemaVersion::V1);
        let trial_dir = layout.legacy_trial_dir(&t.study_name, 4);
        let meta = TrialMetadata {
            schema_version: SchemaVersion::V1,
            study_key_hash: None,
            trial_key_hash: None,
            trial_number: None,
            fold_index: None,
            metrics: metrics(0.7),
            hyperparameters: serde_json::Value::Null,
            status: TrialStatus::Completed,
            run_id: None,
            created_at: None,
        };
        write_trial_metadata(&trial_dir, &meta).unwrap();

        let result = scan(&layout, &KeyBuilder::default(), &t, true);
        assert_eq!(result.records.len(), 1);
        let record = &result.records[0];
        assert_eq!(record.trial_number, Some(4));
        assert_eq!(
            record.trial,
            *KeyBuilder::default().legacy_trial_key(&t.study, "trial_4").identity()
        );
        assert!(matches!(result.diagnostics[0], Diagnostic::LegacyLayout { .. }));

        // v2 never consults the legacy layout.
        let v2 = scan(&layout, &KeyBuilder::default(), &target(SchemaVersion::V2), true);
        assert!(v2.records.is_empty());
    }
}
