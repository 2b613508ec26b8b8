//! Deterministic merge of disk and remote records.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

use super::Diagnostic;
use crate::keys::Identity;
use crate::record::TrialRecord;

/// Relative tolerance under which two metric values agree.
const METRIC_TOLERANCE: f64 = 1e-9;

fn agree(a: f64, b: f64) -> bool {
    a == b || (a - b).abs() <= METRIC_TOLERANCE * a.abs().max(b.abs()).max(1.0)
}

/// De-duplicate by (trial identity, fold). Disk records win; a remote duplicate whose
/// shared metrics agree contributes its run id, otherwise a mismatch is reported.
/// Remote records are taken in (trial, fold, run id) order, so the result does not depend
/// on the order the service returned them. Output is sorted by trial identity then fold,
/// aggregate first.
pub(crate) fn merge(
    disk: Vec<TrialRecord>,
    mut remote: Vec<TrialRecord>,
    diagnostics: &mut Vec<Diagnostic>,
) -> Vec<TrialRecord> {
    let mut merged: BTreeMap<(Identity, Option<u32>), TrialRecord> = BTreeMap::new();
    for record in disk {
        let key = (record.trial.clone(), record.fold_index);
        merged.entry(key).or_insert(record);
    }
    remote.sort_by(|a, b| {
        let key = |r: &TrialRecord| (r.trial.clone(), r.fold_index, r.location.run_id.clone());
        key(a).cmp(&key(b))
    });
    for record in remote {
        let key = (record.trial.clone(), record.fold_index);
        match merged.entry(key) {
            Entry::Vacant(slot) => {
                slot.insert(record);
            }
            Entry::Occupied(mut slot) => {
                let existing = slot.get_mut();
                let mismatches: Vec<_> = existing
                    .metrics
                    .iter()
                    .filter_map(|(name, &disk_value)| {
                        let remote_value = *record.metrics.get(name)?;
                        (!agree(disk_value, remote_value)).then(|| Diagnostic::MetricMismatch {
                            trial: existing.trial.clone(),
                            fold_index: existing.fold_index,
                            metric: name.clone(),
                            disk: disk_value,
                            remote: remote_value,
                        })
                    })
                    .collect();
                if mismatches.is_empty() {
                    if existing.location.run_id.is_none() {
                        existing.location.run_id = record.location.run_id;
                    }
                    if existing.location.artifact_path.is_none() {
                        existing.location.artifact_path = record.location.artifact_path;
                    }
                } else {
                    for m in &mismatches {
                        tracing::warn!(
                            diagnostic = %m,
                            "Disk and tracking service disagree; keeping disk record"
                        );
                    }
                    diagnostics.extend(mismatches);
                }
            }
        }
    }
    merged.into_values().collect()
}
