//! The normalized trial record shared by every discovery backend.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use crate::keys::{Identity, SchemaVersion};

/// Which backend produced a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecordSource {
    Disk,
    TrackingService,
}

impl fmt::Display for RecordSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordSource::Disk => write!(f, "disk"),
            RecordSource::TrackingService => write!(f, "tracking-service"),
        }
    }
}

/// Where a trial's artifact may be found.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocationHint {
    /// Trial directory on the primary filesystem.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    /// Trial directory relative to the primary root; used to find the backup copy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relative_path: Option<PathBuf>,
    /// Artifact path inside the tracking run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_path: Option<String>,
}

/// One trial (or one fold of a trial) as seen by a discovery backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialRecord {
    pub trial: Identity,
    pub study: Identity,
    pub family: Identity,
    pub backbone: String,
    pub metrics: BTreeMap<String, f64>,
    /// `None` for an aggregate record or a trial without cross-validation.
    pub fold_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trial_number: Option<u32>,
    pub source: RecordSource,
    #[serde(default)]
    pub location: LocationHint,
}

impl TrialRecord {
    pub fn schema_version(&self) -> SchemaVersion {
        self.trial.version()
    }

    /// Objective value, if recorded and finite.
    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).copied().filter(|v| v.is_finite())
    }

    pub fn is_aggregate(&self) -> bool {
        self.fold_index.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyHash;

    #[test]
    fn test_source_serde_names() {
        assert_eq!(
            serde_json::to_string(&RecordSource::TrackingService).unwrap(),
            "\"tracking-service\""
        );
        assert_eq!(RecordSource::Disk.to_string(), "disk");
    }

    #[test]
    fn test_metric_ignores_non_finite() {
        let id = Identity::V2(KeyHash::digest(b"t"));
        let mut record = TrialRecord {
            trial: id.clone(),
            study: id.clone(),
            family: id,
            backbone: "bert".into(),
            metrics: BTreeMap::new(),
            fold_index: None,
            trial_number: None,
            source: RecordSource::Disk,
            location: LocationHint::default(),
        };
        record.metrics.insert("f1".into(), f64::NAN);
        record.metrics.insert("acc".into(), 0.9);
        assert_eq!(record.metric("f1"), None);
        assert_eq!(record.metric("acc"), Some(0.9));
        assert!(record.is_aggregate());
    }
}
