//! Immutable naming context and the tracking tag vocabulary.
//!
//! A [`NamingContext`] is built once per (study inputs, backbone) and handed to discovery,
//! selection and the pipeline instead of raw configs. It holds both the v1 and v2 keys so
//! either scheme can be searched without recomputing anything.

use std::collections::BTreeMap;

use crate::keys::{
    Identity, KeyBuilder, RunKey, SchemaVersion, StudyFamilyKey, StudyInputs, StudyKey, TrialKey,
};

/// Tag names shared by producers and discovery.
pub mod tags {
    pub const STUDY_KEY_HASH: &str = "champion.study_key_hash";
    /// Full legacy study key payload, searched redundantly for v1 studies.
    pub const STUDY_KEY: &str = "champion.study_key";
    pub const STUDY_FAMILY_HASH: &str = "champion.study_family_hash";
    pub const TRIAL_KEY_HASH: &str = "champion.trial_key_hash";
    pub const RUN_KEY_HASH: &str = "champion.run_key_hash";
    pub const SCHEMA_VERSION: &str = "champion.schema_version";
    pub const BACKBONE: &str = "champion.backbone";
    pub const FOLD_INDEX: &str = "champion.fold_index";
    pub const TRIAL_NUMBER: &str = "champion.trial_number";
    pub const ARTIFACT_PATH: &str = "champion.artifact_path";
    /// Trial directory relative to the primary storage root.
    pub const RELATIVE_PATH: &str = "champion.relative_path";
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct VersionedKeys {
    study: StudyKey,
    family: StudyFamilyKey,
}

/// Every identity field of a study plus display metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamingContext {
    backbone: String,
    study_name: String,
    experiment_name: Option<String>,
    environment: Option<String>,
    v1: VersionedKeys,
    v2: VersionedKeys,
}

impl NamingContext {
    /// Compute both schemes' keys for `inputs`. The study name defaults to `hpo_<backbone>`.
    pub fn build(keys: &KeyBuilder, inputs: &StudyInputs) -> Self {
        let versioned = |version| VersionedKeys {
            study: keys.study_key(version, inputs),
            family: keys.study_family_key(version, inputs),
        };
        Self {
            backbone: inputs.backbone.clone(),
            study_name: format!("hpo_{}", inputs.backbone),
            experiment_name: None,
            environment: None,
            v1: versioned(SchemaVersion::V1),
            v2: versioned(SchemaVersion::V2),
        }
    }

    pub fn with_study_name(mut self, name: impl Into<String>) -> Self {
        self.study_name = name.into();
        self
    }

    pub fn with_experiment_name(mut self, name: impl Into<String>) -> Self {
        self.experiment_name = Some(name.into());
        self
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    pub fn backbone(&self) -> &str {
        &self.backbone
    }

    /// Human-chosen study name, used by the legacy name-based layout.
    pub fn study_name(&self) -> &str {
        &self.study_name
    }

    pub fn experiment_name(&self) -> Option<&str> {
        self.experiment_name.as_deref()
    }

    pub fn environment(&self) -> Option<&str> {
        self.environment.as_deref()
    }

    fn keys(&self, version: SchemaVersion) -> &VersionedKeys {
        match version {
            SchemaVersion::V1 => &self.v1,
            SchemaVersion::V2 => &self.v2,
        }
    }

    pub fn study_key(&self, version: SchemaVersion) -> &StudyKey {
        &self.keys(version).study
    }

    pub fn family_key(&self, version: SchemaVersion) -> &StudyFamilyKey {
        &self.keys(version).family
    }

    pub fn study_identity(&self, version: SchemaVersion) -> &Identity {
        self.study_key(version).identity()
    }

    pub fn family_identity(&self, version: SchemaVersion) -> &Identity {
        self.family_key(version).identity()
    }

    /// `study-<short hash>`.
    pub fn study_dir_name(&self, version: SchemaVersion) -> String {
        crate::layout::study_dir_name(self.study_identity(version))
    }

    /// Study-level tags a producer attaches to every run of this study.
    pub fn tracking_tags(&self, version: SchemaVersion) -> BTreeMap<String, String> {
        let keys = self.keys(version);
        let mut out = BTreeMap::new();
        out.insert(
            tags::STUDY_KEY_HASH.to_string(),
            keys.study.hash().to_string(),
        );
        out.insert(
            tags::STUDY_FAMILY_HASH.to_string(),
            keys.family.hash().to_string(),
        );
        out.insert(tags::SCHEMA_VERSION.to_string(), version.to_string());
        out.insert(tags::BACKBONE.to_string(), self.backbone.clone());
        if version == SchemaVersion::V1 {
            out.insert(tags::STUDY_KEY.to_string(), keys.study.as_str().to_string());
        }
        out
    }

    /// Study tags plus the per-run identity tags.
    pub fn run_tags(
        &self,
        trial: &TrialKey,
        run: &RunKey,
        trial_number: Option<u32>,
        fold_index: Option<u32>,
    ) -> BTreeMap<String, String> {
        let mut out = self.tracking_tags(trial.version());
        out.insert(tags::TRIAL_KEY_HASH.to_string(), trial.hash().to_string());
        out.insert(tags::RUN_KEY_HASH.to_string(), run.hash().to_string());
        if let Some(n) = trial_number {
            out.insert(tags::TRIAL_NUMBER.to_string(), n.to_string());
        }
        if let Some(k) = fold_index {
            out.insert(tags::FOLD_INDEX.to_string(), k.to_string());
        }
        out
    }

    /// Run name shown in the tracking UI, e.g. `bert-base_trial_7_fold2`.
    pub fn trial_run_name(&self, trial_number: u32, fold_index: Option<u32>) -> String {
        match fold_index {
            Some(k) => format!("{}_trial_{}_fold{}", self.backbone, trial_number, k),
            None => format!("{}_trial_{}", self.backbone, trial_number),
        }
    }

    /// Short label such as `bert-base [v2:1a2b3c4d]`.
    pub fn display_name(&self) -> String {
        format!("{} [{}]", self.backbone, self.v2.study.identity())
    }
}
