//! Study, family, trial and run keys.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::canonical::{Normalizer, canonical_string};
use super::identity::{Identity, KeyHash, SchemaVersion};
use super::value::ConfigValue;
use crate::config::KeysConfig;
use crate::error::KeyError;

macro_rules! content_key {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name {
            identity: Identity,
            payload: String,
        }

        impl $name {
            fn from_payload(version: SchemaVersion, payload: String) -> Self {
                let hash = KeyHash::digest(payload.as_bytes());
                Self {
                    identity: Identity::new(version, hash),
                    payload,
                }
            }

            pub fn identity(&self) -> &Identity {
                &self.identity
            }

            pub fn hash(&self) -> &KeyHash {
                self.identity.hash()
            }

            pub fn version(&self) -> SchemaVersion {
                self.identity.version()
            }

            /// The canonical payload the hash was computed from.
            pub fn as_str(&self) -> &str {
                &self.payload
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.identity.fmt(f)
            }
        }
    };
}

content_key!(
    /// Identity of one study: data, search space, backbone and optional benchmark.
    StudyKey
);
content_key!(
    /// Identity of a study family: a study with the backbone removed.
    StudyFamilyKey
);
content_key!(
    /// Identity of one hyperparameter assignment inside a study.
    TrialKey
);
content_key!(
    /// Identity of one execution of a trial (fold, environment).
    RunKey
);

/// Already-lowered configuration content that defines a study.
#[derive(Debug, Clone, PartialEq)]
pub struct StudyInputs {
    pub data: ConfigValue,
    pub search_space: ConfigValue,
    pub backbone: String,
    pub benchmark: Option<ConfigValue>,
    /// Evaluation protocol. Only fingerprinted by the v2 scheme.
    pub eval: Option<ConfigValue>,
    /// Refit protocol. Only fingerprinted by the v2 scheme.
    pub refit: Option<ConfigValue>,
}

impl StudyInputs {
    pub fn new<D, S>(
        data: &D,
        search_space: &S,
        backbone: impl Into<String>,
    ) -> Result<Self, KeyError>
    where
        D: Serialize + ?Sized,
        S: Serialize + ?Sized,
    {
        Ok(Self {
            data: ConfigValue::from_serialize(data)?,
            search_space: ConfigValue::from_serialize(search_space)?,
            backbone: backbone.into(),
            benchmark: None,
            eval: None,
            refit: None,
        })
    }

    pub fn with_benchmark<B>(mut self, benchmark: &B) -> Result<Self, KeyError>
    where
        B: Serialize + ?Sized,
    {
        self.benchmark = Some(ConfigValue::from_serialize(benchmark)?);
        Ok(self)
    }

    pub fn with_eval<E: Serialize + ?Sized>(mut self, eval: &E) -> Result<Self, KeyError> {
        self.eval = Some(ConfigValue::from_serialize(eval)?);
        Ok(self)
    }

    pub fn with_refit<R: Serialize + ?Sized>(mut self, refit: &R) -> Result<Self, KeyError> {
        self.refit = Some(ConfigValue::from_serialize(refit)?);
        Ok(self)
    }
}

/// Execution-time metadata that distinguishes runs of the same trial.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunContext {
    pub fold_index: Option<u32>,
    pub environment: Option<String>,
}

/// Turns configuration content into deterministic identities. Pure.
#[derive(Debug, Clone, Default)]
pub struct KeyBuilder {
    normalizer: Normalizer,
}

impl KeyBuilder {
    pub fn new(normalizer: Normalizer) -> Self {
        Self { normalizer }
    }

    pub fn from_config(config: &KeysConfig) -> Self {
        Self::new(Normalizer::new(
            config.float_digits,
            config.excluded_keys.iter().cloned(),
        ))
    }

    pub fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }

    /// Lower and normalize any serializable value.
    pub fn normalize<T: Serialize + ?Sized>(&self, value: &T) -> Result<ConfigValue, KeyError> {
        Ok(self.normalizer.normalize(&ConfigValue::from_serialize(value)?))
    }

    /// Canonical encoding of a serializable value.
    pub fn canonical<T: Serialize + ?Sized>(&self, value: &T) -> Result<String, KeyError> {
        Ok(canonical_string(&self.normalize(value)?))
    }

    /// Hash of a sub-part of configuration, used as input to higher-level identities.
    pub fn fingerprint<T: Serialize + ?Sized>(&self, value: &T) -> Result<KeyHash, KeyError> {
        Ok(self.fingerprint_value(&ConfigValue::from_serialize(value)?))
    }

    fn fingerprint_value(&self, value: &ConfigValue) -> KeyHash {
        KeyHash::digest(canonical_string(&self.normalizer.normalize(value)).as_bytes())
    }

    fn optional_fingerprint(&self, value: Option<&ConfigValue>) -> ConfigValue {
        value
            .map(|v| ConfigValue::String(self.fingerprint_value(v).to_string()))
            .unwrap_or(ConfigValue::Null)
    }

    fn study_payload(
        &self,
        version: SchemaVersion,
        inputs: &StudyInputs,
        kind: &str,
    ) -> ConfigValue {
        let mut entries = vec![
            ("kind", ConfigValue::from(kind)),
            ("schema_version", ConfigValue::from(version.as_str())),
            ("search_space", self.normalizer.normalize(&inputs.search_space)),
        ];
        if kind == "study" {
            entries.push(("backbone", ConfigValue::from(inputs.backbone.as_str())));
        }
        match version {
            SchemaVersion::V1 => {
                entries.push(("data", self.normalizer.normalize(&inputs.data)));
                if let Some(benchmark) = &inputs.benchmark {
                    entries.push(("benchmark", self.normalizer.normalize(benchmark)));
                }
            }
            SchemaVersion::V2 => {
                entries.push((
                    "data_fingerprint",
                    ConfigValue::String(self.fingerprint_value(&inputs.data).to_string()),
                ));
                entries.push(("eval_fingerprint", self.optional_fingerprint(inputs.eval.as_ref())));
                entries.push((
                    "refit_fingerprint",
                    self.optional_fingerprint(inputs.refit.as_ref()),
                ));
                entries.push((
                    "benchmark",
                    inputs
                        .benchmark
                        .as_ref()
                        .map(|b| self.normalizer.normalize(b))
                        .unwrap_or(ConfigValue::Null),
                ));
            }
        }
        entries.into_iter().collect()
    }

    pub fn study_key(&self, version: SchemaVersion, inputs: &StudyInputs) -> StudyKey {
        let payload = canonical_string(&self.study_payload(version, inputs, "study"));
        StudyKey::from_payload(version, payload)
    }

    /// Study key from raw serializable configs.
    pub fn compute_study_key<D, S>(
        &self,
        version: SchemaVersion,
        data: &D,
        search_space: &S,
        backbone: &str,
        benchmark: Option<&ConfigValue>,
    ) -> Result<StudyKey, KeyError>
    where
        D: Serialize + ?Sized,
        S: Serialize + ?Sized,
    {
        let mut inputs = StudyInputs::new(data, search_space, backbone)?;
        inputs.benchmark = benchmark.cloned();
        Ok(self.study_key(version, &inputs))
    }

    pub fn study_family_key(&self, version: SchemaVersion, inputs: &StudyInputs) -> StudyFamilyKey {
        let payload = canonical_string(&self.study_payload(version, inputs, "study_family"));
        StudyFamilyKey::from_payload(version, payload)
    }

    /// Trial key under the study's scheme.
    pub fn trial_key<T: Serialize + ?Sized>(
        &self,
        study: &Identity,
        hyperparameters: &T,
    ) -> Result<TrialKey, KeyError> {
        let payload: ConfigValue = [
            ("kind", ConfigValue::from("trial")),
            ("schema_version", ConfigValue::from(study.version().as_str())),
            ("study_key_hash", ConfigValue::from(study.hash().as_str())),
            ("hyperparameters", self.normalize(hyperparameters)?),
        ]
        .into_iter()
        .collect();
        Ok(TrialKey::from_payload(
            study.version(),
            canonical_string(&payload),
        ))
    }

    /// Trial key for legacy name-based trial folders that never recorded a hash.
    pub fn legacy_trial_key(&self, study: &Identity, trial_name: &str) -> TrialKey {
        let payload: ConfigValue = [
            ("kind", ConfigValue::from("trial")),
            ("schema_version", ConfigValue::from(study.version().as_str())),
            ("study_key_hash", ConfigValue::from(study.hash().as_str())),
            ("legacy_trial_name", ConfigValue::from(trial_name)),
        ]
        .into_iter()
        .collect();
        TrialKey::from_payload(study.version(), canonical_string(&payload))
    }

    pub fn run_key(&self, trial: &Identity, run: &RunContext) -> RunKey {
        let payload: ConfigValue = [
            ("kind", ConfigValue::from("run")),
            ("schema_version", ConfigValue::from(trial.version().as_str())),
            ("trial_key_hash", ConfigValue::from(trial.hash().as_str())),
            (
                "fold_index",
                run.fold_index
                    .map(|k| ConfigValue::Int(i64::from(k)))
                    .unwrap_or(ConfigValue::Null),
            ),
            (
                "environment",
                run.environment
                    .as_deref()
                    .map(ConfigValue::from)
                    .unwrap_or(ConfigValue::Null),
            ),
        ]
        .into_iter()
        .collect();
        RunKey::from_payload(trial.version(), canonical_string(&payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn inputs(data: serde_json::Value, backbone: &str) -> StudyInputs {
        StudyInputs::new(&data, &json!({"lr": {"low": 1e-5, "high": 1e-3}}), backbone).unwrap()
    }

    #[test]
    fn test_reordered_data_config_same_study_hash() {
        let kb = KeyBuilder::default();
        let a = kb.study_key(SchemaVersion::V2, &inputs(json!({"lr": 0.1, "seed": 1}), "bert"));
        let b = kb.study_key(SchemaVersion::V2, &inputs(json!({"seed": 1, "lr": 0.1}), "bert"));
        assert_eq!(a.hash(), b.hash());
        assert_eq!(a.as_str(), b.as_str());
    }

    #[test]
    fn test_backbone_changes_study_but_not_family() {
        let kb = KeyBuilder::default();
        let bert = inputs(json!({"seed": 1}), "bert");
        let roberta = inputs(json!({"seed": 1}), "roberta");
        assert_ne!(
            kb.study_key(SchemaVersion::V2, &bert).hash(),
            kb.study_key(SchemaVersion::V2, &roberta).hash()
        );
        assert_eq!(
            kb.study_family_key(SchemaVersion::V2, &bert).hash(),
            kb.study_family_key(SchemaVersion::V2, &roberta).hash()
        );
    }

    #[test]
    fn test_versions_produce_different_identities() {
        let kb = KeyBuilder::default();
        let i = inputs(json!({"seed": 1}), "bert");
        let v1 = kb.study_key(SchemaVersion::V1, &i);
        let v2 = kb.study_key(SchemaVersion::V2, &i);
        assert_ne!(v1.identity(), v2.identity());
        assert_ne!(v1.hash(), v2.hash());
    }

    #[test]
    fn test_v1_ignores_eval_protocol_but_v2_does_not() {
        let kb = KeyBuilder::default();
        let base = inputs(json!({"seed": 1}), "bert");
        let with_eval = base.clone().with_eval(&json!({"metric": "f1"})).unwrap();
        assert_eq!(
            kb.study_key(SchemaVersion::V1, &base).hash(),
            kb.study_key(SchemaVersion::V1, &with_eval).hash()
        );
        assert_ne!(
            kb.study_key(SchemaVersion::V2, &base).hash(),
            kb.study_key(SchemaVersion::V2, &with_eval).hash()
        );
    }

    #[test]
    fn test_trial_key_inherits_study_version() {
        let kb = KeyBuilder::default();
        let study = kb.study_key(SchemaVersion::V1, &inputs(json!({}), "bert"));
        let trial = kb
            .trial_key(study.identity(), &json!({"lr": 3e-5, "batch_size": 16}))
            .unwrap();
        assert_eq!(trial.version(), SchemaVersion::V1);
    }

    #[test]
    fn test_trial_key_ignores_output_dir() {
        let kb = KeyBuilder::default();
        let study = kb.study_key(SchemaVersion::V2, &inputs(json!({}), "bert"));
        let a = kb
            .trial_key(study.identity(), &json!({"lr": 3e-5, "output_dir": "/a"}))
            .unwrap();
        let b = kb
            .trial_key(study.identity(), &json!({"lr": 3e-5, "output_dir": "/b"}))
            .unwrap();
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn test_trial_key_rejects_non_finite() {
        let kb = KeyBuilder::default();
        let study = kb.study_key(SchemaVersion::V2, &inputs(json!({}), "bert"));
        let mut hp = std::collections::BTreeMap::new();
        hp.insert("lr", f64::INFINITY);
        assert!(matches!(
            kb.trial_key(study.identity(), &hp),
            Err(KeyError::NonSerializableInput { .. })
        ));
    }

    #[test]
    fn test_run_key_distinguishes_folds() {
        let kb = KeyBuilder::default();
        let study = kb.study_key(SchemaVersion::V2, &inputs(json!({}), "bert"));
        let trial = kb.trial_key(study.identity(), &json!({"lr": 1e-4})).unwrap();
        let fold0 = kb.run_key(
            trial.identity(),
            &RunContext {
                fold_index: Some(0),
                environment: None,
            },
        );
        let fold1 = kb.run_key(
            trial.identity(),
            &RunContext {
                fold_index: Some(1),
                environment: None,
            },
        );
        assert_ne!(fold0.hash(), fold1.hash());
    }

    #[test]
    fn test_compute_study_key_matches_inputs_path() {
        let kb = KeyBuilder::default();
        let data = json!({"dataset": "conll"});
        let space = json!({"lr": [1e-5, 1e-3]});
        let direct = kb
            .compute_study_key(SchemaVersion::V2, &data, &space, "bert", None)
            .unwrap();
        let via_inputs = kb.study_key(
            SchemaVersion::V2,
            &StudyInputs::new(&data, &space, "bert").unwrap(),
        );
        assert_eq!(direct, via_inputs);
    }

    #[test]
    fn test_custom_precision_merges_close_values() {
        let kb = KeyBuilder::new(Normalizer::new(3, Vec::new()));
        assert_eq!(
            kb.fingerprint(&json!({"lr": 0.1234})).unwrap(),
            kb.fingerprint(&json!({"lr": 0.1231})).unwrap()
        );
    }
}
