//! Property tests for study and trial identities.

use std::collections::BTreeMap;

use champion_core::{KeyBuilder, SchemaVersion, StudyInputs, StudyKey};
use proptest::prelude::*;
use serde::ser::{Serialize, SerializeMap, Serializer};
use serde_json::{Value, json};

/// A map serialized in exactly the order given, as a config loader might produce it.
struct Ordered(Vec<(String, Value)>);

impl Serialize for Ordered {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (k, v) in &self.0 {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

fn ordered(entries: &[(&str, Value)]) -> Ordered {
    Ordered(entries.iter().map(|(k, v)| (k.to_string(), v.clone())).collect())
}

fn hyperparameters() -> impl Strategy<Value = BTreeMap<String, i64>> {
    prop::collection::btree_map("hp_[a-z]{1,6}", any::<i64>(), 1..8)
}

fn study(keys: &KeyBuilder) -> StudyKey {
    let data = json!({"dataset": "conll"});
    let inputs = StudyInputs::new(&data, &json!({"lr": [1e-5, 1e-4]}), "bert")
        .unwrap()
        .with_eval(&json!({"folds": 5}))
        .unwrap();
    keys.study_key(SchemaVersion::V2, &inputs)
}

proptest! {
    #[test]
    fn test_key_order_never_changes_trial_hash(
        params in hyperparameters(),
        rotate in 0usize..8,
    ) {
        let keys = KeyBuilder::default();
        let study = study(&keys);
        let mut entries: Vec<(String, Value)> =
            params.into_iter().map(|(k, v)| (k, Value::from(v))).collect();
        let forward = keys.trial_key(study.identity(), &Ordered(entries.clone())).unwrap();
        let len = entries.len();
        entries.rotate_left(rotate % len);
        entries.reverse();
        let shuffled = keys.trial_key(study.identity(), &Ordered(entries)).unwrap();
        prop_assert_eq!(forward.hash(), shuffled.hash());
        prop_assert_eq!(forward.as_str(), shuffled.as_str());
    }

    #[test]
    fn test_distinct_hyperparameters_get_distinct_trials(
        a in hyperparameters(),
        b in hyperparameters(),
    ) {
        prop_assume!(a != b);
        let keys = KeyBuilder::default();
        let study = study(&keys);
        let ka = keys.trial_key(study.identity(), &a).unwrap();
        let kb = keys.trial_key(study.identity(), &b).unwrap();
        prop_assert_ne!(ka.hash(), kb.hash());
    }

    #[test]
    fn test_study_hash_is_deterministic(dataset in "[a-z]{1,12}", max_length in 1i64..4096) {
        let keys = KeyBuilder::default();
        let inputs = StudyInputs::new(
            &json!({"dataset": dataset, "max_length": max_length}),
            &json!({"lr": [1e-5, 1e-4]}),
            "bert",
        )
        .unwrap();
        for version in [SchemaVersion::V1, SchemaVersion::V2] {
            let first = keys.study_key(version, &inputs);
            let second = keys.study_key(version, &inputs.clone());
            prop_assert_eq!(first, second);
        }
    }
}

#[test]
fn test_reordered_literal_config_matches() {
    let keys = KeyBuilder::default();
    let a = ordered(&[("lr", json!(0.1)), ("seed", json!(1))]);
    let b = ordered(&[("seed", json!(1)), ("lr", json!(0.1))]);
    let study_a = StudyInputs::new(&a, &json!({}), "bert").unwrap();
    let study_b = StudyInputs::new(&b, &json!({}), "bert").unwrap();
    assert_eq!(
        keys.study_key(SchemaVersion::V2, &study_a).hash(),
        keys.study_key(SchemaVersion::V2, &study_b).hash()
    );
    assert_eq!(keys.canonical(&a).unwrap(), keys.canonical(&b).unwrap());
}
