//! Content-derived identities.
//!
//! Raw configuration is lowered into a [`ConfigValue`] tree, normalized, encoded
//! canonically and hashed with SHA-256. Every identity carries the [`SchemaVersion`]
//! that produced it.

pub mod builder;
pub mod canonical;
pub mod identity;
pub mod value;

pub use builder::{
    KeyBuilder, RunContext, RunKey, StudyFamilyKey, StudyInputs, StudyKey, TrialKey,
};
pub use canonical::{Normalizer, canonical_string};
pub use identity::{DISPLAY_HASH_LEN, Identity, KeyHash, SchemaVersion};
pub use value::ConfigValue;
