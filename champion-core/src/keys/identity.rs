//! Hash values, schema versions and the versioned identity union.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Length of the short display form of a hash.
pub const DISPLAY_HASH_LEN: usize = 8;

/// Length of the full storage form of a hash (hex SHA-256).
pub const STORAGE_HASH_LEN: usize = 64;

/// A lowercase hex SHA-256 digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct KeyHash(String);

impl KeyHash {
    /// Hash arbitrary bytes.
    pub fn digest(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self(format!("{:x}", hasher.finalize()))
    }

    /// Parse a full-length hex digest, accepting upper-case input.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.len() == STORAGE_HASH_LEN && s.chars().all(|c| c.is_ascii_hexdigit()) {
            Some(Self(s.to_ascii_lowercase()))
        } else {
            None
        }
    }

    /// Full storage form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short display form, also used for directory names.
    pub fn short(&self) -> &str {
        &self.0[..DISPLAY_HASH_LEN]
    }
}

impl fmt::Display for KeyHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for KeyHash {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        KeyHash::parse(&value).ok_or_else(|| format!("invalid key hash '{value}'"))
    }
}

impl From<KeyHash> for String {
    fn from(value: KeyHash) -> Self {
        value.0
    }
}

/// Identity scheme version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaVersion {
    /// Legacy scheme: study identity without data/eval/refit fingerprints.
    V1,
    /// Current scheme.
    V2,
}

impl SchemaVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchemaVersion::V1 => "v1",
            SchemaVersion::V2 => "v2",
        }
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SchemaVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "v1" | "1" => Ok(SchemaVersion::V1),
            "v2" | "2" => Ok(SchemaVersion::V2),
            other => Err(format!("unknown schema version '{other}'")),
        }
    }
}

/// A hash tagged with the scheme that produced it.
///
/// Identities from different schemes never compare equal, even when the digests match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "schema_version", content = "hash", rename_all = "lowercase")]
pub enum Identity {
    V1(KeyHash),
    V2(KeyHash),
}

impl Identity {
    pub fn new(version: SchemaVersion, hash: KeyHash) -> Self {
        match version {
            SchemaVersion::V1 => Identity::V1(hash),
            SchemaVersion::V2 => Identity::V2(hash),
        }
    }

    pub fn version(&self) -> SchemaVersion {
        match self {
            Identity::V1(_) => SchemaVersion::V1,
            Identity::V2(_) => SchemaVersion::V2,
        }
    }

    pub fn hash(&self) -> &KeyHash {
        match self {
            Identity::V1(h) | Identity::V2(h) => h,
        }
    }

    pub fn short(&self) -> &str {
        self.hash().short()
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.version(), self.short())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_is_hex_sha256() {
        let h = KeyHash::digest(b"abc");
        assert_eq!(
            h.as_str(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(h.short(), "ba7816bf");
    }

    #[test]
    fn test_parse_rejects_short_or_non_hex() {
        assert!(KeyHash::parse("abc").is_none());
        assert!(KeyHash::parse(&"z".repeat(64)).is_none());
        let upper = KeyHash::digest(b"x").as_str().to_ascii_uppercase();
        assert_eq!(KeyHash::parse(&upper), Some(KeyHash::digest(b"x")));
    }

    #[test]
    fn test_cross_version_identities_never_equal() {
        let h = KeyHash::digest(b"same");
        assert_ne!(Identity::V1(h.clone()), Identity::V2(h));
    }

    #[test]
    fn test_identity_serde_shape() {
        let id = Identity::V2(KeyHash::digest(b"t"));
        let json = serde_json::to_value(&id).unwrap();
        assert_eq!(json["schema_version"], "v2");
        assert_eq!(json["hash"], id.hash().as_str());
        let back: Identity = serde_json::from_value(json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_schema_version_parse() {
        assert_eq!("V2".parse::<SchemaVersion>().unwrap(), SchemaVersion::V2);
        assert_eq!("1".parse::<SchemaVersion>().unwrap(), SchemaVersion::V1);
        assert!("v3".parse::<SchemaVersion>().is_err());
    }

    #[test]
    fn test_identity_display_uses_short_hash() {
        let id = Identity::V1(KeyHash::digest(b"abc"));
        assert_eq!(id.to_string(), "v1:ba7816bf");
    }
}
