//! Error types for champion-core.
//!
//! Uses `thiserror` for public API error types. Each component owns an error enum;
//! `ChampionError` aggregates them for callers that drive the whole pipeline.
//!
//! Recoverable problems (one backend down, one corrupt record) never appear as `Err`
//! values from discovery; they are reported as [`crate::discovery::Diagnostic`]s that
//! wrap a [`DiscoveryError`].

use serde::{Deserialize, Serialize};

use crate::artifact::StepFailure;

/// Top-level error type for champion-core.
#[derive(Debug, thiserror::Error)]
pub enum ChampionError {
    #[error("Key error: {0}")]
    Key(#[from] KeyError),

    #[error("Selection error: {0}")]
    Selection(#[from] SelectionError),

    #[error("Resolve error: {0}")]
    Resolve(#[from] ResolveError),

    #[error("Tracking error: {0}")]
    Tracking(#[from] TrackingError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result alias for pipeline-level operations.
pub type Result<T> = std::result::Result<T, ChampionError>;

/// Errors from identity hashing. Always a caller bug.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("Non-serializable input at '{path}': {reason}")]
    NonSerializableInput { path: String, reason: String },
}

/// Recoverable discovery failures, reported through diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DiscoveryError {
    #[error("Backend '{backend}' unavailable: {message}")]
    BackendUnavailable { backend: String, message: String },

    #[error("Malformed record at {location}: {reason}")]
    MalformedRecord { location: String, reason: String },
}

/// Errors from champion selection.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SelectionError {
    #[error("No champion found for backbone '{backbone}': {reason}")]
    NoChampionFound { backbone: String, reason: String },

    #[error(
        "Records for backbone '{backbone}' span {} study families: {}",
        .families.len(),
        .families.join(", ")
    )]
    AmbiguousFamily {
        backbone: String,
        families: Vec<String>,
    },
}

/// Errors from artifact resolution.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ResolveError {
    #[error("Artifact not found for trial {trial}; tried {}", render_attempts(.attempts))]
    ArtifactNotFound {
        trial: String,
        attempts: Vec<StepFailure>,
    },

    #[error("Artifact resolution for trial {trial} was cancelled")]
    Cancelled { trial: String },
}

impl ResolveError {
    /// The per-step failures, empty for cancellation.
    pub fn attempts(&self) -> &[StepFailure] {
        match self {
            ResolveError::ArtifactNotFound { attempts, .. } => attempts,
            ResolveError::Cancelled { .. } => &[],
        }
    }
}

fn render_attempts(attempts: &[StepFailure]) -> String {
    if attempts.is_empty() {
        return "no backends".to_string();
    }
    attempts
        .iter()
        .map(|a| a.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors from a remote tracking service.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TrackingError {
    #[error("Tracking service unreachable: {message}")]
    Unreachable { message: String },

    #[error("Tracking request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Tracking service returned HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Not found on tracking service: {what}")]
    NotFound { what: String },

    #[error("Failed to decode tracking response: {message}")]
    Decode { message: String },

    #[error("Tracking transfer failed: {message}")]
    Transfer { message: String },

    #[error("Tracking operation cancelled")]
    Cancelled,
}

impl TrackingError {
    /// Whether a retry has a reasonable chance of succeeding.
    pub fn is_transient(&self) -> bool {
        match self {
            TrackingError::Unreachable { .. } | TrackingError::Timeout { .. } => true,
            TrackingError::Http { status, .. } => *status == 429 || *status >= 500,
            TrackingError::NotFound { .. }
            | TrackingError::Decode { .. }
            | TrackingError::Transfer { .. }
            | TrackingError::Cancelled => false,
        }
    }
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Logging setup failed: {message}")]
    Logging { message: String },
}

/// Errors from the selection cache.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    #[error("Failed to lock cache entry {path}: {message}")]
    Lock { path: String, message: String },

    #[error("Failed to persist cache entry {path}: {message}")]
    Persist { path: String, message: String },

    /// Internal signal; triggers recomputation and is never returned to callers.
    #[error("Cache entry {key} is stale")]
    StaleCacheEntry { key: String },
}
