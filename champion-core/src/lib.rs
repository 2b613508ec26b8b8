//! # Champion Core
//!
//! Content-addressed identities for hyperparameter studies, trials and runs, and the
//! machinery that turns those identities into a validated champion artifact: discovery
//! across a local trial tree and an experiment-tracking service, cross-validation-aware
//! champion selection, multi-backend artifact resolution and a selection cache.

pub mod artifact;
pub mod cache;
pub mod config;
pub mod discovery;
pub mod error;
pub mod keys;
pub mod layout;
pub mod logging;
pub mod naming;
pub mod persistence;
pub mod pipeline;
pub mod record;
pub mod retry;
pub mod selection;
pub mod tracking;

// Re-export commonly used types at the crate root.
pub use artifact::{
    ArtifactLocation, ArtifactResolver, ArtifactValidator, FailureKind, ProbeStep, StepFailure,
    ValidationMode,
};
pub use cache::{CacheEntry, Freshness, SelectionCache};
pub use config::{ChampionConfig, RetryConfig, load_config};
pub use discovery::{
    Diagnostic, DiscoveryOptions, DiscoveryReport, SchemaPreference, TrialDiscovery,
};
pub use error::{
    CacheError, ChampionError, ConfigError, DiscoveryError, KeyError, ResolveError, Result,
    SelectionError, TrackingError,
};
pub use keys::{
    ConfigValue, Identity, KeyBuilder, KeyHash, RunContext, RunKey, SchemaVersion,
    StudyFamilyKey, StudyInputs, StudyKey, TrialKey,
};
pub use layout::{StudyLayout, TrialMetadata, TrialStatus};
pub use naming::NamingContext;
pub use pipeline::{BackboneFailure, ChampionPipeline, PipelineOutcome, ResolvedChampion};
pub use record::{LocationHint, RecordSource, TrialRecord};
pub use selection::{Aggregation, ChampionRecord, ChampionSelector, Direction, Objective};
pub use tracking::{InMemoryTrackingService, RemoteRun, RunQuery, RunStatus, TrackingService};
