//! Discovery, selection and resolution as one cached unit.
//!
//! [`ChampionPipeline::resolve_champions`] takes one [`NamingContext`] per backbone and
//! returns, per backbone, either a resolved champion or the reason there is none. Fully
//! successful outcomes are memoized in a [`SelectionCache`]; partial outcomes are returned
//! but never stored.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::artifact::{ArtifactLocation, ArtifactResolver, StepFailure, ValidationMode};
use crate::cache::{Freshness, SelectionCache};
use crate::config::ChampionConfig;
use crate::discovery::{Diagnostic, DiscoveryOptions, SchemaPreference, TrialDiscovery};
use crate::error::{CacheError, ChampionError, ConfigError, ResolveError, SelectionError};
use crate::keys::KeyBuilder;
use crate::layout::StudyLayout;
use crate::naming::NamingContext;
use crate::record::TrialRecord;
use crate::selection::{ChampionRecord, ChampionSelector, Objective};
use crate::tracking::TrackingService;

/// A champion together with its validated artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedChampion {
    pub champion: ChampionRecord,
    pub artifact: ArtifactLocation,
}

/// Why a backbone has no resolved champion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum BackboneFailure {
    Selection { message: String },
    Resolution {
        message: String,
        attempts: Vec<StepFailure>,
    },
}

impl fmt::Display for BackboneFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackboneFailure::Selection { message }
            | BackboneFailure::Resolution { message, .. } => {
                f.write_str(message)
            }
        }
    }
}

impl From<&SelectionError> for BackboneFailure {
    fn from(e: &SelectionError) -> Self {
        BackboneFailure::Selection {
            message: e.to_string(),
        }
    }
}

impl From<&ResolveError> for BackboneFailure {
    fn from(e: &ResolveError) -> Self {
        BackboneFailure::Resolution {
            message: e.to_string(),
            attempts: e.attempts().to_vec(),
        }
    }
}

/// Per-backbone results of one pipeline call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineOutcome {
    pub champions: BTreeMap<String, ResolvedChampion>,
    pub failures: BTreeMap<String, BackboneFailure>,
    pub diagnostics: BTreeMap<String, Vec<Diagnostic>>,
}

impl PipelineOutcome {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// The outcome for one backbone, `None` if it was not requested.
    pub fn result(&self, backbone: &str) -> Option<Result<&ResolvedChampion, &BackboneFailure>> {
        if let Some(champion) = self.champions.get(backbone) {
            return Some(Ok(champion));
        }
        self.failures.get(backbone).map(Err)
    }

    fn artifacts_present(&self) -> bool {
        self.champions.values().all(|c| c.artifact.path.is_dir())
    }
}

enum ComputeError {
    Cache(CacheError),
    Partial(PipelineOutcome),
    Cancelled(ResolveError),
}

impl From<CacheError> for ComputeError {
    fn from(e: CacheError) -> Self {
        ComputeError::Cache(e)
    }
}

#[derive(Serialize)]
struct CacheKeyInputs<'a> {
    kind: &'static str,
    studies: Vec<StudyKeyInputs>,
    objective: &'a Objective,
    schema: SchemaPreference,
    root: String,
    validation: ValidationMode,
}

#[derive(Serialize)]
struct StudyKeyInputs {
    backbone: String,
    family_hashes: Vec<String>,
    study_hashes: Vec<String>,
}

/// Discovery, selection and resolution wired to one cache.
#[derive(Debug, Clone)]
pub struct ChampionPipeline {
    keys: KeyBuilder,
    discovery: TrialDiscovery,
    objective: Objective,
    options: DiscoveryOptions,
    resolver: ArtifactResolver,
    cache: Arc<SelectionCache<PipelineOutcome>>,
}

impl ChampionPipeline {
    pub fn new(
        keys: KeyBuilder,
        discovery: TrialDiscovery,
        resolver: ArtifactResolver,
        objective: Objective,
        options: DiscoveryOptions,
    ) -> Self {
        Self {
            keys,
            discovery,
            objective,
            options,
            resolver,
            cache: Arc::new(SelectionCache::new()),
        }
    }

    /// Validate `config` and wire every component from it. The tracking service, when
    /// given, is shared by discovery and the resolver.
    pub fn from_config(
        config: &ChampionConfig,
        tracking: Option<Arc<dyn TrackingService>>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let keys = KeyBuilder::from_config(&config.keys);
        let layout = StudyLayout::new(&config.storage.root);
        let mut discovery = TrialDiscovery::new(layout, keys.clone());
        let mut resolver = ArtifactResolver::from_config(config);
        if let Some(service) = tracking {
            discovery = discovery.with_tracking(service.clone(), config.tracking.retry.clone());
            resolver = resolver.with_tracking(service, config.tracking.retry.clone());
        }
        Ok(Self {
            keys,
            discovery,
            objective: Objective::from(&config.selection),
            options: DiscoveryOptions::from(&config.discovery),
            resolver,
            cache: Arc::new(SelectionCache::from_config(&config.cache)),
        })
    }

    /// Share a cache between pipelines.
    pub fn with_cache(mut self, cache: Arc<SelectionCache<PipelineOutcome>>) -> Self {
        self.cache = cache;
        self
    }

    pub fn objective(&self) -> &Objective {
        &self.objective
    }

    pub fn cache(&self) -> &Arc<SelectionCache<PipelineOutcome>> {
        &self.cache
    }

    /// Content hash of everything that determines the outcome for `contexts`.
    pub fn cache_key(&self, contexts: &[NamingContext]) -> Result<String, ChampionError> {
        let versions = self.options.schema.versions();
        let mut studies: Vec<StudyKeyInputs> = contexts
            .iter()
            .map(|ctx| StudyKeyInputs {
                backbone: ctx.backbone().to_string(),
                family_hashes: versions
                    .iter()
                    .map(|&v| ctx.family_identity(v).hash().to_string())
                    .collect(),
                study_hashes: versions
                    .iter()
                    .map(|&v| ctx.study_identity(v).hash().to_string())
                    .collect(),
            })
            .collect();
        studies.sort_by(|a, b| a.backbone.cmp(&b.backbone));
        let inputs = CacheKeyInputs {
            kind: "champion_selection",
            studies,
            objective: &self.objective,
            schema: self.options.schema,
            root: self.discovery.layout().root().display().to_string(),
            validation: self.resolver.validator().mode(),
        };
        Ok(format!("selection-{}", self.keys.fingerprint(&inputs)?))
    }

    /// Champion and artifact per backbone, memoized under [`Self::cache_key`].
    ///
    /// A cached outcome whose artifact directories have disappeared is discarded and
    /// recomputed. Cancellation aborts the whole call.
    pub async fn resolve_champions(
        &self,
        contexts: &[NamingContext],
        freshness: Freshness,
        cancel: &CancellationToken,
    ) -> Result<PipelineOutcome, ChampionError> {
        let key = self.cache_key(contexts)?;
        let outcome = self.cached(&key, contexts, freshness, cancel).await?;
        if outcome.artifacts_present() {
            return Ok(outcome);
        }
        tracing::warn!(key = %key, "Cached champion artifacts are gone; recomputing");
        self.cache.invalidate(&key).await?;
        self.cached(&key, contexts, freshness, cancel).await
    }

    async fn cached(
        &self,
        key: &str,
        contexts: &[NamingContext],
        freshness: Freshness,
        cancel: &CancellationToken,
    ) -> Result<PipelineOutcome, ChampionError> {
        let result = self
            .cache
            .get_or_compute(key, freshness, || async {
                let outcome = self.run(contexts, cancel).await.map_err(ComputeError::Cancelled)?;
                if outcome.is_complete() {
                    Ok(outcome)
                } else {
                    Err(ComputeError::Partial(outcome))
                }
            })
            .await;
        match result {
            Ok(outcome) => Ok(outcome),
            Err(ComputeError::Partial(outcome)) => {
                tracing::info!(
                    key,
                    failures = outcome.failures.len(),
                    "Partial champion outcome not cached"
                );
                Ok(outcome)
            }
            Err(ComputeError::Cancelled(e)) => Err(e.into()),
            Err(ComputeError::Cache(e)) => Err(e.into()),
        }
    }

    /// Uncached run over every context, in backbone order.
    pub async fn run(
        &self,
        contexts: &[NamingContext],
        cancel: &CancellationToken,
    ) -> Result<PipelineOutcome, ResolveError> {
        let mut ordered: BTreeMap<&str, &NamingContext> = BTreeMap::new();
        for ctx in contexts {
            if ordered.insert(ctx.backbone(), ctx).is_some() {
                tracing::warn!(
                    backbone = ctx.backbone(),
                    "Duplicate backbone context; keeping the last"
                );
            }
        }

        let resolver = self.resolver.clone();
        let selector = ChampionSelector::new(self.objective.clone()).with_availability_filter(
            Arc::new(move |record: &TrialRecord| resolver.may_resolve(record)),
        );

        let mut outcome = PipelineOutcome::default();
        for (backbone, ctx) in ordered {
            if cancel.is_cancelled() {
                return Err(ResolveError::Cancelled {
                    trial: backbone.to_string(),
                });
            }
            let report = self.discovery.find_trials_for_study(ctx, &self.options).await;
            outcome
                .diagnostics
                .insert(backbone.to_string(), report.diagnostics);

            let selection = {
                let selector = selector.clone();
                let backbone = backbone.to_string();
                let records = report.records;
                tokio::task::spawn_blocking(move || selector.select_champion(&backbone, &records))
                    .await
                    .unwrap_or_else(|e| {
                        Err(SelectionError::NoChampionFound {
                            backbone: ctx.backbone().to_string(),
                            reason: format!("selection task failed: {e}"),
                        })
                    })
            };
            let champion = match selection {
                Ok(champion) => champion,
                Err(e) => {
                    tracing::warn!(backbone, error = %e, "No champion selected");
                    outcome.failures.insert(backbone.to_string(), (&e).into());
                    continue;
                }
            };

            match self.resolver.resolve_artifact(&champion.winner, cancel).await {
                Ok(artifact) => {
                    outcome
                        .champions
                        .insert(backbone.to_string(), ResolvedChampion { champion, artifact });
                }
                Err(e @ ResolveError::Cancelled { .. }) => return Err(e),
                Err(e) => {
                    tracing::warn!(backbone, error = %e, "Champion artifact unavailable");
                    outcome.failures.insert(backbone.to_string(), (&e).into());
                }
            }
        }
        tracing::info!(
            champions = outcome.champions.len(),
            failures = outcome.failures.len(),
            "Champion pipeline finished"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::keys::{SchemaVersion, StudyInputs};
    use crate::layout::{TrialMetadata, write_trial_metadata};
    use crate::selection::Direction;
    use serde_json::json;
    use tempfile::TempDir;

    fn context(keys: &KeyBuilder, backbone: &str) -> NamingContext {
        let data = json!({"dataset": "conll"});
        let inputs = StudyInputs::new(&data, &json!({"lr": [1e-5, 1e-4]}), backbone).unwrap();
        NamingContext::build(keys, &inputs)
    }

    fn write_trial(
        root: &std::path::Path,
        ctx: &NamingContext,
        keys: &KeyBuilder,
        lr: f64,
        f1: f64,
    ) {
        let study = ctx.study_identity(SchemaVersion::V2);
        let trial = keys.trial_key(study, &json!({"lr": lr})).unwrap();
        let dir = StudyLayout::new(root).trial_dir(study, trial.identity());
        let meta = TrialMetadata::completed(
            study,
            trial.identity(),
            Some(0),
            [("eval_f1".to_string(), f1)].into_iter().collect(),
        )
        .with_hyperparameters(json!({"lr": lr}));
        write_trial_metadata(&dir, &meta).unwrap();
        let ckpt = dir.join("checkpoint");
        std::fs::create_dir_all(&ckpt).unwrap();
        std::fs::write(ckpt.join("model.safetensors"), b"w").unwrap();
        std::fs::write(ckpt.join("config.json"), b"{}").unwrap();
    }

    fn pipeline(tmp: &TempDir) -> ChampionPipeline {
        let config = ChampionConfig {
            storage: StorageConfig {
                root: tmp.path().join("runs"),
                ..Default::default()
            },
            ..Default::default()
        };
        ChampionPipeline::from_config(&config, None).unwrap()
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let mut config = ChampionConfig {
            storage: StorageConfig {
                root: tmp.path().join("runs"),
                ..Default::default()
            },
            ..Default::default()
        };
        config.discovery.remote_limit = 0;
        let err = ChampionPipeline::from_config(&config, None).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
        assert!(err.to_string().contains("remote_limit"));
    }

    #[tokio::test]
    async fn test_resolves_best_trial_per_backbone() {
        let tmp = TempDir::new().unwrap();
        let p = pipeline(&tmp);
        let keys = KeyBuilder::default();
        let bert = context(&keys, "bert");
        write_trial(&tmp.path().join("runs"), &bert, &keys, 1e-5, 0.8);
        write_trial(&tmp.path().join("runs"), &bert, &keys, 1e-4, 0.9);
        let roberta = context(&keys, "roberta");

        let outcome = p
            .resolve_champions(&[bert, roberta], Freshness::ContentKeyed, &CancellationToken::new())
            .await
            .unwrap();
        let champion = &outcome.champions["bert"];
        assert_eq!(champion.champion.metric, 0.9);
        assert!(champion.artifact.path.ends_with("checkpoint"));
        assert!(matches!(
            outcome.failures["roberta"],
            BackboneFailure::Selection { .. }
        ));
        assert!(!outcome.is_complete());
    }

    #[tokio::test]
    async fn test_complete_outcomes_are_cached() {
        let tmp = TempDir::new().unwrap();
        let p = pipeline(&tmp);
        let keys = KeyBuilder::default();
        let bert = context(&keys, "bert");
        write_trial(&tmp.path().join("runs"), &bert, &keys, 1e-5, 0.8);
        let contexts = [bert.clone()];
        let cancel = CancellationToken::new();

        let first = p
            .resolve_champions(&contexts, Freshness::ContentKeyed, &cancel)
            .await
            .unwrap();
        // A better trial appearing later is invisible until the key is invalidated.
        write_trial(&tmp.path().join("runs"), &bert, &keys, 1e-4, 0.95);
        let second = p
            .resolve_champions(&contexts, Freshness::ContentKeyed, &cancel)
            .await
            .unwrap();
        assert_eq!(first, second);

        p.cache().invalidate(&p.cache_key(&contexts).unwrap()).await.unwrap();
        let third = p
            .resolve_champions(&contexts, Freshness::ContentKeyed, &cancel)
            .await
            .unwrap();
        assert_eq!(third.champions["bert"].champion.metric, 0.95);
    }

    #[test]
    fn test_cache_key_ignores_context_order_and_tracks_objective() {
        let tmp = TempDir::new().unwrap();
        let p = pipeline(&tmp);
        let keys = KeyBuilder::default();
        let a = context(&keys, "bert");
        let b = context(&keys, "roberta");
        let k1 = p.cache_key(&[a.clone(), b.clone()]).unwrap();
        let k2 = p.cache_key(&[b, a.clone()]).unwrap();
        assert_eq!(k1, k2);

        let mut other = p.clone();
        other.objective = Objective::new("eval_loss", Direction::Minimize);
        assert_ne!(other.cache_key(&[a.clone()]).unwrap(), p.cache_key(&[a]).unwrap());
    }

    #[tokio::test]
    async fn test_cancelled_call_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let p = pipeline(&tmp);
        let keys = KeyBuilder::default();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = p
            .resolve_champions(&[context(&keys, "bert")], Freshness::ContentKeyed, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ChampionError::Resolve(ResolveError::Cancelled { .. })));
    }
}
