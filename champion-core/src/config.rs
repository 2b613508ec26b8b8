//! Configuration system for champion resolution.
//!
//! Uses `figment` for layered configuration: defaults -> user config -> workspace config ->
//! environment -> explicit overrides. Configuration is loaded from
//! `~/.config/champion/config.toml` and/or `.champion/config.toml` in the workspace directory.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::artifact::ValidationMode;
use crate::discovery::SchemaPreference;
use crate::error::ConfigError;
use crate::keys::canonical::{DEFAULT_EXCLUDED_KEYS, DEFAULT_FLOAT_DIGITS};
use crate::selection::{Aggregation, Direction};

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChampionConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub tracking: TrackingConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub selection: SelectionConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub keys: KeysConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ChampionConfig {
    /// Validate every section, returning the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.storage.validate()?;
        self.tracking.validate()?;
        self.discovery.validate()?;
        self.selection.validate()?;
        self.validation.validate()?;
        self.keys.validate()?;
        Ok(())
    }
}

/// Where trial directories, backups and scratch extractions live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Primary root holding `study-<hash>/trial-<hash>/` trees.
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
    /// Offline backup root mirroring the primary layout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_root: Option<PathBuf>,
    /// Scratch directory for extracted archives and downloads. Defaults to `<root>/.scratch`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scratch_dir: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
            backup_root: None,
            scratch_dir: None,
        }
    }
}

impl StorageConfig {
    pub fn scratch_dir(&self) -> PathBuf {
        self.scratch_dir
            .clone()
            .unwrap_or_else(|| self.root.join(".scratch"))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.root.as_os_str().is_empty() {
            return Err(ConfigError::Invalid {
                message: "storage.root must not be empty".into(),
            });
        }
        if self.backup_root.as_deref() == Some(self.root.as_path()) {
            return Err(ConfigError::Invalid {
                message: "storage.backup_root must differ from storage.root".into(),
            });
        }
        Ok(())
    }
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("runs")
}

/// Retry policy for remote tracking calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt.
    pub max_retries: u32,
    /// Initial backoff in milliseconds.
    pub initial_backoff_ms: u64,
    /// Upper bound for a single backoff in milliseconds.
    pub max_backoff_ms: u64,
    /// Multiplier applied per attempt.
    pub backoff_multiplier: f64,
    /// Add up to 25% random jitter.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 10_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Remote experiment-tracking service settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingConfig {
    /// Base URL of the MLflow-compatible server. No remote backend when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Experiments searched for runs.
    #[serde(default)]
    pub experiment_ids: Vec<String>,
    /// Per-request timeout in seconds.
    #[serde(default = "default_tracking_timeout")]
    pub timeout_secs: u64,
    /// Budget in seconds for one checkpoint download, retries included.
    #[serde(default = "default_download_timeout")]
    pub download_timeout_secs: u64,
    /// Runs requested per search page.
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    /// Artifact path used when a run does not tag one.
    #[serde(default = "default_artifact_path")]
    pub artifact_path: String,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            experiment_ids: Vec::new(),
            timeout_secs: default_tracking_timeout(),
            download_timeout_secs: default_download_timeout(),
            page_size: default_page_size(),
            artifact_path: default_artifact_path(),
            retry: RetryConfig::default(),
        }
    }
}

impl TrackingConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_secs == 0 || self.download_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                message: "tracking timeouts must be positive".into(),
            });
        }
        if self.page_size == 0 || self.page_size > 50_000 {
            return Err(ConfigError::Invalid {
                message: format!("tracking.page_size {} is outside 1..=50000", self.page_size),
            });
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(ConfigError::Invalid {
                message: "tracking.retry.backoff_multiplier must be at least 1.0".into(),
            });
        }
        if self.base_url.is_some() && self.experiment_ids.is_empty() {
            return Err(ConfigError::Invalid {
                message: "tracking.experiment_ids must be set when tracking.base_url is".into(),
            });
        }
        Ok(())
    }
}

fn default_tracking_timeout() -> u64 {
    30
}

fn default_download_timeout() -> u64 {
    600
}

fn default_page_size() -> u32 {
    500
}

fn default_artifact_path() -> String {
    "checkpoint".to_string()
}

/// Trial discovery options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default)]
    pub schema: SchemaPreference,
    /// Upper bound on records pulled from the tracking service per query.
    #[serde(default = "default_remote_limit")]
    pub remote_limit: usize,
    /// Whether per-fold records are discovered, or aggregates only.
    #[serde(default = "default_true")]
    pub include_folds: bool,
    /// Budget for the whole remote query, retries included.
    #[serde(default = "default_remote_timeout")]
    pub remote_timeout_secs: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            schema: SchemaPreference::default(),
            remote_limit: default_remote_limit(),
            include_folds: true,
            remote_timeout_secs: default_remote_timeout(),
        }
    }
}

impl DiscoveryConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.remote_limit == 0 {
            return Err(ConfigError::Invalid {
                message: "discovery.remote_limit must be positive".into(),
            });
        }
        if self.remote_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                message: "discovery.remote_timeout_secs must be positive".into(),
            });
        }
        Ok(())
    }
}

fn default_remote_limit() -> usize {
    1000
}

fn default_remote_timeout() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

/// Objective used to rank trials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionConfig {
    #[serde(default = "default_metric")]
    pub metric: String,
    #[serde(default)]
    pub direction: Direction,
    #[serde(default)]
    pub aggregation: Aggregation,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            metric: default_metric(),
            direction: Direction::default(),
            aggregation: Aggregation::default(),
        }
    }
}

impl SelectionConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.metric.trim().is_empty() {
            return Err(ConfigError::Invalid {
                message: "selection.metric must not be empty".into(),
            });
        }
        Ok(())
    }
}

fn default_metric() -> String {
    "eval_f1".to_string()
}

/// Artifact validation rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationConfig {
    #[serde(default)]
    pub mode: ValidationMode,
    /// Accepted weight file names. Entries of the form `*.ext` match by extension.
    #[serde(default = "default_weight_files")]
    pub weight_files: Vec<String>,
    #[serde(default = "default_config_files")]
    pub config_files: Vec<String>,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            mode: ValidationMode::default(),
            weight_files: default_weight_files(),
            config_files: default_config_files(),
        }
    }
}

impl ValidationConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.weight_files.is_empty() || self.config_files.is_empty() {
            return Err(ConfigError::Invalid {
                message: "validation.weight_files and validation.config_files must be non-empty"
                    .into(),
            });
        }
        Ok(())
    }
}

fn default_weight_files() -> Vec<String> {
    [
        "model.safetensors",
        "model.safetensors.index.json",
        "pytorch_model.bin",
        "pytorch_model.bin.index.json",
        "model.bin",
        "model.pt",
        "tf_model.h5",
        "flax_model.msgpack",
        "*.safetensors",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_config_files() -> Vec<String> {
    vec!["config.json".to_string()]
}

/// Selection cache settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Directory of the cross-process disk tier. In-process only when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: None,
        }
    }
}

/// Key normalization settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeysConfig {
    /// Significant digits kept when normalizing floats.
    #[serde(default = "default_float_digits")]
    pub float_digits: u32,
    /// Keys dropped at every depth before hashing.
    #[serde(default = "default_excluded_keys")]
    pub excluded_keys: Vec<String>,
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            float_digits: default_float_digits(),
            excluded_keys: default_excluded_keys(),
        }
    }
}

impl KeysConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=17).contains(&self.float_digits) {
            return Err(ConfigError::Invalid {
                message: format!("keys.float_digits {} is outside 1..=17", self.float_digits),
            });
        }
        Ok(())
    }
}

fn default_float_digits() -> u32 {
    DEFAULT_FLOAT_DIGITS
}

fn default_excluded_keys() -> Vec<String> {
    DEFAULT_EXCLUDED_KEYS.iter().map(|s| s.to_string()).collect()
}

/// Logging output settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `CHAMPION_LOG`.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Directory for daily-rolling JSON logs. Disabled when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_dir: Option<PathBuf>,
    #[serde(default = "default_log_prefix")]
    pub file_prefix: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_dir: None,
            file_prefix: default_log_prefix(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_prefix() -> String {
    "champion.log".to_string()
}

/// Load configuration from all sources, merging in priority order.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides
/// 2. Environment variables (`CHAMPION_` prefix, `__` for nesting)
/// 3. Workspace-local config (`.champion/config.toml`)
/// 4. User config (`~/.config/champion/config.toml`)
/// 5. Built-in defaults
///
/// The merged result is not validated here; call [`ChampionConfig::validate`] or build
/// through [`crate::ChampionPipeline::from_config`], which does.
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&ChampionConfig>,
) -> Result<ChampionConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(ChampionConfig::default()));

    if let Some(config_dir) = directories::ProjectDirs::from("dev", "champion", "champion") {
        let user_config = config_dir.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(".champion").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // CHAMPION_STORAGE__ROOT, CHAMPION_DISCOVERY__SCHEMA, ...
    figment = figment.merge(Env::prefixed("CHAMPION_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(Box::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_config_is_valid() {
        let config = ChampionConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.discovery.schema, SchemaPreference::Auto);
        assert_eq!(config.selection.direction, Direction::Maximize);
        assert_eq!(config.validation.mode, ValidationMode::Strict);
        assert_eq!(config.keys.float_digits, 12);
    }

    #[test]
    fn test_scratch_dir_defaults_under_root() {
        let storage = StorageConfig {
            root: PathBuf::from("/data/runs"),
            ..Default::default()
        };
        assert_eq!(storage.scratch_dir(), PathBuf::from("/data/runs/.scratch"));
    }

    #[test]
    fn test_validate_rejects_zero_limit() {
        let mut config = ChampionConfig::default();
        config.discovery.remote_limit = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_tracking_without_experiments() {
        let mut config = ChampionConfig::default();
        config.tracking.base_url = Some("http://localhost:5000".into());
        assert!(config.validate().is_err());
        config.tracking.experiment_ids = vec!["1".into()];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_config_defaults() {
        figment::Jail::expect_with(|jail| {
            let config = load_config(Some(jail.directory()), None).map_err(|e| *e)?;
            assert_eq!(config, ChampionConfig::default());
            Ok(())
        });
    }

    #[test]
    fn test_load_config_from_workspace() {
        figment::Jail::expect_with(|jail| {
            jail.create_dir(".champion")?;
            jail.create_file(
                ".champion/config.toml",
                r#"
[storage]
root = "/mnt/hpo"
backup_root = "/mnt/backup"

[discovery]
schema = "v1"
include_folds = false

[selection]
metric = "eval_loss"
direction = "minimize"
aggregation = "median"
"#,
            )?;
            let config = load_config(Some(jail.directory()), None).map_err(|e| *e)?;
            assert_eq!(config.storage.root, PathBuf::from("/mnt/hpo"));
            assert_eq!(config.discovery.schema, SchemaPreference::V1);
            assert!(!config.discovery.include_folds);
            assert_eq!(config.selection.direction, Direction::Minimize);
            assert_eq!(config.selection.aggregation, Aggregation::Median);
            Ok(())
        });
    }

    #[test]
    fn test_env_overrides_workspace() {
        figment::Jail::expect_with(|jail| {
            jail.create_dir(".champion")?;
            jail.create_file(
                ".champion/config.toml",
                "[selection]\nmetric = \"eval_f1\"\n",
            )?;
            jail.set_env("CHAMPION_SELECTION__METRIC", "eval_accuracy");
            jail.set_env("CHAMPION_DISCOVERY__REMOTE_LIMIT", "25");
            let config = load_config(Some(jail.directory()), None).map_err(|e| *e)?;
            assert_eq!(config.selection.metric, "eval_accuracy");
            assert_eq!(config.discovery.remote_limit, 25);
            Ok(())
        });
    }

    #[test]
    fn test_load_config_with_overrides() {
        figment::Jail::expect_with(|jail| {
            let mut overrides = ChampionConfig::default();
            overrides.validation.mode = ValidationMode::Lenient;
            let config = load_config(Some(jail.directory()), Some(&overrides)).map_err(|e| *e)?;
            assert_eq!(config.validation.mode, ValidationMode::Lenient);
            Ok(())
        });
    }

    #[test]
    fn test_written_defaults_load_back() {
        figment::Jail::expect_with(|jail| {
            let mut written = ChampionConfig::default();
            written.storage.root = PathBuf::from("/data/runs");
            written.selection.direction = Direction::Minimize;
            written.selection.metric = "eval_loss".into();
            let text = toml::to_string(&written).map_err(|e| e.to_string())?;
            jail.create_dir(".champion")?;
            jail.create_file(".champion/config.toml", &text)?;
            let loaded = load_config(Some(jail.directory()), None).map_err(|e| *e)?;
            assert_eq!(loaded, written);
            Ok(())
        });
    }
}
