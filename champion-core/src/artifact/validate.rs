//! Checks that a directory holds a usable artifact.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::config::ValidationConfig;
use crate::layout::CHECKPOINT_DIR;

/// How much of an artifact must be present.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationMode {
    /// Weights and config file.
    #[default]
    Strict,
    /// Weights or config file.
    Lenient,
}

impl fmt::Display for ValidationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationMode::Strict => write!(f, "strict"),
            ValidationMode::Lenient => write!(f, "lenient"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactValidator {
    mode: ValidationMode,
    weight_names: Vec<String>,
    weight_extensions: Vec<String>,
    config_names: Vec<String>,
}

impl Default for ArtifactValidator {
    fn default() -> Self {
        Self::from_config(&ValidationConfig::default())
    }
}

impl ArtifactValidator {
    pub fn from_config(config: &ValidationConfig) -> Self {
        let (patterns, names): (Vec<_>, Vec<_>) = config
            .weight_files
            .iter()
            .cloned()
            .partition(|w| w.starts_with("*."));
        Self {
            mode: config.mode,
            weight_names: names,
            weight_extensions: patterns
                .into_iter()
                .map(|p| p.trim_start_matches('*').to_string())
                .collect(),
            config_names: config.config_files.clone(),
        }
    }

    pub fn mode(&self) -> ValidationMode {
        self.mode
    }

    /// Same rules under a different mode.
    pub fn with_mode(&self, mode: ValidationMode) -> Self {
        Self {
            mode,
            ..self.clone()
        }
    }

    fn is_weight_file(&self, name: &str) -> bool {
        self.weight_names.iter().any(|w| w == name)
            || self.weight_extensions.iter().any(|ext| name.ends_with(ext.as_str()))
    }

    /// Validate `dir` itself. The error is a human-readable reason.
    pub fn check(&self, dir: &Path) -> Result<(), String> {
        let entries = std::fs::read_dir(dir).map_err(|e| format!("{}: {e}", dir.display()))?;
        let mut has_weights = false;
        let mut has_config = false;
        for entry in entries.flatten() {
            let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
            if !is_file {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            has_weights |= self.is_weight_file(&name);
            has_config |= self.config_names.iter().any(|c| *c == *name);
        }
        let ok = match self.mode {
            ValidationMode::Strict => has_weights && has_config,
            ValidationMode::Lenient => has_weights || has_config,
        };
        if ok {
            return Ok(());
        }
        let missing = match (has_weights, has_config) {
            (false, false) => "weights and config file",
            (false, true) => "weights file",
            _ => "config file",
        };
        Err(format!(
            "{} is missing {missing} ({} validation)",
            dir.display(),
            self.mode
        ))
    }

    /// Find the artifact root under `dir`: `dir`, then `dir/checkpoint`, then each
    /// immediate subdirectory in name order (archives often wrap content in one folder).
    pub fn locate(&self, dir: &Path) -> Result<PathBuf, String> {
        if !dir.is_dir() {
            return Err(format!("{} is not a directory", dir.display()));
        }
        let first_err = match self.check(dir) {
            Ok(()) => return Ok(dir.to_path_buf()),
            Err(e) => e,
        };
        let nested = dir.join(CHECKPOINT_DIR);
        if nested.is_dir() && self.check(&nested).is_ok() {
            return Ok(nested);
        }
        let mut subdirs: Vec<PathBuf> = std::fs::read_dir(dir)
            .map_err(|e| format!("{}: {e}", dir.display()))?
            .flatten()
            .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .map(|e| e.path())
            .collect();
        subdirs.sort();
        subdirs
            .into_iter()
            .find(|d| self.check(d).is_ok())
            .ok_or(first_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(dir: &Path, name: &str) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join(name), b"x").unwrap();
    }

    #[test]
    fn test_strict_needs_both() {
        let dir = TempDir::new().unwrap();
        let v = ArtifactValidator::default();
        touch(dir.path(), "model.safetensors");
        let err = v.check(dir.path()).unwrap_err();
        assert!(err.contains("config file"));
        touch(dir.path(), "config.json");
        assert!(v.check(dir.path()).is_ok());
    }

    #[test]
    fn test_lenient_accepts_either() {
        let dir = TempDir::new().unwrap();
        let v = ArtifactValidator::default().with_mode(ValidationMode::Lenient);
        touch(dir.path(), "config.json");
        assert!(v.check(dir.path()).is_ok());
    }

    #[test]
    fn test_extension_pattern_matches_sharded_weights() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "model-00001-of-00002.safetensors");
        touch(dir.path(), "config.json");
        assert!(ArtifactValidator::default().check(dir.path()).is_ok());
    }

    #[test]
    fn test_locate_descends_into_wrapper_dir() {
        let dir = TempDir::new().unwrap();
        let inner = dir.path().join("bert-ckpt");
        touch(&inner, "pytorch_model.bin");
        touch(&inner, "config.json");
        assert_eq!(ArtifactValidator::default().locate(dir.path()).unwrap(), inner);
    }

    #[test]
    fn test_locate_reports_top_level_reason() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "README.md");
        let err = ArtifactValidator::default().locate(dir.path()).unwrap_err();
        assert!(err.contains("weights and config file"));
    }
}
