//! Tracing subscriber setup for binaries and integration harnesses.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::LoggingConfig;
use crate::error::ConfigError;

/// Environment variable that overrides the configured filter.
pub const LOG_ENV: &str = "CHAMPION_LOG";

/// Filter from `CHAMPION_LOG` when set, else from `level`.
pub fn build_filter(level: &str) -> Result<EnvFilter, ConfigError> {
    if let Ok(directive) = std::env::var(LOG_ENV) {
        return EnvFilter::try_new(&directive).map_err(|e| ConfigError::Logging {
            message: format!("{LOG_ENV}={directive}: {e}"),
        });
    }
    EnvFilter::try_new(level).map_err(|e| ConfigError::Logging {
        message: format!("logging.level={level}: {e}"),
    })
}

/// Install the global subscriber: human-readable stderr output, plus a daily-rolling
/// JSON file when `json_dir` is set.
///
/// Keep the returned guard alive for the lifetime of the process; dropping it flushes
/// and stops the file writer.
pub fn init_tracing(config: &LoggingConfig) -> Result<Option<WorkerGuard>, ConfigError> {
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(build_filter(&config.level)?);

    let (json_layer, guard) = match &config.json_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).map_err(|e| ConfigError::Logging {
                message: format!("{}: {e}", dir.display()),
            })?;
            let appender = tracing_appender::rolling::daily(dir, &config.file_prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer)
                .with_filter(EnvFilter::new("debug"));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .try_init()
        .map_err(|e| ConfigError::Logging {
            message: e.to_string(),
        })?;
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_filter_accepts_directives() {
        assert!(build_filter("debug").is_ok());
        assert!(build_filter("champion_core=trace,warn").is_ok());
    }

    #[test]
    fn test_filter_rejects_garbage() {
        if std::env::var(LOG_ENV).is_ok() {
            return;
        }
        let err = build_filter("champion_core=notalevel").unwrap_err();
        assert!(err.to_string().contains("logging.level"));
    }

    #[test]
    fn test_init_with_json_dir_returns_guard() {
        let tmp = TempDir::new().unwrap();
        let config = LoggingConfig {
            json_dir: Some(tmp.path().join("logs")),
            ..Default::default()
        };
        let guard = init_tracing(&config).unwrap();
        assert!(guard.is_some());
        assert!(tmp.path().join("logs").is_dir());
        tracing::info!(component = "logging", "Subscriber installed");

        // A second global subscriber is refused.
        assert!(init_tracing(&LoggingConfig::default()).is_err());
    }
}
