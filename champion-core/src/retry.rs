//! Exponential backoff for transient tracking-service failures.

use rand::Rng;
use std::future::Future;
use std::time::Duration;

use crate::config::RetryConfig;
use crate::error::TrackingError;

/// Execute an async operation with exponential backoff retry on transient errors.
///
/// Retries on errors where [`TrackingError::is_transient`] holds (unreachable, timeout,
/// HTTP 429 and 5xx). Permanent errors return immediately.
pub async fn with_retry<F, Fut, T>(config: &RetryConfig, operation: F) -> Result<T, TrackingError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, TrackingError>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(val) => return Ok(val),
            Err(e) => {
                if !e.is_transient() || attempt >= config.max_retries {
                    return Err(e);
                }
                let backoff_ms = compute_backoff(config, attempt);
                tracing::warn!(
                    attempt = attempt + 1,
                    max = config.max_retries,
                    backoff_ms = backoff_ms,
                    error = %e,
                    "Retrying after transient error"
                );
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                attempt += 1;
            }
        }
    }
}

/// Exponential backoff capped at `max_backoff_ms`, plus up to 25% jitter.
pub fn compute_backoff(config: &RetryConfig, attempt: u32) -> u64 {
    let base = config.initial_backoff_ms as f64 * config.backoff_multiplier.powi(attempt as i32);
    let capped = base.min(config.max_backoff_ms as f64) as u64;
    if config.jitter && capped > 0 {
        let jitter = rand::thread_rng().gen_range(0..=capped / 4);
        capped + jitter
    } else {
        capped
    }
}
