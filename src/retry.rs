//! Bounded exponential backoff for transient failures.

use std::future::Future;

use tracing::warn;

use crate::config::RetryConfig;
use crate::Result;

/// Run `op` until it succeeds, fails with a non-transient error, or the
/// attempt budget is spent.
///
/// The delay starts at `initial_delay_ms` and doubles after each failure,
/// capped at `max_delay_ms`. Only errors for which
/// [`AppError::is_transient`](crate::AppError::is_transient) holds are retried.
///
/// # Errors
///
/// Returns the last error produced by `op`.
pub async fn with_backoff<T, F, Fut>(config: &RetryConfig, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut backoff = config.initial_delay();
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(error) if error.is_transient() && attempt < config.max_attempts => {
                warn!(?error, delay = ?backoff, attempt, "{what} failed; retrying");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(config.max_delay());
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}
