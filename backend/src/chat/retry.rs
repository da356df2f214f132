//! Bounded timeout and retry for remote calls
//!
//! Transient failures (see [`ChatError::is_transient`]) are retried up to
//! `max_retries` times with doubling backoff. Anything else, and the last
//! transient failure, goes back to the caller unchanged.

use crate::config::SessionConfig;
use crate::error::ChatError;
use std::future::Future;
use tracing::warn;

/// Run `call` once under `config.request_timeout`
pub async fn with_timeout<T, Fut>(
    config: &SessionConfig,
    operation: &str,
    call: Fut,
) -> Result<T, ChatError>
where
    Fut: Future<Output = Result<T, ChatError>>,
{
    tokio::time::timeout(config.request_timeout, call)
        .await
        .unwrap_or_else(|_| {
            Err(ChatError::Timeout(format!(
                "{} did not complete within {:?}",
                operation, config.request_timeout
            )))
        })
}

/// Run `call` with the configured timeout, retrying transient failures
pub async fn with_retry<T, F, Fut>(
    config: &SessionConfig,
    operation: &str,
    mut call: F,
) -> Result<T, ChatError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ChatError>>,
{
    let mut attempt = 0;
    let mut backoff = config.retry_backoff;

    loop {
        match with_timeout(config, operation, call()).await {
            Err(e) if e.is_transient() && attempt < config.max_retries => {
                attempt += 1;
                warn!(
                    operation,
                    attempt,
                    error = %e,
                    backoff_ms = backoff.as_millis() as u64,
                    "Transient failure, retrying"
                );
                tokio::time::sleep(backoff).await;
                backoff = backoff.saturating_mul(2);
            }
            result => return result,
        }
    }
}
