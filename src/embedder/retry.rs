/// Bounded retry with exponential backoff around a single embedding call.
use std::time::Duration;

use tracing::warn;

use super::{Embedder, EmbedderError};

/// How an embedding call is bounded and retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt. `0` means a single attempt.
    pub max_retries: u32,
    pub base_backoff: Duration,
    /// Upper bound on each individual attempt.
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_backoff: Duration::from_millis(500),
            timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// One attempt bounded by `timeout`, no retries.
    pub fn single_attempt(timeout: Duration) -> Self {
        Self {
            max_retries: 0,
            base_backoff: Duration::ZERO,
            timeout,
        }
    }

    /// Delay before retry number `attempt + 1`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_backoff.saturating_mul(1u32 << attempt.min(16))
    }
}

/// Embed `text`, retrying transient failures according to `policy`.
///
/// A vector of the wrong length is an [`EmbedderError::InvalidResponse`] and
/// is not retried.
///
/// # Errors
///
/// Returns the last error once attempts are exhausted, or the first
/// non-transient error.
pub async fn embed_with_retry(
    embedder: &dyn Embedder,
    text: &str,
    policy: &RetryPolicy,
) -> Result<Vec<f32>, EmbedderError> {
    let mut attempt = 0;
    loop {
        let result = match tokio::time::timeout(policy.timeout, embedder.embed(text)).await {
            Ok(result) => result,
            Err(_) => Err(EmbedderError::Timeout(policy.timeout)),
        };

        let err = match result {
            Ok(vector) if vector.len() == embedder.dimensions() => return Ok(vector),
            Ok(vector) => EmbedderError::InvalidResponse(format!(
                "expected {} dimensions, got {}",
                embedder.dimensions(),
                vector.len()
            )),
            Err(err) => err,
        };

        if !err.is_transient() || attempt >= policy.max_retries {
            return Err(err);
        }

        let delay = policy.backoff(attempt);
        warn!(
            "{} embedding failed ({err}), retrying in {}ms ({}/{})",
            embedder.name(),
            delay.as_millis(),
            attempt + 1,
            policy.max_retries
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}
