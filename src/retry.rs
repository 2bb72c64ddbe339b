//! Caller-side retry and timeout helpers.
//!
//! Neither client retries on its own: [`crate::api::ApiClient::send`] surfaces
//! network failures immediately and the stream client never reconnects by
//! itself. Callers that want bounded retries opt in through this module.

use std::collections::hash_map::RandomState;
use std::future::Future;
use std::hash::{BuildHasher, Hasher};
use std::time::Duration;

use tracing::debug;

use crate::api::{ApiClient, ApiDefaults, ApiError, ApiRequest, ApiResponse};

/// How many times a transient failure is attempted and how long to wait
/// between attempts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included. Zero behaves like one.
    pub attempts: u32,
    /// Wait before the second attempt; doubles for each later one.
    pub base_delay: Duration,
    pub delay_cap: Duration,
    /// Upper bound of the random spread added to every wait.
    pub jitter: Duration,
}

impl RetryPolicy {
    /// A single attempt; the behavior of the clients themselves.
    pub fn none() -> Self {
        Self {
            attempts: 1,
            base_delay: Duration::ZERO,
            delay_cap: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }

    /// Short schedule for screens recovering from a network blip.
    pub fn interactive() -> Self {
        Self {
            attempts: ApiDefaults::RETRY_ATTEMPTS,
            base_delay: ApiDefaults::RETRY_BASE_DELAY,
            delay_cap: ApiDefaults::RETRY_DELAY_CAP,
            jitter: ApiDefaults::RETRY_JITTER,
        }
    }

    /// Wait after failed attempt number `failed` (1-based).
    pub fn delay_after(&self, failed: u32) -> Duration {
        let doublings = failed.saturating_sub(1).min(16);
        let backoff = self
            .base_delay
            .saturating_mul(1_u32 << doublings)
            .min(self.delay_cap);
        backoff + spread(self.jitter, failed)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::interactive()
    }
}

/// Runs `op` until it succeeds, `should_retry` rejects its error, or the
/// policy's attempts are used up.
///
/// `op` receives the 1-based attempt number.
pub async fn retry_async<T, E, Op, Fut, ShouldRetry>(
    policy: &RetryPolicy,
    mut op: Op,
    mut should_retry: ShouldRetry,
) -> Result<T, E>
where
    Op: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    ShouldRetry: FnMut(&E) -> bool,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;

    loop {
        let error = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };
        if attempt >= attempts || !should_retry(&error) {
            return Err(error);
        }

        let delay = policy.delay_after(attempt);
        debug!(
            event = "retry_scheduled",
            attempt,
            attempts,
            delay_ms = delay.as_millis() as u64
        );
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        attempt += 1;
    }
}

/// Sends `request` through `client`, retrying failures that
/// [`ApiError::is_retryable`] reports as transient.
///
/// Authorization failures are never retried here; the client already
/// performed its single refresh-and-replay.
pub async fn send_with_retry(
    client: &ApiClient,
    request: ApiRequest,
    policy: &RetryPolicy,
) -> Result<ApiResponse, ApiError> {
    retry_async(
        policy,
        |_| client.send(request.clone()),
        ApiError::is_retryable,
    )
    .await
}

/// Bounds `future` by `limit`; the future is dropped when the limit expires.
pub async fn with_timeout<T>(
    limit: Duration,
    future: impl Future<Output = T>,
) -> Result<T, tokio::time::error::Elapsed> {
    tokio::time::timeout(limit, future).await
}

/// Uniform pick in `0..=max`, seeded per call from the std hasher keys.
fn spread(max: Duration, salt: u32) -> Duration {
    let max_nanos = u64::try_from(max.as_nanos()).unwrap_or(u64::MAX);
    if max_nanos == 0 {
        return Duration::ZERO;
    }
    let mut hasher = RandomState::new().build_hasher();
    hasher.write_u32(salt);
    Duration::from_nanos(hasher.finish() % max_nanos.saturating_add(1))
}
