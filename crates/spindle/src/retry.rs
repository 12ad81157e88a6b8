// Retry Policy: bounded retry with exponential backoff around single transport fetches.
//
// Implements exponential backoff with jitter, max delay cap, and 4xx short-circuiting

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use crate::config::EngineConfig;
use crate::error::{DownloadError, FetchFailure};
use crate::limiter::ConcurrencyLimiter;
use crate::transport::{ByteRange, FetchRequest, FetchResult, Transport};

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Values below one are treated as one.
    pub max_attempts: u32,
    /// Base delay between retries. Actual delay = base * 2^retry + jitter.
    pub base_delay: Duration,
    /// Hard cap on the computed delay to prevent unbounded growth.
    pub max_delay: Duration,
    /// When true, adds random jitter of [0, base_delay/2) to prevent thundering herd.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            jitter: true,
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Compute the delay before retry number `retry` (0-indexed).
    pub fn delay_for_attempt(&self, retry: u32) -> Duration {
        // 2^retry is computed with a checked shift so retries >= 32 saturate.
        let multiplier = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        let exp_delay = self
            .base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay);
        let capped = exp_delay.min(self.max_delay);

        if !self.jitter {
            return capped;
        }

        // Jitter is limited so the final delay never exceeds `max_delay`.
        let jitter_range_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX) / 2;
        if jitter_range_ms == 0 {
            return capped;
        }

        let remaining_ms =
            u64::try_from(self.max_delay.saturating_sub(capped).as_millis()).unwrap_or(0);
        let jitter_limit_ms = jitter_range_ms.min(remaining_ms);
        if jitter_limit_ms == 0 {
            return capped;
        }

        let jitter_ms = rand::rng().random_range(0..jitter_limit_ms);
        (capped + Duration::from_millis(jitter_ms)).min(self.max_delay)
    }
}

/// Run `request` through `transport` until it succeeds, fails permanently, or
/// `policy` runs out of attempts.
///
/// Each attempt holds one limiter slot only while the transport call is in flight;
/// backoff sleeps hold none. The returned failure carries the last underlying
/// error and the number of attempts made.
pub async fn fetch_with_retry(
    transport: &dyn Transport,
    request: &FetchRequest,
    policy: &RetryPolicy,
    limiter: &ConcurrencyLimiter,
    token: &CancellationToken,
) -> FetchResult {
    let max_attempts = policy.attempts();
    let mut attempt = 0u32;

    loop {
        if token.is_cancelled() {
            return Err(FetchFailure::cancelled().with_attempts(attempt));
        }
        attempt += 1;

        let result = {
            let Ok(_permit) = limiter.acquire(token).await else {
                return Err(FetchFailure::cancelled().with_attempts(attempt - 1));
            };
            trace!(url = %request.url, attempt, "fetch attempt");
            tokio::select! {
                _ = token.cancelled() => Err(FetchFailure::cancelled()),
                result = transport.fetch(request) => result,
            }
        };

        let failure = match result {
            Ok(bytes) => return Ok(bytes),
            Err(failure) => failure.with_attempts(attempt),
        };

        if !failure.is_retryable() || attempt >= max_attempts {
            return Err(failure);
        }

        let delay = policy.delay_for_attempt(attempt - 1);
        warn!(
            url = %request.url,
            attempt,
            max = max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %failure,
            "Retrying after transient error"
        );
        tokio::select! {
            _ = token.cancelled() => {
                return Err(FetchFailure::cancelled().with_attempts(attempt));
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Transport, limiter, retry policy and cancellation for one job, bundled.
#[derive(Clone)]
pub struct Fetcher {
    transport: Arc<dyn Transport>,
    limiter: ConcurrencyLimiter,
    config: Arc<EngineConfig>,
    token: CancellationToken,
}

impl Fetcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        limiter: ConcurrencyLimiter,
        config: Arc<EngineConfig>,
        token: CancellationToken,
    ) -> Self {
        Self {
            transport,
            limiter,
            config,
            token,
        }
    }

    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.limiter
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub async fn fetch(&self, request: &FetchRequest) -> FetchResult {
        fetch_with_retry(
            self.transport.as_ref(),
            request,
            &self.config.retry,
            &self.limiter,
            &self.token,
        )
        .await
    }

    /// Fetch `url` (optionally a byte range of it) with the configured headers and timeout.
    pub async fn fetch_url(
        &self,
        url: &str,
        range: Option<ByteRange>,
    ) -> Result<Bytes, DownloadError> {
        let request = FetchRequest::from_config(url, &self.config).with_range(range);
        self.fetch(&request)
            .await
            .map_err(|failure| DownloadError::transport(url, failure))
    }
}
