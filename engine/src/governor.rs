//! Rate limiting and retry for image store calls.
//!
//! A single [`Governor`] is shared by every worker so the aggregate request
//! rate is bounded. [`GovernedStore`] applies it to an [`ImageStore`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use regsweep_core::config::{RateLimitConfig, RetryConfig};
use regsweep_core::error::Result;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::store::{ImageManifestInfo, ImageStore};

/// Floor for any computed backoff.
const MIN_DELAY: Duration = Duration::from_millis(100);

/// Jitter spread as a fraction of the delay.
const JITTER_FRACTION: f64 = 0.1;

/// Token bucket limiter. Callers wait for a token instead of failing.
pub struct TokenBucket {
    rate: f64,
    capacity: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Bucket starts full.
    pub fn new(requests_per_second: f64, burst_size: u32) -> Self {
        let capacity = f64::from(burst_size.max(1));
        Self {
            rate: requests_per_second,
            capacity,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Wait for and take one token.
    ///
    /// The state lock is held while sleeping, so waiters are served in order.
    pub async fn acquire(&self) {
        let mut state = self.state.lock().await;
        loop {
            let now = Instant::now();
            let elapsed = now.duration_since(state.last_refill).as_secs_f64();
            state.tokens = (state.tokens + elapsed * self.rate).min(self.capacity);
            state.last_refill = now;

            if state.tokens >= 1.0 {
                state.tokens -= 1.0;
                return;
            }

            let wait = Duration::from_secs_f64((1.0 - state.tokens) / self.rate);
            tracing::trace!(wait_ms = wait.as_millis() as u64, "Rate limit reached, waiting");
            tokio::time::sleep(wait).await;
        }
    }

    /// Tokens currently available (after refill).
    pub async fn available(&self) -> f64 {
        let state = self.state.lock().await;
        let elapsed = Instant::now().duration_since(state.last_refill).as_secs_f64();
        (state.tokens + elapsed * self.rate).min(self.capacity)
    }
}

/// Exponential backoff schedule.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub exponential_base: f64,
    pub jitter: bool,
    pub rate_limit_cooldown: Duration,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_delay: config.initial_delay(),
            max_delay: config.max_delay(),
            exponential_base: config.exponential_base,
            jitter: config.jitter,
            rate_limit_cooldown: config.rate_limit_cooldown(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt + 1`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.exponential_base.powi(attempt.min(i32::MAX as u32) as i32);
        let mut secs = (self.initial_delay.as_secs_f64() * exp).min(self.max_delay.as_secs_f64());
        if self.jitter {
            let spread = secs * JITTER_FRACTION;
            secs += rand::thread_rng().gen_range(-spread..=spread);
        }
        Duration::from_secs_f64(secs.max(MIN_DELAY.as_secs_f64()))
    }

    /// Backoff after a "too many requests" response.
    pub fn rate_limited_delay_for(&self, attempt: u32) -> Duration {
        self.delay_for(attempt) + self.rate_limit_cooldown
    }
}

/// Shared limiter plus retry wrapper.
pub struct Governor {
    bucket: Option<TokenBucket>,
    policy: RetryPolicy,
}

impl Governor {
    pub fn new(rate_limit: &RateLimitConfig, retry: &RetryConfig) -> Self {
        let bucket = rate_limit
            .enabled
            .then(|| TokenBucket::new(rate_limit.requests_per_second, rate_limit.burst_size));
        Self {
            bucket,
            policy: RetryPolicy::from(retry),
        }
    }

    /// Governor with an explicit policy and optional bucket.
    pub fn with_policy(bucket: Option<TokenBucket>, policy: RetryPolicy) -> Self {
        Self { bucket, policy }
    }

    /// No rate limit, no retries.
    pub fn unlimited() -> Self {
        Self {
            bucket: None,
            policy: RetryPolicy {
                max_retries: 0,
                ..RetryPolicy::default()
            },
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `f` under the rate limit, retrying retryable failures.
    ///
    /// Every attempt takes a token. Non-retryable errors surface at once;
    /// retryable ones surface after `max_retries` retries.
    pub async fn call<T, F, Fut>(&self, operation: &str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            if let Some(bucket) = &self.bucket {
                bucket.acquire().await;
            }

            match f().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.policy.max_retries => {
                    let delay = if e.is_rate_limited() {
                        self.policy.rate_limited_delay_for(attempt)
                    } else {
                        self.policy.delay_for(attempt)
                    };
                    tracing::warn!(
                        operation,
                        attempt = attempt + 1,
                        max_retries = self.policy.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying after backend failure"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_retryable() {
                        tracing::error!(
                            operation,
                            attempts = attempt + 1,
                            error = %e,
                            "Giving up after retries"
                        );
                    }
                    return Err(e);
                }
            }
        }
    }
}

/// [`ImageStore`] wrapper routing registry calls through a [`Governor`].
///
/// Delete-switch toggling and readiness polling pass straight through.
pub struct GovernedStore {
    inner: Arc<dyn ImageStore>,
    governor: Arc<Governor>,
}

impl GovernedStore {
    pub fn new(inner: Arc<dyn ImageStore>, governor: Arc<Governor>) -> Self {
        Self { inner, governor }
    }
}

#[async_trait]
impl ImageStore for GovernedStore {
    async fn list_tags(&self, repository: &str) -> Result<Vec<String>> {
        let inner = &self.inner;
        self.governor
            .call("list_tags", move || inner.list_tags(repository))
            .await
    }

    async fn inspect(&self, repository: &str, tag: &str) -> Result<ImageManifestInfo> {
        let inner = &self.inner;
        self.governor
            .call("inspect", move || inner.inspect(repository, tag))
            .await
    }

    async fn delete(&self, repository: &str, tag: &str) -> Result<()> {
        let inner = &self.inner;
        self.governor
            .call("delete", move || inner.delete(repository, tag))
            .await
    }

    async fn set_delete_enabled(&self, enabled: bool) -> Result<()> {
        self.inner.set_delete_enabled(enabled).await
    }

    async fn wait_ready(&self) -> Result<()> {
        self.inner.wait_ready().await
    }
}
