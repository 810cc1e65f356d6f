use crate::config::RetryConfig;
use crate::metrics::PROVIDER_CALLS_TOTAL;
use crate::providers::{ErrorClass, ProviderError};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Classified retry policy shared by every provider call site
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts.max(1)
    }

    /// Delay before the next attempt after `attempt` (0-based) failed with
    /// `class`, or `None` if the error is terminal.
    pub fn delay_for(&self, class: ErrorClass, attempt: u32) -> Option<Duration> {
        if attempt + 1 >= self.max_attempts() {
            return None;
        }

        match class {
            ErrorClass::RateLimited => {
                let jitter = self.config.rate_limit_jitter_ms as i64;
                let offset = if jitter > 0 {
                    rand::rng().random_range(-jitter..=jitter)
                } else {
                    0
                };
                let millis = (self.config.rate_limit_cooldown_ms as i64 + offset).max(0) as u64;
                Some(Duration::from_millis(millis))
            }
            ErrorClass::Transient => {
                let exponential =
                    self.config.backoff_base.powi(attempt as i32 + 1) * self.config.backoff_unit_ms as f64;
                let jitter = if self.config.backoff_jitter_ms > 0 {
                    rand::rng().random_range(0..self.config.backoff_jitter_ms)
                } else {
                    0
                };
                let millis = (exponential as u64)
                    .saturating_add(jitter)
                    .min(self.config.max_backoff_ms);
                Some(Duration::from_millis(millis))
            }
            ErrorClass::Permanent | ErrorClass::NotIndexed | ErrorClass::CreditsExhausted => None,
        }
    }

    /// Run `operation` until it succeeds, fails terminally or runs out of attempts
    pub async fn run<T, F, Fut>(&self, provider: &str, mut operation: F) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => {
                    PROVIDER_CALLS_TOTAL
                        .with_label_values(&[provider, "success"])
                        .inc();
                    return Ok(value);
                }
                Err(err) => {
                    PROVIDER_CALLS_TOTAL
                        .with_label_values(&[provider, err.label()])
                        .inc();

                    let Some(delay) = self.delay_for(err.classify(), attempt) else {
                        debug!(
                            provider,
                            attempt = attempt + 1,
                            error = %err,
                            "Provider call failed terminally"
                        );
                        return Err(err);
                    };

                    warn!(
                        provider,
                        attempt = attempt + 1,
                        max_attempts = self.max_attempts(),
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Provider call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
