//! Bounded exponential backoff for step effects within one attempt.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use eventdesk_core::config::RetryConfig;

use crate::collaborators::EffectError;

/// Retry configuration with exponential backoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff_ms: config.initial_backoff_ms,
            max_backoff_ms: config.max_backoff_ms,
            backoff_multiplier: config.backoff_multiplier,
        }
    }
}

impl RetryPolicy {
    /// Compute the backoff before retry number `attempt` (0-indexed).
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms =
            self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        let capped_ms = base_ms.min(self.max_backoff_ms as f64);
        Duration::from_millis(capped_ms as u64)
    }

    /// Runs `op` until it succeeds, fails permanently, or the attempt
    /// budget is spent. Returns the last result and the attempts used.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> (Result<T, EffectError>, u32)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, EffectError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return (Ok(value), attempt),
                Err(err) if err.is_transient() && attempt < self.max_attempts => {
                    let delay = self.backoff_for_attempt(attempt - 1);
                    warn!(
                        effect = label,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient step failure, backing off"
                    );
                    metrics::counter!("journey.effect_retries", "effect" => label.to_string())
                        .increment(1);
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return (Err(err), attempt),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            backoff_multiplier: 2.0,
        }
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 1000,
            backoff_multiplier: 2.0,
        };
        assert_eq!(policy.backoff_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.backoff_for_attempt(2), Duration::from_millis(400));
        assert_eq!(policy.backoff_for_attempt(10), Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried_to_the_bound() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let (result, attempts) = fast(3)
            .run("webhook", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(EffectError::transient("503"))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(attempts, 3);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_stops_immediately() {
        let (result, attempts) = fast(5)
            .run("email", || async { Err::<(), _>(EffectError::permanent("bad template")) })
            .await;
        assert!(result.is_err());
        assert_eq!(attempts, 1);
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failure() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let (result, attempts) = fast(3)
            .run("email", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(EffectError::transient("timeout"))
                } else {
                    Ok("sent")
                }
            })
            .await;
        assert_eq!(result.unwrap(), "sent");
        assert_eq!(attempts, 2);
    }
}
