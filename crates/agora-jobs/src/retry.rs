//! Exponential backoff for job attempts.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use agora_core::config::Config;
use tokio_retry::Retry;
use tokio_retry::strategy::ExponentialBackoff;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles after each failure.
    pub backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_attempts: config.max_attempts().max(1),
            backoff_base: Duration::from_millis(config.backoff_base_ms()),
        }
    }

    /// Delays between attempts: base, 2*base, 4*base, ...
    pub fn delays(&self) -> impl Iterator<Item = Duration> + use<> {
        let base_ms = self.backoff_base.as_millis() as u64;
        // from_millis(2).factor(f) yields 2f, 4f, 8f, ...
        ExponentialBackoff::from_millis(2)
            .factor((base_ms / 2).max(1))
            .max_delay(Duration::from_secs(60))
            .take(self.max_attempts.saturating_sub(1) as usize)
    }

    /// Run `attempt` until it succeeds or attempts run out, returning the
    /// last error. `attempt` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, label: &str, mut attempt: F) -> Result<T, String>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, String>>,
    {
        let counter = AtomicU32::new(0);
        let max = self.max_attempts;
        Retry::spawn(self.delays(), || {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            let fut = attempt(n);
            async move {
                let result = fut.await;
                if let Err(e) = &result {
                    warn!(job = label, attempt = n, max_attempts = max, error = %e, "Attempt failed");
                }
                result
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_delays_are_one_two_four_seconds() {
        let policy = RetryPolicy {
            max_attempts: 4,
            ..Default::default()
        };
        let delays: Vec<_> = policy.delays().collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4)
            ]
        );
    }

    #[test]
    fn test_three_attempts_means_two_delays() {
        assert_eq!(RetryPolicy::default().delays().count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_retries_until_success() {
        let policy = RetryPolicy::default();
        let result = policy
            .run("t", |n| async move {
                if n < 3 { Err(format!("fail {n}")) } else { Ok(n) }
            })
            .await;
        assert_eq!(result, Ok(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_returns_last_error_when_exhausted() {
        let policy = RetryPolicy::default();
        let result: Result<(), String> = policy
            .run("t", |n| async move { Err(format!("fail {n}")) })
            .await;
        assert_eq!(result, Err("fail 3".to_string()));
    }
}
