//! Backoff for retrying whole sync sessions.
//!
//! Only transport failures are retried. Per-entity deferrals are not
//! retried here; they surface as a failed session when nothing else in
//! the session made progress.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use fieldsync_common::Result;

use crate::config::SchedulerConfig;

/// Largest growth factor applied to `retryDelay`.
const MAX_GROWTH: u32 = 8;

/// Retry schedule for a session: `retries` extra attempts, waiting
/// `first_delay`, then doubling up to `MAX_GROWTH` times that.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionBackoff {
    retries: u32,
    first_delay: Duration,
    jitter: bool,
}

impl SessionBackoff {
    /// Schedule from `retryAttempts` and `retryDelay`, with jitter.
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            retries: config.retry_attempts,
            first_delay: config.retry_delay_duration(),
            jitter: true,
        }
    }

    /// Same schedule with exact delays.
    pub fn without_jitter(self) -> Self {
        Self {
            jitter: false,
            ..self
        }
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Wait before retry number `retry` (0 for the first retry).
    pub fn delay(&self, retry: u32) -> Duration {
        let growth = 1u32
            .checked_shl(retry)
            .unwrap_or(MAX_GROWTH)
            .min(MAX_GROWTH);
        let delay = self.first_delay.saturating_mul(growth);
        if self.jitter {
            // Spread retries of many devices over 75%..125% of the delay
            let factor = 0.75 + rand::random::<f64>() / 2.0;
            Duration::try_from_secs_f64(delay.as_secs_f64() * factor).unwrap_or(delay)
        } else {
            delay
        }
    }

    /// Run `attempt` until it succeeds, fails with a non-transport error,
    /// or the retries are used up.
    pub async fn run<F, Fut, T>(&self, attempt: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retry = 0;
        loop {
            let err = match attempt().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if !err.is_transport_failure() || retry >= self.retries {
                return Err(err);
            }

            let wait = self.delay(retry);
            retry += 1;
            warn!(
                "Session attempt failed ({}), retry {}/{} in {:?}",
                err, retry, self.retries, wait
            );
            sleep(wait).await;
            debug!("Retrying session");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldsync_common::Error;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn backoff(retries: u32, delay_secs: u64) -> SessionBackoff {
        let config = SchedulerConfig {
            retry_attempts: retries,
            retry_delay: delay_secs,
            ..SchedulerConfig::default()
        };
        SessionBackoff::from_config(&config).without_jitter()
    }

    #[test]
    fn test_delay_doubles_up_to_cap() {
        let b = backoff(10, 60);
        assert_eq!(b.retries(), 10);
        assert_eq!(b.delay(0), Duration::from_secs(60));
        assert_eq!(b.delay(1), Duration::from_secs(120));
        assert_eq!(b.delay(2), Duration::from_secs(240));
        assert_eq!(b.delay(3), Duration::from_secs(480));
        assert_eq!(b.delay(9), Duration::from_secs(480));
        assert_eq!(b.delay(40), Duration::from_secs(480));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let config = SchedulerConfig {
            retry_delay: 100,
            ..SchedulerConfig::default()
        };
        let b = SessionBackoff::from_config(&config);
        for _ in 0..50 {
            let d = b.delay(0);
            assert!(d >= Duration::from_secs(75) && d <= Duration::from_secs(125));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_failures_are_retried() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let result = backoff(3, 1)
            .run(move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::Network("offline".to_string()))
                } else {
                    Ok("done")
                }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_retries() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let start = tokio::time::Instant::now();
        let result: Result<()> = backoff(2, 10)
            .run(move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::Timeout("fetch".to_string()))
            })
            .await;

        assert!(matches!(result, Err(Error::Timeout(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 10s + 20s of backoff
        assert_eq!(start.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let result: Result<()> = backoff(5, 1)
            .run(move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::ManualResolution("cancelled".to_string()))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
