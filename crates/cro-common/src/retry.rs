//! Bounded polling, cancellation and backoff helpers.
//!
//! Providers never loop on their own beyond a bounded list poll. Everything
//! else that fails is handed back to the controller, which schedules the
//! next pass with [`BackoffConfig`].
//!
//! # Example
//!
//! ```ignore
//! use cro_common::retry::{poll_until_ok, PollConfig};
//!
//! let groups = poll_until_ok(&PollConfig::default(), "describe_replication_groups", &cancel, || {
//!     api.describe_replication_groups()
//! })
//! .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::{Error, Result};

/// Interval and ceiling for a bounded poll
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PollConfig {
    /// Delay between attempts
    pub interval: Duration,
    /// Give up once this much time has passed
    pub timeout: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(300),
        }
    }
}

impl PollConfig {
    /// Create a poll config from seconds
    pub fn from_secs(interval: u64, timeout: u64) -> Self {
        Self {
            interval: Duration::from_secs(interval),
            timeout: Duration::from_secs(timeout),
        }
    }
}

/// Race a future against a cancellation token.
///
/// Returns [`Error::Cancelled`] if the token fires first. The wrapped future
/// is dropped at that point, so it must not leave partial local state.
pub async fn cancellable<T, F>(cancel: &CancellationToken, operation: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::cancelled(operation)),
        res = fut => res,
    }
}

/// Run `operation` immediately, then every `interval` until it succeeds.
///
/// Fails with [`Error::Timeout`] once the ceiling is reached and with
/// [`Error::Cancelled`] if the token fires. Each attempt is itself raced
/// against the token.
pub async fn poll_until_ok<F, Fut, T>(
    config: &PollConfig,
    operation_name: &str,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let start = Instant::now();
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let err = match cancellable(cancel, operation_name, operation()).await {
            Ok(value) => return Ok(value),
            Err(e @ Error::Cancelled { .. }) => return Err(e),
            Err(e) => e,
        };

        let elapsed = start.elapsed();
        if elapsed + config.interval > config.timeout {
            warn!(
                operation = %operation_name,
                attempt = attempt,
                error = %err,
                "Poll ceiling reached"
            );
            return Err(Error::timeout(
                format!("{operation_name} (last error: {err})"),
                elapsed,
            ));
        }

        warn!(
            operation = %operation_name,
            attempt = attempt,
            error = %err,
            delay_ms = config.interval.as_millis(),
            "Poll attempt failed, retrying"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::cancelled(operation_name)),
            _ = tokio::time::sleep(config.interval) => {}
        }
    }
}

/// Exponential backoff used between failed passes for one request
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Upper bound on any delay
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            backoff_multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// Delay for the nth consecutive failure (1-based), without jitter
    pub fn base_delay(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exp);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }

    /// Delay for the nth consecutive failure with jitter, capped at `max_delay`
    pub fn delay_for(&self, failures: u32) -> Duration {
        // Jitter: 0.8x to 1.2x of the base delay
        let jitter = rand::thread_rng().gen_range(0.8..1.2);
        let secs = self.base_delay(failures).as_secs_f64() * jitter;
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn transient() -> Error {
        Error::external("aws", "list", "throttled")
    }

    #[tokio::test(start_paused = true)]
    async fn poll_succeeds_after_failures() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let cancel = CancellationToken::new();

        let result = poll_until_ok(&PollConfig::default(), "list", &cancel, || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(transient())
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_times_out_at_ceiling() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let cancel = CancellationToken::new();
        let config = PollConfig::from_secs(5, 20);

        let result: Result<()> = poll_until_ok(&config, "list", &cancel, || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(transient())
            }
        })
        .await;

        let err = result.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }), "got {err}");
        assert!(err.to_string().contains("throttled"));
        // attempts at 0s, 5s, 10s, 15s, 20s
        assert_eq!(count.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_stops_when_cancelled() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(7)).await;
            trigger.cancel();
        });

        let result: Result<()> =
            poll_until_ok(&PollConfig::default(), "list", &cancel, || async {
                Err(transient())
            })
            .await;

        assert!(matches!(result.unwrap_err(), Error::Cancelled { .. }));
    }

    #[tokio::test]
    async fn cancellable_returns_cancelled_for_fired_token() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = cancellable(&cancel, "create_bucket", async { Ok(1) }).await;
        assert!(matches!(result.unwrap_err(), Error::Cancelled { .. }));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let config = BackoffConfig::default();
        assert_eq!(config.base_delay(1), Duration::from_secs(5));
        assert_eq!(config.base_delay(2), Duration::from_secs(10));
        assert_eq!(config.base_delay(3), Duration::from_secs(20));
        assert_eq!(config.base_delay(10), Duration::from_secs(300));
        assert_eq!(config.base_delay(u32::MAX), Duration::from_secs(300));
    }

    #[test]
    fn jittered_delay_stays_in_bounds() {
        let config = BackoffConfig::default();
        for failures in 1..12 {
            let base = config.base_delay(failures).as_secs_f64();
            let d = config.delay_for(failures).as_secs_f64();
            assert!(d >= base * 0.8 - f64::EPSILON);
            assert!(d <= 300.0);
        }
    }
}
