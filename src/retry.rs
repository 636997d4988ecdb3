//! Retry-on-conflict combinator for optimistic read-modify-write loops.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::error::{HostUpgradesError, Result};

/// Backoff policy for a bounded retry loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    /// Delay before the first retry.
    pub duration: Duration,
    /// Multiplier applied to the delay after every retry.
    pub factor: f64,
    /// Random extra delay, as a fraction of the current delay.
    pub jitter: f64,
    /// Maximum number of attempts, including the first one.
    pub steps: u32,
    /// Upper bound on a single delay.
    pub cap: Option<Duration>,
}

impl Backoff {
    /// Kubernetes client default: 10ms, 50ms, 250ms between 4 attempts.
    pub const DEFAULT: Self = Self {
        duration: Duration::from_millis(10),
        factor: 5.0,
        jitter: 0.1,
        steps: 4,
        cap: None,
    };

    /// Flat jittered 10-20ms retries for racing lock writers.
    pub const LOCK: Self = Self {
        duration: Duration::from_millis(10),
        factor: 1.0,
        jitter: 1.0,
        steps: 50,
        cap: Some(Duration::from_secs(1)),
    };

    /// Delay to sleep after the given failed attempt (1-based), before jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let delay = self.duration.mul_f64(self.factor.max(1.0).powi(exponent));

        match self.cap {
            Some(cap) if delay > cap => cap,
            _ => delay,
        }
    }

    fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);

        if self.jitter <= 0.0 {
            return base;
        }

        let extra = base.mul_f64(rand::thread_rng().gen_range(0.0..=self.jitter));
        match self.cap {
            Some(cap) if base + extra > cap => cap,
            _ => base + extra,
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Run `op` until it succeeds, fails with an error `retryable` rejects, or
/// the backoff runs out of steps. Exhaustion returns the last error.
pub async fn retry_on<T, F, Fut, P>(backoff: &Backoff, retryable: P, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&HostUpgradesError) -> bool,
{
    let mut attempt = 0;

    loop {
        attempt += 1;

        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if retryable(&err) && attempt < backoff.steps => {
                let delay = backoff.delay(attempt);
                debug!(
                    attempt = attempt,
                    steps = backoff.steps,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Retrying after conflict"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// [`retry_on`] for the common case of optimistic-concurrency conflicts.
pub async fn retry_on_conflict<T, F, Fut>(backoff: &Backoff, op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_on(backoff, HostUpgradesError::is_conflict, op).await
}
