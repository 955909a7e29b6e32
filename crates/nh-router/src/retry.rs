//! Retry policies and the retry-executing loop.
//!
//! Grounded in `fc-router::mediator::HttpMediator::mediate`'s retry loop
//! (fixed attempt count, per-attempt delay table, stop immediately on
//! success or a non-retryable classification).

use std::future::Future;
use std::time::Duration;

use nh_common::Error;
use rand::Rng;

/// Contract shared by all backoff policies.
pub trait RetryPolicy: Send + Sync {
    fn should_retry(&self, err: &Error, attempt: u32) -> bool {
        default_should_retry(err, attempt, self.max_attempts())
    }
    fn retry_delay(&self, attempt: u32) -> Duration;
    fn max_attempts(&self) -> u32;
}

/// Substrings that mark an otherwise-unflagged error as retryable. Consulted
/// only when the error's own `retryable` flag doesn't already decide it.
const RETRYABLE_SUBSTRINGS: &[&str] = &[
    "timeout",
    "connection refused",
    "network",
    "temporary failure",
    "service unavailable",
    "too many requests",
];

fn default_should_retry(err: &Error, attempt: u32, max_attempts: u32) -> bool {
    if attempt >= max_attempts {
        return false;
    }
    if err.retryable {
        return true;
    }
    let haystack = err.message.to_ascii_lowercase();
    RETRYABLE_SUBSTRINGS.iter().any(|needle| haystack.contains(needle))
}

/// delay = min(base * mult^(attempt-1) * (1 + jitter*U(-1,1)), max_delay)
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    pub base: Duration,
    pub multiplier: f64,
    pub jitter: f64,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            multiplier: 2.0,
            jitter: 0.1,
            max_delay: Duration::from_secs(30),
            max_attempts: 3,
        }
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn retry_delay(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let raw_ms = self.base.as_millis() as f64 * exp;
        let jitter_factor = 1.0 + self.jitter * rand::thread_rng().gen_range(-1.0..=1.0);
        let jittered_ms = (raw_ms * jitter_factor).max(0.0);
        let capped = jittered_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

/// delay = min(base + (attempt-1)*increment, max_delay)
#[derive(Debug, Clone, Copy)]
pub struct LinearBackoff {
    pub base: Duration,
    pub increment: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for LinearBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            increment: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            max_attempts: 3,
        }
    }
}

impl RetryPolicy for LinearBackoff {
    fn retry_delay(&self, attempt: u32) -> Duration {
        let extra = self.increment.saturating_mul(attempt.saturating_sub(1));
        (self.base + extra).min(self.max_delay)
    }

    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

/// delay = const
#[derive(Debug, Clone, Copy)]
pub struct FixedDelay {
    pub delay: Duration,
    pub max_attempts: u32,
}

impl Default for FixedDelay {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(500),
            max_attempts: 3,
        }
    }
}

impl RetryPolicy for FixedDelay {
    fn retry_delay(&self, _attempt: u32) -> Duration {
        self.delay
    }

    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

/// Run `f` up to `policy.max_attempts()` times, sleeping `policy.retry_delay`
/// between attempts. Returns as soon as `f` succeeds; stops immediately (no
/// further attempts) once `should_retry` says no.
pub async fn execute_with_retry<F, Fut, T>(policy: &dyn RetryPolicy, mut f: F) -> Result<T, Error>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut attempt = 1;
    loop {
        match f(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !policy.should_retry(&err, attempt) {
                    return Err(err);
                }
                tokio::time::sleep(policy.retry_delay(attempt)).await;
                attempt += 1;
            }
        }
    }
}
