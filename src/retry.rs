//! Bounded retries with exponential backoff.

use std::future::Future;
use std::time::Duration;

use crate::error::MarketError;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);

/// Delay schedule between attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    Fixed { delay: Duration },
    /// `base * 2^(retry - 1)`, capped at `max`, optionally jittered by +/- 50%.
    Exponential {
        base: Duration,
        max: Duration,
        jitter: bool,
    },
}

impl Backoff {
    /// Delay before attempt `attempt` (1-indexed). The first attempt never waits.
    pub fn delay_before(self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        match self {
            Backoff::Fixed { delay } => delay,
            Backoff::Exponential { base, max, jitter } => {
                let exponent = (attempt - 2).min(31) as i32;
                let seconds = (base.as_secs_f64() * 2f64.powi(exponent)).min(max.as_secs_f64());
                let delay = Duration::from_secs_f64(seconds);
                if jitter {
                    let half = (delay.as_millis() / 2) as u64;
                    let offset = fastrand::u64(0..=half * 2);
                    let total = delay.as_millis() as u64 + offset - half;
                    Duration::from_millis(total)
                } else {
                    delay
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(DEFAULT_MAX_ATTEMPTS, DEFAULT_BASE_DELAY)
    }
}

impl RetryPolicy {
    pub fn exponential(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: Backoff::Exponential {
                base: base_delay,
                max: DEFAULT_MAX_DELAY,
                jitter: false,
            },
        }
    }

    pub fn with_jitter(mut self) -> Self {
        if let Backoff::Exponential { jitter, .. } = &mut self.backoff {
            *jitter = true;
        }
        self
    }

    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::Fixed {
                delay: Duration::ZERO,
            },
        }
    }

    /// Run `operation` until it succeeds, fails terminally or runs out of attempts.
    ///
    /// Terminal errors are returned untouched after one attempt. Running out of
    /// attempts on transient errors yields `RetryExhausted` with the last cause.
    pub async fn execute<T, F, Fut>(&self, label: &str, mut operation: F) -> Result<T, MarketError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, MarketError>>,
    {
        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        log::info!("[RetryPolicy::execute] {label} succeeded on attempt {attempt}");
                    }
                    return Ok(value);
                }
                Err(err) if !err.is_transient() => return Err(err),
                Err(err) if attempt >= self.max_attempts => {
                    log::warn!(
                        "[RetryPolicy::execute] {label} failed after {attempt} attempts: {err}"
                    );
                    return Err(MarketError::RetryExhausted {
                        attempts: attempt,
                        last: Box::new(err),
                    });
                }
                Err(err) => {
                    attempt += 1;
                    let delay = self.backoff.delay_before(attempt);
                    log::warn!(
                        "[RetryPolicy::execute] {label} attempt {} failed: {err}. Retrying in {:?}",
                        attempt - 1,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
