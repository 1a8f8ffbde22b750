//! Retry policy: exponential backoff with a cap and full jitter.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Backoff configuration and per-phase counters.
///
/// `delay(n) = min(initial_delay * multiplier^n, max_backoff)`, then
/// full-jittered to `uniform(0, delay(n))`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(
        max_retries: u32,
        initial_delay: Duration,
        multiplier: f64,
        max_backoff: Duration,
    ) -> Self {
        Self {
            max_retries,
            initial_delay,
            multiplier,
            max_backoff,
        }
    }

    /// The unjittered delay bound for retry attempt `n` (0-based).
    pub fn delay_bound(&self, n: u32) -> Duration {
        let scaled = self.initial_delay.as_secs_f64() * self.multiplier.powi(n as i32);
        let capped = scaled.min(self.max_backoff.as_secs_f64()).max(0.0);
        Duration::from_secs_f64(capped)
    }

    /// Full-jittered delay for retry attempt `n`: `uniform(0, delay_bound(n))`.
    ///
    /// Entropy comes from system-time subsec-nanos rather than a `rand`
    /// dependency, scaled across the whole bound to produce a full jitter
    /// in `[0, delay_bound(n)]`.
    pub fn jittered_delay(&self, n: u32) -> Duration {
        let bound = self.delay_bound(n);
        if bound.is_zero() {
            return bound;
        }
        let fraction = subsec_fraction();
        Duration::from_secs_f64(bound.as_secs_f64() * fraction)
    }
}

fn subsec_fraction() -> f64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    (nanos as f64) / (1_000_000_000_f64)
}

/// Tracks retry attempts for a single phase (connect, authenticate,
/// create_tunnel), resetting on success.
#[derive(Debug, Default)]
pub struct RetryCounter {
    attempts: u32,
}

impl RetryCounter {
    pub fn new() -> Self {
        Self { attempts: 0 }
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Record a failed attempt; returns `Some(delay)` to wait before the
    /// next attempt, or `None` if the retry budget is exhausted.
    pub fn next_delay(&mut self, policy: &RetryPolicy) -> Option<Duration> {
        if self.attempts >= policy.max_retries {
            return None;
        }
        let delay = policy.jittered_delay(self.attempts);
        self.attempts += 1;
        Some(delay)
    }
}
