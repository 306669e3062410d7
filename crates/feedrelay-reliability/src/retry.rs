//! Exponential backoff between retry attempts.
//!
//! The wait after failed attempt `n` (1-based) is `2^n * base_delay`, capped
//! at `max_delay`. With a one second base the waits run 2s, 4s, 8s, 16s.
//! Optional jitter spreads retries from many callers apart; it is off by
//! default so the schedule stays predictable.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Backoff schedule shared by retrying stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Unit multiplied by `2^attempt`.
    pub base_delay: Duration,

    /// Upper bound for any single wait.
    pub max_delay: Duration,

    /// Jitter fraction (0.0 to 1.0) applied to each wait.
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter_factor: 0.0,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy without jitter.
    pub const fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self { base_delay, max_delay, jitter_factor: 0.0 }
    }

    /// Enables jitter of `±factor` around each wait.
    #[must_use]
    pub const fn with_jitter(mut self, factor: f64) -> Self {
        self.jitter_factor = factor;
        self
    }

    /// Wait before the attempt following failed attempt `attempt`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(20);
        let multiplier = 2_u32.saturating_pow(exponent);
        let delay = self.base_delay.saturating_mul(multiplier).min(self.max_delay);

        apply_jitter(delay, self.jitter_factor).min(self.max_delay)
    }
}

/// Randomizes `duration` by `±jitter_factor`.
fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 {
        return duration;
    }

    let clamped = jitter_factor.clamp(0.0, 1.0);
    let range = duration.as_secs_f64() * clamped;
    let offset = rand::rng().random_range(-range..=range);

    Duration::from_secs_f64((duration.as_secs_f64() + offset).max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn waits_double_per_attempt() {
        let policy = RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(60));

        assert_eq!(policy.delay_after(1), Duration::from_secs(2));
        assert_eq!(policy.delay_after(2), Duration::from_secs(4));
        assert_eq!(policy.delay_after(3), Duration::from_secs(8));
        assert_eq!(policy.delay_after(4), Duration::from_secs(16));
    }

    #[test]
    fn waits_capped_at_max_delay() {
        let policy = RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(10));

        assert_eq!(policy.delay_after(4), Duration::from_secs(10));
        assert_eq!(policy.delay_after(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy =
            RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(60)).with_jitter(0.25);

        for _ in 0..100 {
            let delay = policy.delay_after(3);
            assert!(delay >= Duration::from_secs(6));
            assert!(delay <= Duration::from_secs(10));
        }
    }

    #[test]
    fn zero_jitter_is_exact() {
        assert_eq!(apply_jitter(Duration::from_millis(1500), 0.0), Duration::from_millis(1500));
    }
}
