//! Exponential back-off with jitter.
//!
//! [`BackoffPolicy`] drives every retry in the crate: the pipeline's retry
//! stage, the reconnection state machine and the client-side
//! [`retry_with_backoff`](crate::retry::retry_with_backoff) helper.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Configuration for exponential back-off between retry attempts.
///
/// Attempt `0` is the first retry. It fires immediately when
/// `immediate_first_retry` is set; otherwise every attempt `n` waits
/// `initial_delay * multiplier^n`, capped at `max_delay`. Jitter then moves the
/// delay down by up to `jitter_down` or up by up to `jitter_up` (fractions of
/// the computed delay).
///
/// # Default Values
/// - `initial_delay`: 5 seconds
/// - `multiplier`: 2
/// - `max_delay`: 60 seconds
/// - `failure_timeout`: 300 seconds
/// - `jitter_up`: 0.25, `jitter_down`: 0.5
/// - `immediate_first_retry`: true
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    /// Delay before the first delayed retry.
    pub initial_delay: Duration,
    /// Growth factor applied per attempt.
    pub multiplier: u32,
    /// Ceiling for the pre-jitter delay.
    pub max_delay: Duration,
    /// Total time after the first attempt past which retrying is abandoned.
    pub failure_timeout: Duration,
    /// Largest upward jitter as a fraction of the delay.
    pub jitter_up: f64,
    /// Largest downward jitter as a fraction of the delay.
    pub jitter_down: f64,
    /// Retry once without waiting before backing off.
    pub immediate_first_retry: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            multiplier: 2,
            max_delay: Duration::from_secs(60),
            failure_timeout: Duration::from_secs(300),
            jitter_up: 0.25,
            jitter_down: 0.5,
            immediate_first_retry: true,
        }
    }
}

impl BackoffPolicy {
    /// Clamp the policy to sane bounds.
    ///
    /// Zero delays are raised to one millisecond, `initial_delay` is kept at or
    /// below `max_delay`, the multiplier is at least one and jitter fractions
    /// stay within `[0, 1]`.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::time::Duration;
    ///
    /// use hubwire::backoff::BackoffPolicy;
    ///
    /// let policy = BackoffPolicy {
    ///     initial_delay: Duration::from_secs(90),
    ///     max_delay: Duration::from_secs(30),
    ///     ..BackoffPolicy::default()
    /// }
    /// .normalized();
    /// assert_eq!(policy.initial_delay, Duration::from_secs(30));
    /// assert_eq!(policy.max_delay, Duration::from_secs(90));
    /// ```
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.initial_delay = self.initial_delay.max(Duration::from_millis(1));
        self.max_delay = self.max_delay.max(Duration::from_millis(1));
        if self.initial_delay > self.max_delay {
            std::mem::swap(&mut self.initial_delay, &mut self.max_delay);
        }
        self.multiplier = self.multiplier.max(1);
        self.jitter_up = clamp_fraction(self.jitter_up);
        self.jitter_down = clamp_fraction(self.jitter_down);
        self
    }

    /// Return a copy whose first delayed retry waits `initial_delay`.
    #[must_use]
    pub fn with_initial_delay(mut self, initial_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self.normalized()
    }

    /// Pre-jitter delay for retry `attempt` (zero based).
    ///
    /// Non-decreasing in `attempt` and never above `max_delay`.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = if self.immediate_first_retry {
            match attempt.checked_sub(1) {
                Some(exponent) => exponent,
                None => return Duration::ZERO,
            }
        } else {
            attempt
        };
        let factor = self.multiplier.max(1).checked_pow(exponent).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Jittered delay for retry `attempt`.
    #[must_use]
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        self.apply_jitter(self.delay(attempt), &mut rand::thread_rng())
    }

    /// Widen or narrow `delay` by a random fraction within the jitter bounds.
    pub fn apply_jitter<R: Rng + ?Sized>(&self, delay: Duration, rng: &mut R) -> Duration {
        if delay.is_zero() {
            return delay;
        }
        let lower = 1.0 - clamp_fraction(self.jitter_down);
        let upper = 1.0 + clamp_fraction(self.jitter_up);
        if upper <= lower {
            return delay.mul_f64(lower);
        }
        delay.mul_f64(rng.gen_range(lower..=upper))
    }

    /// Whether a retry is still allowed `elapsed` after the first attempt.
    #[must_use]
    pub fn within_budget(&self, elapsed: Duration) -> bool { elapsed < self.failure_timeout }
}

fn clamp_fraction(value: f64) -> f64 {
    if value.is_nan() { 0.0 } else { value.clamp(0.0, 1.0) }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use rand::{SeedableRng, rngs::StdRng};
    use rstest::rstest;

    use super::*;

    fn policy() -> BackoffPolicy {
        BackoffPolicy {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            ..BackoffPolicy::default()
        }
    }

    #[rstest]
    #[case::immediate(0, 0)]
    #[case::first_delayed(1, 5)]
    #[case::second(2, 10)]
    #[case::third(3, 20)]
    #[case::fourth(4, 40)]
    #[case::capped(5, 60)]
    #[case::far_out(40, 60)]
    fn delays_grow_exponentially(#[case] attempt: u32, #[case] secs: u64) {
        assert_eq!(policy().delay(attempt), Duration::from_secs(secs));
    }

    #[test]
    fn without_immediate_retry_first_delay_is_initial() {
        let policy = BackoffPolicy {
            immediate_first_retry: false,
            ..policy()
        };
        assert_eq!(policy.delay(0), Duration::from_secs(5));
        assert_eq!(policy.delay(1), Duration::from_secs(10));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = policy();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let jittered = policy.apply_jitter(Duration::from_secs(40), &mut rng);
            assert!(jittered >= Duration::from_secs(20), "{jittered:?} below bound");
            assert!(jittered <= Duration::from_secs(50), "{jittered:?} above bound");
        }
    }

    #[test]
    fn normalized_repairs_degenerate_values() {
        let policy = BackoffPolicy {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 0,
            jitter_up: f64::NAN,
            jitter_down: 4.0,
            ..BackoffPolicy::default()
        }
        .normalized();
        assert_eq!(policy.initial_delay, Duration::from_millis(1));
        assert_eq!(policy.multiplier, 1);
        assert!(policy.jitter_up.abs() < f64::EPSILON);
        assert!((policy.jitter_down - 1.0).abs() < f64::EPSILON);
    }

    proptest! {
        #[test]
        fn pre_jitter_delay_is_monotonic_and_capped(
            initial_ms in 1u64..10_000,
            max_ms in 1u64..600_000,
            multiplier in 1u32..8,
            attempts in 1u32..64,
        ) {
            let policy = BackoffPolicy {
                initial_delay: Duration::from_millis(initial_ms),
                max_delay: Duration::from_millis(max_ms),
                multiplier,
                ..BackoffPolicy::default()
            }
            .normalized();
            let mut previous = Duration::ZERO;
            for attempt in 0..attempts {
                let delay = policy.delay(attempt);
                prop_assert!(delay >= previous);
                prop_assert!(delay <= policy.max_delay);
                previous = delay;
            }
        }
    }
}
