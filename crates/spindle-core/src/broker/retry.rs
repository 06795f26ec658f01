//! Retry policy: decides backoff delays.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Exponential backoff with a cap and multiplicative jitter.
///
/// The raw delay for a message that has already been retried `n` times is
/// `min(max_delay, base_delay * multiplier^n)`. Jitter then shortens it by a
/// random fraction in `[0, jitter)`, which spreads out retries of tasks that
/// failed together.
///
/// Example with base_delay=5s, multiplier=2.0 and no jitter:
/// - first failure (retried=0): 5s
/// - retried=1: 10s
/// - retried=2: 20s
/// - ... until `max_delay`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    #[serde(rename = "base_delay_ms", with = "crate::config::duration_ms")]
    pub base_delay: Duration,

    pub multiplier: f64,

    /// Upper bound for any single delay.
    #[serde(rename = "max_delay_ms", with = "crate::config::duration_ms")]
    pub max_delay: Duration,

    /// Fraction in `[0, 1]`. Zero makes delays deterministic.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            multiplier: 2.0,
            max_delay: Duration::from_secs(3600),
            jitter: 0.5,
        }
    }
}

impl RetryPolicy {
    /// Same growth, no randomness.
    pub fn deterministic(base_delay: Duration, multiplier: f64) -> Self {
        Self {
            base_delay,
            multiplier,
            jitter: 0.0,
            ..Self::default()
        }
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before the next attempt of a message that has been retried
    /// `retried` times so far.
    pub fn next_delay(&self, retried: u32) -> Duration {
        self.next_delay_with(retried, rand::random::<f64>())
    }

    /// [`Self::next_delay`] with the random draw supplied by the caller.
    /// `sample` is expected in `[0, 1)`.
    pub fn next_delay_with(&self, retried: u32, sample: f64) -> Duration {
        let exponent = i32::try_from(retried).unwrap_or(i32::MAX);
        let raw = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = raw.min(self.max_delay.as_secs_f64());
        let capped = if capped.is_finite() {
            capped.max(0.0)
        } else {
            self.max_delay.as_secs_f64()
        };

        let jitter = self.jitter.clamp(0.0, 1.0) * sample.clamp(0.0, 1.0);
        Duration::from_secs_f64(capped * (1.0 - jitter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn default_policy_has_reasonable_values() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.base_delay, Duration::from_secs(5));
        assert_eq!(policy.multiplier, 2.0);
        assert_eq!(policy.max_delay, Duration::from_secs(3600));
        assert_eq!(policy.jitter, 0.5);
    }

    #[rstest]
    #[case(0, 5)]
    #[case(1, 10)]
    #[case(2, 20)]
    #[case(3, 40)]
    fn exponential_backoff_increases(#[case] retried: u32, #[case] expected_secs: u64) {
        let policy = RetryPolicy::deterministic(Duration::from_secs(5), 2.0);
        assert_eq!(policy.next_delay(retried), Duration::from_secs(expected_secs));
    }

    #[rstest]
    #[case(10)]
    #[case(25)]
    #[case(u32::MAX)]
    fn delay_never_exceeds_cap(#[case] retried: u32) {
        let policy = RetryPolicy::default();
        assert!(policy.next_delay(retried) <= policy.max_delay);
        assert_eq!(policy.next_delay_with(retried, 0.0), policy.max_delay);
    }

    #[test]
    fn jitter_only_shortens_the_delay() {
        let policy = RetryPolicy::default();
        let full = policy.next_delay_with(2, 0.0);
        let shortest = policy.next_delay_with(2, 0.999_999);

        assert_eq!(full, Duration::from_secs(20));
        assert!(shortest >= Duration::from_secs(10));
        assert!(shortest < full);
        for _ in 0..100 {
            let d = policy.next_delay(2);
            assert!(d > Duration::from_secs(10) - Duration::from_millis(1) && d <= full);
        }
    }

    #[test]
    fn deserializes_with_defaults_for_missing_fields() {
        let policy: RetryPolicy =
            serde_json::from_str(r#"{"base_delay_ms": 250, "jitter": 0.0}"#).unwrap();
        assert_eq!(policy.base_delay, Duration::from_millis(250));
        assert_eq!(policy.multiplier, 2.0);
        assert_eq!(policy.next_delay(1), Duration::from_millis(500));
    }
}
