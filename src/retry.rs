//! Centralized bounded-retry policy.
//!
//! Every retryable-soft failure in the executor goes through one policy:
//! max attempts, exponential backoff with a cap, and symmetric jitter.
//! Which outcomes are retryable at all is decided by the failure detector,
//! never here.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Strategy for retrying transient failures with exponential backoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum attempts including the first dispatch.
    pub max_attempts: u32,
    /// Base delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Delay cap for later retries, in milliseconds.
    pub max_delay_ms: u64,
    /// Jitter ratio (0.0..=1.0) applied to each delay.
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::step_default()
    }
}

impl RetryPolicy {
    /// Default policy for driver step dispatch.
    pub fn step_default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
            jitter_ratio: 0.20,
        }
    }

    /// Short policy for display-channel startup (port bind races settle
    /// quickly or not at all).
    pub fn display_default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 250,
            max_delay_ms: 1_000,
            jitter_ratio: 0.0,
        }
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Whether the retry budget still allows another attempt after
    /// `attempt` (1-based) completed.
    pub fn budget_remains(&self, attempt: u32) -> bool {
        attempt < self.max_attempts.max(1)
    }

    /// Exponential backoff delay for the given retry index (1-based).
    pub fn backoff_delay(&self, retry_index: u32) -> Duration {
        let shift = retry_index.saturating_sub(1).min(31);
        let multiplier = 1u32 << shift;
        let base = self
            .base_delay()
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay());
        base.min(self.max_delay())
    }

    /// Apply jitter to a delay using a symmetric random range.
    pub fn with_jitter(&self, delay: Duration) -> Duration {
        if self.jitter_ratio <= 0.0 {
            return delay;
        }
        let ratio = self.jitter_ratio.clamp(0.0, 1.0);
        let millis = delay.as_millis() as f64;
        let spread = millis * ratio;
        let low = (millis - spread).max(0.0);
        let high = millis + spread;
        let sampled = if high <= low {
            low
        } else {
            rand::random::<f64>() * (high - low) + low
        };
        Duration::from_millis(sampled.round() as u64)
    }

    /// Jittered backoff delay for the given retry index (1-based).
    pub fn delay_for(&self, retry_index: u32) -> Duration {
        self.with_jitter(self.backoff_delay(retry_index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay_ms: 100,
            max_delay_ms: 500,
            jitter_ratio: 0.0,
        };
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_delay(3), Duration::from_millis(400));
        assert_eq!(policy.backoff_delay(4), Duration::from_millis(500));
    }

    #[test]
    fn budget_counts_first_attempt() {
        let policy = RetryPolicy {
            max_attempts: 3,
            ..RetryPolicy::step_default()
        };
        assert!(policy.budget_remains(1));
        assert!(policy.budget_remains(2));
        assert!(!policy.budget_remains(3));
    }

    #[test]
    fn jitter_stays_in_range() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 1_000,
            jitter_ratio: 0.5,
        };
        for _ in 0..64 {
            let d = policy.with_jitter(Duration::from_millis(1_000)).as_millis();
            assert!((500..=1_500).contains(&d), "delay {} out of range", d);
        }
    }

    #[test]
    fn zero_jitter_is_identity() {
        let policy = RetryPolicy::display_default();
        assert_eq!(
            policy.with_jitter(Duration::from_millis(250)),
            Duration::from_millis(250)
        );
    }
}
