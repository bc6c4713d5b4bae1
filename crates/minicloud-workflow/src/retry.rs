//! Activity retry policy.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Exponential backoff applied to retryable activity failures.
///
/// The delay before attempt `n + 1` is `base * factor^(n - 1)`, capped at
/// `max_delay`. With the defaults that is 1s, 2s, 4s, 8s between five
/// attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay after the first failure.
    #[serde(with = "duration_ms")]
    pub base_delay: Duration,
    /// Growth factor between consecutive delays.
    pub factor: u32,
    /// Upper bound on any single delay.
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            factor: 2,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// A single attempt, no retries.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            factor: 1,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay to wait after `attempt` (1-based) failed, or `None` if that was
    /// the last attempt.
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let multiplier = self.factor.checked_pow(attempt - 1).unwrap_or(u32::MAX);
        let delay = self
            .base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay);
        Some(delay.min(self.max_delay))
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
