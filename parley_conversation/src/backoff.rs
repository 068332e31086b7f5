use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff policy for resubscribing to the push feed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackoffPolicy {
    /// First delay in milliseconds
    #[serde(default = "BackoffPolicy::default_initial_ms")]
    pub initial_ms: u64,
    /// Upper bound for the un-jittered delay in milliseconds
    #[serde(default = "BackoffPolicy::default_max_ms")]
    pub max_ms: u64,
    /// Relative jitter applied to each delay, e.g. `0.2` for ±20%
    #[serde(default = "BackoffPolicy::default_jitter")]
    pub jitter: f64,
}

impl BackoffPolicy {
    const fn default_initial_ms() -> u64 {
        1_000
    }

    const fn default_max_ms() -> u64 {
        30_000
    }

    const fn default_jitter() -> f64 {
        0.2
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_ms: Self::default_initial_ms(),
            max_ms: Self::default_max_ms(),
            jitter: Self::default_jitter(),
        }
    }
}

/// Stateful delay schedule: doubles from `initial_ms` up to `max_ms`.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
}

impl Backoff {
    #[must_use]
    pub const fn new(policy: BackoffPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Number of delays handed out since the last reset.
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    pub const fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Delay before the next attempt, before jitter.
    #[must_use]
    pub fn base_delay(&self) -> Duration {
        let factor = 1_u64.checked_shl(self.attempt.min(32)).unwrap_or(u64::MAX);
        let millis = self
            .policy
            .initial_ms
            .saturating_mul(factor)
            .min(self.policy.max_ms);
        Duration::from_millis(millis)
    }

    /// Delay to wait now; advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.base_delay();
        self.attempt = self.attempt.saturating_add(1);

        let jitter = self.policy.jitter.clamp(0.0, 1.0);
        if jitter <= 0.0 {
            return base;
        }
        let factor = rand::rng().random_range((1.0 - jitter)..=(1.0 + jitter));
        base.mul_f64(factor)
    }
}
