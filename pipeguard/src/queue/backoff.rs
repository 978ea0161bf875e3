//! Delay before a failed backfill item becomes claimable again.

use crate::config::QueueConfig;
use chrono::Duration;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Backoff strategy for retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// delay = base * 2^(attempt - 1)
    #[default]
    Exponential,
    /// delay = base * attempt
    Linear,
    /// delay = base
    Constant,
}

/// Jitter applied on top of the computed delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// No jitter.
    #[default]
    None,
    /// Half fixed, half random.
    Equal,
}

/// Computes retry delays for queue items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    base_minutes: u64,
    max_minutes: u64,
    strategy: BackoffStrategy,
    jitter: JitterStrategy,
}

impl BackoffPolicy {
    /// Creates an exponential policy without jitter.
    #[must_use]
    pub fn new(base_minutes: u64, max_minutes: u64) -> Self {
        Self {
            base_minutes,
            max_minutes: max_minutes.max(base_minutes),
            strategy: BackoffStrategy::Exponential,
            jitter: JitterStrategy::None,
        }
    }

    /// Builds the policy from queue config.
    #[must_use]
    pub fn from_config(config: &QueueConfig) -> Self {
        Self::new(config.base_backoff_minutes, config.max_backoff_minutes)
    }

    /// Sets the backoff strategy.
    #[must_use]
    pub fn with_strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, jitter: JitterStrategy) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay after the `attempts`-th failure (1-based).
    #[must_use]
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let base = self.base_minutes;
        let max = self.max_minutes;
        let n = attempts.max(1);

        let minutes = match self.strategy {
            BackoffStrategy::Exponential => {
                base.saturating_mul(2u64.saturating_pow(n - 1)).min(max)
            }
            BackoffStrategy::Linear => base.saturating_mul(u64::from(n)).min(max),
            BackoffStrategy::Constant => base.min(max),
        };

        let seconds = minutes.saturating_mul(60);
        let jittered = match self.jitter {
            JitterStrategy::None => seconds,
            JitterStrategy::Equal => {
                let half = seconds / 2;
                if half == 0 {
                    seconds
                } else {
                    half + rand::thread_rng().gen_range(0..=half)
                }
            }
        };

        Duration::seconds(i64::try_from(jittered).unwrap_or(i64::MAX / 1_000))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&QueueConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_capped() {
        let policy = BackoffPolicy::new(15, 240);
        assert_eq!(policy.delay_for(1), Duration::minutes(15));
        assert_eq!(policy.delay_for(2), Duration::minutes(30));
        assert_eq!(policy.delay_for(3), Duration::minutes(60));
        assert_eq!(policy.delay_for(10), Duration::minutes(240));
    }

    #[test]
    fn test_linear_and_constant() {
        let linear = BackoffPolicy::new(10, 100).with_strategy(BackoffStrategy::Linear);
        assert_eq!(linear.delay_for(3), Duration::minutes(30));

        let constant = BackoffPolicy::new(10, 100).with_strategy(BackoffStrategy::Constant);
        assert_eq!(constant.delay_for(5), Duration::minutes(10));
    }

    #[test]
    fn test_equal_jitter_bounds() {
        let policy = BackoffPolicy::new(10, 100).with_jitter(JitterStrategy::Equal);
        for _ in 0..50 {
            let delay = policy.delay_for(1);
            assert!(delay >= Duration::minutes(5));
            assert!(delay <= Duration::minutes(10));
        }
    }
}
