use std::time::Duration;

use crate::config::EngineConfig;

/// Retry budget and exponential backoff for agent attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after the first one.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for RetryPolicy {
    fn from(config: &EngineConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: config.base_backoff(),
            max_delay: config.max_backoff(),
        }
    }
}

impl RetryPolicy {
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before retry number `retry` (0-based): `base * 2^retry`, capped.
    pub fn compute_delay(&self, retry: u32) -> Duration {
        let delay = self
            .base_delay
            .saturating_mul(1u32.checked_shl(retry).unwrap_or(u32::MAX));
        delay.min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_until_capped() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(3),
        };
        assert_eq!(policy.compute_delay(0), Duration::from_millis(500));
        assert_eq!(policy.compute_delay(1), Duration::from_millis(1000));
        assert_eq!(policy.compute_delay(2), Duration::from_millis(2000));
        assert_eq!(policy.compute_delay(3), Duration::from_secs(3));
        assert_eq!(policy.compute_delay(40), Duration::from_secs(3));
    }

    #[test]
    fn default_budget_is_three_attempts() {
        assert_eq!(RetryPolicy::default().max_attempts(), 3);
    }
}
