use concord_core::ConcordConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry behaviour for transient tool errors within one iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries per tool call before the iteration gives up on it.
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub backoff_base_ms: u64,
    /// Maximum delay in milliseconds (cap for exponential backoff).
    pub backoff_max_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff_base_ms: 50,
            backoff_max_ms: 2_000,
        }
    }
}

impl RetryPolicy {
    /// Policy derived from the engine configuration.
    pub fn from_config(config: &ConcordConfig) -> Self {
        Self {
            max_retries: config.tool_retry_limit,
            ..Self::default()
        }
    }

    /// Exponential backoff for `attempt`, capped at `backoff_max_ms`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let delay = self
            .backoff_base_ms
            .saturating_mul(2u64.saturating_pow(attempt));
        Duration::from_millis(delay.min(self.backoff_max_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_exponential_and_capped() {
        let policy = RetryPolicy {
            max_retries: 5,
            backoff_base_ms: 100,
            backoff_max_ms: 1_000,
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(800));
        assert_eq!(policy.backoff(4), Duration::from_millis(1_000));
        assert_eq!(policy.backoff(60), Duration::from_millis(1_000));
    }

    #[test]
    fn test_from_config() {
        let config = ConcordConfig {
            tool_retry_limit: 7,
            ..ConcordConfig::default()
        };
        assert_eq!(RetryPolicy::from_config(&config).max_retries, 7);
    }
}
