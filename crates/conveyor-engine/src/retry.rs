use rand::Rng;
use serde::{Deserialize, Serialize};

/// Retry behaviour for transient infrastructure errors during dispatch
/// and pipeline execution.
///
/// Permanent errors (billing, unknown tool/agent, agent-reported
/// failures) are never retried; the classification lives on
/// [`conveyor_core::ConveyorError::is_transient`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Cap in milliseconds for the exponential delay.
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Upper bound of the uniform jitter added to every delay.
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    500
}
fn default_backoff_max_ms() -> u64 {
    30_000
}
fn default_jitter_ms() -> u64 {
    250
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            jitter_ms: default_jitter_ms(),
        }
    }
}

impl RetryPolicy {
    /// A policy that never waits and never retries, for tests.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            backoff_base_ms: 0,
            backoff_max_ms: 0,
            jitter_ms: 0,
        }
    }

    /// Exponential delay for `attempt` (0-based), capped at the maximum.
    pub fn backoff(&self, attempt: u32) -> u64 {
        self.backoff_base_ms
            .saturating_mul(2u64.saturating_pow(attempt))
            .min(self.backoff_max_ms)
    }

    /// Backoff plus uniform jitter, the delay actually slept.
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.jitter_ms)
        };
        self.backoff(attempt).saturating_add(jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            jitter_ms: 0,
        };
        assert_eq!(policy.backoff(0), 500);
        assert_eq!(policy.backoff(1), 1000);
        assert_eq!(policy.backoff(2), 2000);
        assert_eq!(policy.backoff(3), 4000);
        assert_eq!(policy.backoff(6), 30_000);
        assert_eq!(policy.backoff(63), 30_000);
    }

    #[test]
    fn jitter_stays_within_bound() {
        let policy = RetryPolicy {
            max_retries: 3,
            backoff_base_ms: 100,
            backoff_max_ms: 1000,
            jitter_ms: 50,
        };
        for attempt in 0..4 {
            let base = policy.backoff(attempt);
            for _ in 0..32 {
                let delay = policy.delay_ms(attempt);
                assert!(delay >= base && delay <= base + 50);
            }
        }
    }

    #[test]
    fn none_policy_is_instant() {
        let policy = RetryPolicy::none();
        assert_eq!(policy.max_retries, 0);
        assert_eq!(policy.delay_ms(0), 0);
        assert_eq!(policy.delay_ms(9), 0);
    }
}
