//! Single-retry policy for transient failures.
//!
//! Collaborator calls and webhook 5xx responses get exactly one more attempt.
//! Only the pause before that attempt is configurable.

use std::time::Duration;

use serde::Serialize;

/// First try plus one retry
pub const MAX_ATTEMPTS: u32 = 2;

const DEFAULT_DELAY_MS: u64 = 250;

/// Retry once after a fixed pause
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RetryPolicy {
    delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            delay_ms: DEFAULT_DELAY_MS,
        }
    }
}

impl RetryPolicy {
    pub fn once_after(delay: Duration) -> Self {
        Self {
            delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
        }
    }

    pub fn from_delay_ms(delay_ms: u64) -> Self {
        Self { delay_ms }
    }

    /// Pause before the retry
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    /// Whether another attempt follows attempt number `attempt` (1-indexed)
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < MAX_ATTEMPTS
    }
}
