//! Exponential backoff shared by credential refresh, initial connects and
//! per-direction reconnection.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Bounded exponential backoff.
///
/// Defaults: 200ms initial delay, doubling, capped at 2s, at most 5 attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay before the first retry (milliseconds).
    /// Default: 200ms
    pub initial_delay_ms: u64,

    /// Upper bound for any single delay (milliseconds).
    /// Default: 2000ms
    pub max_delay_ms: u64,

    /// Multiplier applied per attempt.
    /// Default: 2.0
    pub multiplier: f32,

    /// Maximum number of attempts, including the first one.
    /// Default: 5
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 200,
            max_delay_ms: 2000,
            multiplier: 2.0,
            max_attempts: 5,
        }
    }
}

impl BackoffPolicy {
    /// A policy that makes a single attempt and never waits.
    pub fn none() -> Self {
        Self {
            initial_delay_ms: 0,
            max_delay_ms: 0,
            multiplier: 1.0,
            max_attempts: 1,
        }
    }

    /// Delay to wait before retry number `attempt` (1-based).
    ///
    /// `initial * multiplier^(attempt-1)`, capped at `max_delay_ms`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.initial_delay_ms as f64;
        let factor = (self.multiplier as f64).powi(attempt.saturating_sub(1) as i32);
        let delay = (base * factor).min(self.max_delay_ms as f64);
        Duration::from_millis(delay as u64)
    }

    /// Whether another attempt is allowed after `attempts_made` attempts.
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts.max(1)
    }
}
