//! Retry, backoff and breaker parameters as one policy value.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::DriverError;

/// Applied uniformly to every guarded operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResiliencePolicy {
    /// Attempts per guarded call, including the first one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
    /// Consecutive failed calls before the breaker opens.
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
}

impl Default for ResiliencePolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            backoff_factor: 2.0,
            max_delay_ms: 30_000,
            failure_threshold: 5,
            reset_timeout_ms: 60_000,
        }
    }
}

impl ResiliencePolicy {
    /// Delay before attempt `attempt` (1-based): `base * factor^(attempt - 1)`, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        backoff_delay(
            Duration::from_millis(self.base_delay_ms),
            self.backoff_factor,
            attempt.saturating_sub(1),
            Duration::from_millis(self.max_delay_ms),
        )
    }

    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), DriverError> {
        if self.max_attempts == 0 {
            return Err(DriverError::Configuration(
                "resilience.max_attempts must be > 0".to_string(),
            ));
        }
        if self.failure_threshold == 0 {
            return Err(DriverError::Configuration(
                "resilience.failure_threshold must be > 0".to_string(),
            ));
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(DriverError::Configuration(
                "resilience.backoff_factor must be a finite number >= 1.0".to_string(),
            ));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(DriverError::Configuration(
                "resilience.max_delay_ms must be >= base_delay_ms".to_string(),
            ));
        }
        Ok(())
    }
}

/// `base * factor^exponent`, capped at `max`.
pub fn backoff_delay(base: Duration, factor: f64, exponent: u32, max: Duration) -> Duration {
    let exponent = i32::try_from(exponent).unwrap_or(i32::MAX);
    let millis = base.as_millis() as f64 * factor.powi(exponent);
    let capped = millis.min(max.as_millis() as f64).max(0.0);
    Duration::from_millis(capped as u64)
}
