//! Per-session health records.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Consecutive failures before a record reads `failing`.
pub const FAILING_AFTER: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Failing,
    Offline,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Failing => "failing",
            HealthStatus::Offline => "offline",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthTransition {
    pub from: HealthStatus,
    pub to: HealthStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthRecord {
    pub status: HealthStatus,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub last_checked_at: Option<DateTime<Utc>>,
}

impl Default for HealthRecord {
    fn default() -> Self {
        Self {
            status: HealthStatus::Healthy,
            consecutive_failures: 0,
            last_error: None,
            last_checked_at: None,
        }
    }
}

impl HealthRecord {
    /// Any success resets to healthy.
    pub fn record_success(&mut self, at: DateTime<Utc>) -> Option<HealthTransition> {
        self.consecutive_failures = 0;
        self.last_error = None;
        self.last_checked_at = Some(at);
        self.set(HealthStatus::Healthy)
    }

    pub fn record_failure(
        &mut self,
        error: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Option<HealthTransition> {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_error = Some(error.into());
        self.last_checked_at = Some(at);
        let status = if self.consecutive_failures >= FAILING_AFTER {
            HealthStatus::Failing
        } else {
            HealthStatus::Degraded
        };
        self.set(status)
    }

    /// The process is gone.
    pub fn mark_offline(
        &mut self,
        error: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Option<HealthTransition> {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_error = Some(error.into());
        self.last_checked_at = Some(at);
        self.set(HealthStatus::Offline)
    }

    fn set(&mut self, to: HealthStatus) -> Option<HealthTransition> {
        let from = self.status;
        self.status = to;
        (from != to).then_some(HealthTransition { from, to })
    }
}
