//! Error taxonomy for the session driver.
//!
//! Library seams return [`DriverError`] so the recovery layer can decide
//! between retry and escalation by variant. Orchestration code and the CLI wrap
//! these in `anyhow` with context.

use std::time::Duration;

use crate::core::types::SessionState;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DriverError {
    #[error("session failed to start: {0}")]
    StartupFailed(String),

    #[error("session did not become ready within {0:?}")]
    StartupTimeout(Duration),

    #[error("write rejected after {attempts} attempt(s): {message}")]
    WriteRejected { attempts: u32, message: String },

    #[error("process input unavailable: {0}")]
    ProcessUnavailable(String),

    #[error("no ready signal within {0:?}")]
    ResponseTimeout(Duration),

    #[error("session stuck: busy for {busy_for:?} without screen output")]
    SessionStuck { busy_for: Duration },

    #[error("process exited unexpectedly (exit code {})", describe_exit(.exit_code))]
    ProcessCrash { exit_code: Option<u32> },

    #[error("circuit open for {operation}; retry in {retry_in:?}")]
    CircuitOpen { operation: String, retry_in: Duration },

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid state: {operation} requires {expected}, session is {actual}")]
    InvalidState {
        operation: &'static str,
        expected: SessionState,
        actual: SessionState,
    },
}

fn describe_exit(code: &Option<u32>) -> String {
    code.map_or_else(|| "unknown".to_string(), |code| code.to_string())
}

impl DriverError {
    /// Whether a restart-and-retry may succeed where this attempt failed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DriverError::StartupFailed(_)
                | DriverError::StartupTimeout(_)
                | DriverError::WriteRejected { .. }
                | DriverError::ProcessUnavailable(_)
                | DriverError::ResponseTimeout(_)
                | DriverError::SessionStuck { .. }
                | DriverError::ProcessCrash { .. }
        )
    }

    /// Whether the in-flight conversation was lost and context should be preserved.
    pub fn lost_session(&self) -> bool {
        matches!(
            self,
            DriverError::ProcessCrash { .. }
                | DriverError::ProcessUnavailable(_)
                | DriverError::SessionStuck { .. }
                | DriverError::ResponseTimeout(_)
        )
    }

    /// Stable short label for telemetry and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            DriverError::StartupFailed(_) => "startup_failed",
            DriverError::StartupTimeout(_) => "startup_timeout",
            DriverError::WriteRejected { .. } => "write_rejected",
            DriverError::ProcessUnavailable(_) => "process_unavailable",
            DriverError::ResponseTimeout(_) => "response_timeout",
            DriverError::SessionStuck { .. } => "session_stuck",
            DriverError::ProcessCrash { .. } => "process_crash",
            DriverError::CircuitOpen { .. } => "circuit_open",
            DriverError::Configuration(_) => "configuration",
            DriverError::Cancelled => "cancelled",
            DriverError::InvalidState { .. } => "invalid_state",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_failures_are_retryable() {
        assert!(DriverError::ProcessCrash { exit_code: Some(1) }.is_retryable());
        assert!(DriverError::ResponseTimeout(Duration::from_secs(1)).is_retryable());
        assert!(!DriverError::Cancelled.is_retryable());
        assert!(!DriverError::Configuration("bad".into()).is_retryable());
        assert!(
            !DriverError::CircuitOpen {
                operation: "send".into(),
                retry_in: Duration::ZERO
            }
            .is_retryable()
        );
    }

    #[test]
    fn crash_message_includes_exit_code() {
        let err = DriverError::ProcessCrash { exit_code: Some(1) };
        assert_eq!(err.to_string(), "process exited unexpectedly (exit code 1)");
        let unknown = DriverError::ProcessCrash { exit_code: None };
        assert!(unknown.to_string().contains("unknown"));
    }
}
