//! Shared session-level types.
//!
//! These types define stable contracts between the controller, the health
//! monitor and telemetry consumers. They carry no behavior beyond display and
//! small predicates.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Explicit identifier for one logical session (one child process lineage).
///
/// All mutable multi-session state is keyed by this value; there is no
/// implicit "current session".
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Lifecycle state of a session controller.
///
/// `Stopped` is both the initial state and the terminal state after `stop()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Starting,
    Ready,
    Busy,
    Error,
    Stopped,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Starting => "starting",
            SessionState::Ready => "ready",
            SessionState::Busy => "busy",
            SessionState::Error => "error",
            SessionState::Stopped => "stopped",
        }
    }

    /// Whether the controller currently owns a child process it expects to be alive.
    pub fn expects_process(self) -> bool {
        matches!(
            self,
            SessionState::Starting | SessionState::Ready | SessionState::Busy
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the screen analyzer infers about the driven CLI right now.
///
/// Always derived from the live screen and the quiet time; never stored as
/// the source of truth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessState {
    Busy,
    WaitingForPermission,
    Ready,
}

impl fmt::Display for ReadinessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ReadinessState::Busy => "busy",
            ReadinessState::WaitingForPermission => "waiting_for_permission",
            ReadinessState::Ready => "ready",
        };
        f.write_str(label)
    }
}
