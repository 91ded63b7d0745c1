//! Driver events and the sinks that consume them.
//!
//! Events are product output for a UI or log consumer, separate from
//! `tracing` diagnostics. Emission is fire-and-forget: a sink that fails
//! (closed channel, broken pipe) never fails the driver.

use std::io::Write;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::core::breaker::BreakerState;
use crate::core::health::HealthStatus;
use crate::core::task::{TaskId, TaskStatus};
use crate::core::types::{SessionId, SessionState};

/// Serialized as `{"event": "<camelCase name>", "payload": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(
    tag = "event",
    content = "payload",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum DriverEvent {
    /// ANSI-stripped output chunk.
    Output { session: SessionId, text: String },
    StateChanged {
        session: SessionId,
        from: SessionState,
        to: SessionState,
    },
    PermissionRequested {
        session: SessionId,
        pattern: Option<String>,
        auto_approved: bool,
    },
    HealthChanged {
        session: SessionId,
        from: HealthStatus,
        to: HealthStatus,
        error: Option<String>,
    },
    RecoveryRequested { session: SessionId, reason: String },
    RecoveryAttempt {
        session: SessionId,
        attempt: u32,
        max_attempts: u32,
        delay_ms: u64,
    },
    RecoverySucceeded {
        session: SessionId,
        attempts: u32,
        preserved_snippets: usize,
    },
    BreakerChanged {
        operation: String,
        from: BreakerState,
        to: BreakerState,
    },
    TaskUpdated {
        task_id: TaskId,
        status: TaskStatus,
        error: Option<String>,
    },
    /// Full diagnostics for a failed task; the task record only keeps a summary.
    TaskFailed {
        task_id: TaskId,
        kind: String,
        detail: String,
    },
    CheckCompleted {
        task_id: TaskId,
        check_id: String,
        passed: bool,
    },
}

impl DriverEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DriverEvent::Output { .. } => "output",
            DriverEvent::StateChanged { .. } => "stateChanged",
            DriverEvent::PermissionRequested { .. } => "permissionRequested",
            DriverEvent::HealthChanged { .. } => "healthChanged",
            DriverEvent::RecoveryRequested { .. } => "recoveryRequested",
            DriverEvent::RecoveryAttempt { .. } => "recoveryAttempt",
            DriverEvent::RecoverySucceeded { .. } => "recoverySucceeded",
            DriverEvent::BreakerChanged { .. } => "breakerChanged",
            DriverEvent::TaskUpdated { .. } => "taskUpdated",
            DriverEvent::TaskFailed { .. } => "taskFailed",
            DriverEvent::CheckCompleted { .. } => "checkCompleted",
        }
    }
}

/// Consumer of driver events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &DriverEvent);
}

pub type SharedSink = Arc<dyn EventSink>;

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: &DriverEvent) {}
}

/// Forwards events over an mpsc channel. A dropped receiver is ignored.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: Sender<DriverEvent>,
}

impl ChannelSink {
    pub fn new(tx: Sender<DriverEvent>) -> Self {
        Self { tx }
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: &DriverEvent) {
        let _ = self.tx.send(event.clone());
    }
}

/// Bridges events into `tracing`. Output chunks go to `debug`, the rest to `info`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &DriverEvent) {
        let payload = serde_json::to_string(event).unwrap_or_default();
        match event {
            DriverEvent::Output { .. } => debug!(event = event.name(), %payload, "driver event"),
            DriverEvent::TaskFailed { .. } | DriverEvent::RecoveryRequested { .. } => {
                warn!(event = event.name(), %payload, "driver event");
            }
            _ => info!(event = event.name(), %payload, "driver event"),
        }
    }
}

/// Writes one JSON object per line.
pub struct JsonLinesSink<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

impl<W: Write + Send> EventSink for JsonLinesSink<W> {
    fn emit(&self, event: &DriverEvent) {
        let Ok(line) = serde_json::to_string(event) else {
            return;
        };
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        if writeln!(writer, "{line}").and_then(|()| writer.flush()).is_err() {
            debug!(event = event.name(), "event writer closed");
        }
    }
}

/// Delivers every event to each inner sink in order.
#[derive(Clone, Default)]
pub struct FanOutSink {
    sinks: Vec<SharedSink>,
}

impl FanOutSink {
    pub fn new(sinks: Vec<SharedSink>) -> Self {
        Self { sinks }
    }

    pub fn push(&mut self, sink: SharedSink) {
        self.sinks.push(sink);
    }
}

impl EventSink for FanOutSink {
    fn emit(&self, event: &DriverEvent) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn events_serialize_with_tag_and_payload() {
        let event = DriverEvent::StateChanged {
            session: SessionId::from("main"),
            from: SessionState::Busy,
            to: SessionState::Ready,
        };
        let json = serde_json::to_value(&event).expect("json");
        assert_eq!(json["event"], "stateChanged");
        assert_eq!(json["payload"]["session"], "main");
        assert_eq!(json["payload"]["to"], "ready");
        assert_eq!(event.name(), "stateChanged");
    }

    #[test]
    fn payload_fields_are_camel_case() {
        let event = DriverEvent::RecoveryAttempt {
            session: SessionId::from("w1"),
            attempt: 2,
            max_attempts: 3,
            delay_ms: 2000,
        };
        let json = serde_json::to_value(&event).expect("json");
        assert_eq!(json["event"], "recoveryAttempt");
        assert_eq!(json["payload"]["maxAttempts"], 3);
        assert_eq!(json["payload"]["delayMs"], 2000);
    }

    #[test]
    fn fan_out_reaches_every_sink_and_ignores_closed_channels() {
        let (tx_a, rx_a) = mpsc::channel();
        let (tx_b, rx_b) = mpsc::channel();
        drop(rx_b);
        let fan_out = FanOutSink::new(vec![
            Arc::new(ChannelSink::new(tx_b)),
            Arc::new(ChannelSink::new(tx_a)),
        ]);
        fan_out.emit(&DriverEvent::RecoveryRequested {
            session: SessionId::from("main"),
            reason: "stuck".to_string(),
        });
        assert_eq!(rx_a.try_iter().count(), 1);
    }

    #[test]
    fn json_lines_sink_writes_one_line_per_event() {
        let sink = JsonLinesSink::new(Vec::new());
        sink.emit(&DriverEvent::CheckCompleted {
            task_id: 1,
            check_id: "lint".to_string(),
            passed: true,
        });
        let buf = sink.writer.into_inner().expect("lock");
        let text = String::from_utf8(buf).expect("utf8");
        assert_eq!(text.lines().count(), 1);
        assert!(text.contains("\"checkCompleted\""));
        assert!(text.contains("\"checkId\":\"lint\""));
    }
}
