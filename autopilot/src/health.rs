//! Periodic liveness probe over every registered session.
//!
//! The monitor only observes and reports. A stuck session gets its probe
//! flagged so the controller's own wait loop fails the in-flight send; the
//! recovery layer decides what happens next.

use std::collections::BTreeMap;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::core::health::{HealthRecord, HealthTransition};
use crate::core::types::{SessionId, SessionState};
use crate::io::config::HealthConfig;
use crate::io::telemetry::{DriverEvent, SharedSink};
use crate::registry::SessionRegistry;
use crate::session::SessionProbe;

/// What one probe concluded about one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeVerdict {
    Healthy,
    /// Busy past the grace window with no screen growth.
    Stuck { busy_for: Duration },
    /// Process gone while the session was not stopped.
    Offline,
    /// Stopped sessions are not probed.
    Skipped,
}

#[derive(Debug, Clone)]
struct Tracked {
    record: HealthRecord,
    seen_bytes: u64,
    last_growth_at: Instant,
}

pub struct HealthMonitor {
    registry: Arc<SessionRegistry>,
    config: HealthConfig,
    events: SharedSink,
    tracked: Mutex<BTreeMap<SessionId, Tracked>>,
}

impl HealthMonitor {
    pub fn new(registry: Arc<SessionRegistry>, config: HealthConfig, events: SharedSink) -> Self {
        Self {
            registry,
            config,
            events,
            tracked: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn record(&self, id: &SessionId) -> Option<HealthRecord> {
        self.tracked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .map(|tracked| tracked.record.clone())
    }

    /// Probe every registered session once.
    pub fn probe_all(&self, now: Instant) -> Vec<(SessionId, ProbeVerdict)> {
        let probes = self.registry.probes();
        let mut tracked = self.tracked.lock().unwrap_or_else(PoisonError::into_inner);
        tracked.retain(|id, _| probes.iter().any(|probe| probe.id() == id));

        probes
            .iter()
            .map(|probe| {
                let entry = tracked.entry(probe.id().clone()).or_insert_with(|| Tracked {
                    record: HealthRecord::default(),
                    seen_bytes: 0,
                    last_growth_at: now,
                });
                (probe.id().clone(), self.probe_one(probe, entry, now))
            })
            .collect()
    }

    fn probe_one(&self, probe: &SessionProbe, tracked: &mut Tracked, now: Instant) -> ProbeVerdict {
        let snapshot = probe.snapshot();
        if snapshot.total_bytes != tracked.seen_bytes {
            tracked.seen_bytes = snapshot.total_bytes;
            tracked.last_growth_at = now;
        }
        if snapshot.state == SessionState::Stopped {
            return ProbeVerdict::Skipped;
        }

        let at = Utc::now();
        if !probe.is_alive() {
            let transition = tracked.record.mark_offline("process not alive", at);
            if transition.is_some() {
                warn!(session = %probe.id(), "session offline");
                self.request_recovery(probe.id(), "process not alive");
            }
            self.report(probe.id(), transition, &tracked.record);
            return ProbeVerdict::Offline;
        }

        let stuck_after = self.config.stuck_after();
        let busy_for = snapshot
            .busy_since
            .filter(|_| snapshot.state == SessionState::Busy)
            .map(|since| now.saturating_duration_since(since));
        let silent_for = now.saturating_duration_since(tracked.last_growth_at);
        let stuck = busy_for.filter(|busy| *busy >= stuck_after && silent_for >= stuck_after);
        if let Some(busy_for) = stuck {
            let reason = format!("busy for {busy_for:?} without screen output");
            let transition = tracked.record.record_failure(reason.clone(), at);
            if !probe.is_flagged() {
                warn!(session = %probe.id(), ?busy_for, "session stuck");
                probe.flag_stuck();
                self.request_recovery(probe.id(), &reason);
            }
            self.report(probe.id(), transition, &tracked.record);
            return ProbeVerdict::Stuck { busy_for };
        }

        let transition = tracked.record.record_success(at);
        self.report(probe.id(), transition, &tracked.record);
        ProbeVerdict::Healthy
    }

    fn request_recovery(&self, session: &SessionId, reason: &str) {
        self.events.emit(&DriverEvent::RecoveryRequested {
            session: session.clone(),
            reason: reason.to_string(),
        });
    }

    fn report(&self, session: &SessionId, transition: Option<HealthTransition>, record: &HealthRecord) {
        let Some(HealthTransition { from, to }) = transition else {
            return;
        };
        info!(session = %session, %from, %to, "health changed");
        self.events.emit(&DriverEvent::HealthChanged {
            session: session.clone(),
            from,
            to,
            error: record.last_error.clone(),
        });
    }

    /// Probe on a fixed interval until `stop` is cancelled.
    pub fn spawn(self: Arc<Self>, stop: CancelToken) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("health-monitor".to_string())
            .spawn(move || {
                debug!(interval = ?self.config.interval(), "health monitor started");
                while !stop.wait_timeout(self.config.interval()) {
                    self.probe_all(Instant::now());
                }
                debug!("health monitor stopped");
            })
    }
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
