//! Sessions keyed by explicit id.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::core::types::{SessionId, SessionState};
use crate::session::SessionProbe;

/// Probes of every registered session. Shared by the distributor and the
/// health monitor; there is no implicit current session.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<BTreeMap<SessionId, Arc<SessionProbe>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a probe, replacing any previous one with the same id.
    pub fn register(&self, probe: Arc<SessionProbe>) -> Option<Arc<SessionProbe>> {
        let id = probe.id().clone();
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, probe)
    }

    pub fn unregister(&self, id: &SessionId) -> Option<Arc<SessionProbe>> {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
    }

    pub fn get(&self, id: &SessionId) -> Option<Arc<SessionProbe>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// All probes, ordered by id.
    pub fn probes(&self) -> Vec<Arc<SessionProbe>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Sessions whose last published state is `Ready`, i.e. free for work.
    pub fn ready_sessions(&self) -> Vec<SessionId> {
        self.probes()
            .into_iter()
            .filter(|probe| probe.snapshot().state == SessionState::Ready)
            .map(|probe| probe.id().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
