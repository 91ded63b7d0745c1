//! Retry, circuit breaking and session restarts.
//!
//! [`RecoveryManager`] guards named operations with one [`ResiliencePolicy`]:
//! each call passes through that operation's circuit breaker, retries
//! retryable failures with backoff, and records exactly one breaker outcome.
//! [`RecoveringSession`] applies it to a [`SessionController`], restarting
//! lost sessions with their interaction history carried over.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use tracing::{debug, info, instrument, warn};

use crate::core::breaker::{Admission, BreakerState, BreakerTransition, CircuitBreaker};
use crate::core::resilience::ResiliencePolicy;
use crate::core::types::SessionState;
use crate::error::DriverError;
use crate::io::clock::Sleeper;
use crate::io::config::RecoveryConfig;
use crate::io::prompt::PromptEngine;
use crate::io::telemetry::{DriverEvent, SharedSink};
use crate::session::SessionController;

pub const START_OPERATION: &str = "start";
pub const RESTART_OPERATION: &str = "restart";
pub const SEND_OPERATION: &str = "send";

/// Restart bookkeeping for one session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryState {
    pub is_recovering: bool,
    /// Attempts made by the latest restart.
    pub retry_count: u32,
    /// Interaction snippets carried across the latest restart.
    pub preserved_context: Vec<String>,
}

pub struct RecoveryManager {
    policy: ResiliencePolicy,
    sleeper: Arc<dyn Sleeper>,
    events: SharedSink,
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
}

impl RecoveryManager {
    pub fn new(policy: ResiliencePolicy, sleeper: Arc<dyn Sleeper>, events: SharedSink) -> Self {
        Self {
            policy,
            sleeper,
            events,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &ResiliencePolicy {
        &self.policy
    }

    /// Current breaker state; operations never called read as closed.
    pub fn breaker_state(&self, operation: &str) -> BreakerState {
        self.breakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(operation)
            .map_or(BreakerState::Closed, CircuitBreaker::state)
    }

    /// Run `op` through the breaker with retries. `op` receives the 1-based attempt.
    pub fn execute<T>(
        &self,
        operation: &str,
        mut op: impl FnMut(u32) -> Result<T, DriverError>,
    ) -> Result<T, DriverError> {
        self.guard(operation, || self.retry(operation, &mut op))
    }

    /// Like [`RecoveryManager::execute`], falling back when the breaker is
    /// open or the primary fails. If the fallback fails too, the primary's
    /// error is returned.
    pub fn execute_with_fallback<T>(
        &self,
        operation: &str,
        op: impl FnMut(u32) -> Result<T, DriverError>,
        fallback: impl FnOnce() -> Result<T, DriverError>,
    ) -> Result<T, DriverError> {
        let primary = match self.execute(operation, op) {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if matches!(primary, DriverError::Cancelled | DriverError::Configuration(_)) {
            return Err(primary);
        }
        match fallback() {
            Ok(value) => {
                info!(operation, error = %primary, "served by fallback");
                Ok(value)
            }
            Err(fallback_err) => {
                warn!(operation, error = %primary, fallback_error = %fallback_err, "fallback failed");
                Err(primary)
            }
        }
    }

    /// One breaker-guarded call, no retries.
    pub fn guard<T>(
        &self,
        operation: &str,
        op: impl FnOnce() -> Result<T, DriverError>,
    ) -> Result<T, DriverError> {
        let admission = {
            let mut breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
            let breaker = breakers.entry(operation.to_string()).or_insert_with(|| {
                CircuitBreaker::new(self.policy.failure_threshold, self.policy.reset_timeout())
            });
            let (admission, transition) = breaker.try_acquire(Instant::now());
            self.announce(operation, transition);
            admission
        };
        if let Admission::Rejected { retry_in } = admission {
            debug!(operation, ?retry_in, "circuit open");
            return Err(DriverError::CircuitOpen {
                operation: operation.to_string(),
                retry_in,
            });
        }

        let result = op();

        let mut breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(breaker) = breakers.get_mut(operation) {
            let transition = match &result {
                Ok(_) => breaker.record_success(),
                // Caller-initiated stops say nothing about the operation's health.
                Err(DriverError::Cancelled) => {
                    breaker.release_trial();
                    None
                }
                Err(_) => breaker.record_failure(Instant::now()),
            };
            self.announce(operation, transition);
        }
        result
    }

    fn retry<T>(
        &self,
        operation: &str,
        op: &mut impl FnMut(u32) -> Result<T, DriverError>,
    ) -> Result<T, DriverError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_retryable() || attempt >= max_attempts => return Err(err),
                Err(err) => {
                    let delay = self.policy.delay_for(attempt);
                    warn!(operation, attempt, max_attempts, ?delay, error = %err, "retrying");
                    self.sleeper.sleep(delay);
                    attempt += 1;
                }
            }
        }
    }

    /// Restart `session`, waiting `delay_for(n)` before attempt `n`.
    ///
    /// The session's history is copied into `state` first and restored into
    /// the fresh process once it is ready. Returns the attempts used.
    #[instrument(skip_all, fields(session = %session.id()))]
    pub fn recover_session(
        &self,
        session: &mut SessionController,
        state: &mut RecoveryState,
    ) -> Result<u32, DriverError> {
        state.is_recovering = true;
        state.retry_count = 0;
        state.preserved_context = session.history_snapshot();
        let skip = session.config().skip_permission_prompt;
        let max_attempts = self.policy.max_attempts.max(1);

        let result = self.guard(RESTART_OPERATION, || {
            let mut last_error = None;
            for attempt in 1..=max_attempts {
                let delay = self.policy.delay_for(attempt);
                self.events.emit(&DriverEvent::RecoveryAttempt {
                    session: session.id().clone(),
                    attempt,
                    max_attempts,
                    delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                });
                self.sleeper.sleep(delay);
                state.retry_count = attempt;
                match session.start(skip) {
                    Ok(()) => return Ok(attempt),
                    Err(err) if !err.is_retryable() => return Err(err),
                    Err(err) => {
                        warn!(attempt, max_attempts, error = %err, "restart attempt failed");
                        last_error = Some(err);
                    }
                }
            }
            Err(last_error.unwrap_or_else(|| {
                DriverError::StartupFailed("no restart attempts made".to_string())
            }))
        });

        state.is_recovering = false;
        let attempts = result?;
        session.restore_history(&state.preserved_context);
        info!(attempts, preserved = state.preserved_context.len(), "session recovered");
        self.events.emit(&DriverEvent::RecoverySucceeded {
            session: session.id().clone(),
            attempts,
            preserved_snippets: state.preserved_context.len(),
        });
        Ok(attempts)
    }

    fn announce(&self, operation: &str, transition: Option<BreakerTransition>) {
        let Some(BreakerTransition { from, to }) = transition else {
            return;
        };
        info!(operation, %from, %to, "breaker changed");
        self.events.emit(&DriverEvent::BreakerChanged {
            operation: operation.to_string(),
            from,
            to,
        });
    }
}

impl std::fmt::Debug for RecoveryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryManager")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

/// A session that restarts itself when it is lost.
pub struct RecoveringSession {
    session: SessionController,
    manager: RecoveryManager,
    config: RecoveryConfig,
    prompts: PromptEngine,
    state: RecoveryState,
    started: bool,
}

impl RecoveringSession {
    pub fn new(session: SessionController, manager: RecoveryManager, config: RecoveryConfig) -> Self {
        Self {
            session,
            manager,
            config,
            prompts: PromptEngine::new(),
            state: RecoveryState::default(),
            started: false,
        }
    }

    pub fn session(&self) -> &SessionController {
        &self.session
    }

    pub fn manager(&self) -> &RecoveryManager {
        &self.manager
    }

    pub fn recovery_state(&self) -> &RecoveryState {
        &self.state
    }

    /// Start on first use; restart when the session is not ready or not healthy.
    pub fn ensure_ready(&mut self) -> Result<(), DriverError> {
        self.ensure_ready_for(None)
    }

    fn ensure_ready_for(&mut self, pending_task: Option<&str>) -> Result<(), DriverError> {
        if self.session.state() == SessionState::Ready && self.session.is_healthy() {
            return Ok(());
        }
        if !self.started {
            let skip = self.session.config().skip_permission_prompt;
            let session = &mut self.session;
            self.manager
                .execute(START_OPERATION, |_| session.start(skip))?;
            self.started = true;
            return Ok(());
        }

        self.manager
            .recover_session(&mut self.session, &mut self.state)?;
        self.prime(pending_task);
        Ok(())
    }

    /// Send `text`, restarting and resending when the session is lost.
    #[instrument(skip_all, fields(session = %self.session.id()))]
    pub fn send(&mut self, text: &str) -> Result<String, DriverError> {
        let max_attempts = self.manager.policy().max_attempts.max(1);
        let mut attempt = 1;
        loop {
            self.ensure_ready_for(Some(text))?;
            let session = &mut self.session;
            match self.manager.guard(SEND_OPERATION, || session.send(text)) {
                Ok(response) => return Ok(response),
                Err(err) if err.is_retryable() && attempt < max_attempts => {
                    warn!(attempt, max_attempts, error = %err, lost = err.lost_session(), "send failed, restarting");
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Stop the underlying session.
    pub fn stop(&mut self) {
        self.session.stop();
    }

    /// Best effort: a failed priming send is left for the next send to recover.
    fn prime(&mut self, pending_task: Option<&str>) {
        if !self.config.prime_after_restart || self.state.preserved_context.is_empty() {
            return;
        }
        let message = match self
            .prompts
            .render_continuation(&self.state.preserved_context, pending_task)
        {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, "render continuation prompt");
                return;
            }
        };
        match self.session.send(&message) {
            Ok(_) => debug!("primed restarted session"),
            Err(err) => warn!(error = %err, "priming send failed"),
        }
    }
}

impl std::fmt::Debug for RecoveringSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveringSession")
            .field("session", &self.session)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
