//! Parallel work distribution: N workers, each with its own session.
//!
//! Workers share one [`SharedQueue`]. A worker only claims its next task once
//! its own session has read as ready again, so readiness detection is also the
//! "worker is free" signal.

use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result, anyhow};
use tracing::{info, warn};

use crate::cancel::CancelToken;
use crate::core::patterns::CompiledPatterns;
use crate::core::types::SessionId;
use crate::dispatch::{DispatchLoop, DispatchSummary, RunMode};
use crate::io::checks::CheckRunner;
use crate::io::clock::{Sleeper, ThreadSleeper};
use crate::io::config::AutopilotConfig;
use crate::io::pty::Spawner;
use crate::io::store::{SharedQueue, TaskQueue};
use crate::io::telemetry::{NullSink, SharedSink};
use crate::recovery::{RecoveringSession, RecoveryManager};
use crate::registry::SessionRegistry;
use crate::session::SessionController;

/// Everything needed to build one worker's session and loop.
#[derive(Clone)]
pub struct WorkerFactory {
    pub config: AutopilotConfig,
    pub patterns: CompiledPatterns,
    pub spawner: Arc<dyn Spawner>,
    pub checks: Arc<dyn CheckRunner>,
    pub events: SharedSink,
    /// Protocol delays: submission spacing, backoff, iteration pauses.
    pub sleeper: Arc<dyn Sleeper>,
    /// Cancels every worker's in-flight send, e.g. on Ctrl-C.
    pub interrupt: CancelToken,
}

impl WorkerFactory {
    pub fn new(
        config: AutopilotConfig,
        patterns: CompiledPatterns,
        spawner: Arc<dyn Spawner>,
        checks: Arc<dyn CheckRunner>,
    ) -> Self {
        Self {
            config,
            patterns,
            spawner,
            checks,
            events: Arc::new(NullSink),
            sleeper: Arc::new(ThreadSleeper),
            interrupt: CancelToken::new(),
        }
    }

    pub fn with_events(mut self, events: SharedSink) -> Self {
        self.events = events;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_interrupt(mut self, interrupt: CancelToken) -> Self {
        self.interrupt = interrupt;
        self
    }

    pub fn session(&self, id: SessionId) -> SessionController {
        SessionController::new(id, self.config.session.clone(), Arc::clone(&self.spawner))
            .with_patterns(self.patterns.clone())
            .with_submission(self.config.submission.clone())
            .with_sleeper(Arc::clone(&self.sleeper))
            .with_events(Arc::clone(&self.events))
            .with_interrupt(self.interrupt.clone())
    }

    pub fn dispatch_loop<Q: TaskQueue>(&self, queue: Q, session: SessionController) -> DispatchLoop<Q> {
        let manager = RecoveryManager::new(
            self.config.resilience.clone(),
            Arc::clone(&self.sleeper),
            Arc::clone(&self.events),
        );
        let session = RecoveringSession::new(session, manager, self.config.recovery.clone());
        DispatchLoop::new(
            queue,
            session,
            Arc::clone(&self.checks),
            Arc::clone(&self.events),
            Arc::clone(&self.sleeper),
            self.config.dispatch.clone(),
        )
    }
}

pub struct Distributor {
    factory: WorkerFactory,
    registry: Arc<SessionRegistry>,
}

impl Distributor {
    pub fn new(factory: WorkerFactory, registry: Arc<SessionRegistry>) -> Self {
        Self { factory, registry }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Run `workers` loops over `queue` in `mode`, or until `stop` fires.
    pub fn run<Q>(
        &self,
        queue: &SharedQueue<Q>,
        workers: usize,
        mode: RunMode,
        stop: &CancelToken,
    ) -> Result<DispatchSummary>
    where
        Q: TaskQueue + Send,
    {
        if workers == 0 {
            return Err(anyhow!("at least one worker is required"));
        }
        info!(workers, "starting distributor");

        let results: Vec<Result<DispatchSummary>> = thread::scope(|scope| {
            let handles: Vec<_> = (1..=workers)
                .map(|index| {
                    let queue = queue.clone();
                    let stop = stop.clone();
                    thread::Builder::new()
                        .name(format!("worker-{index}"))
                        .spawn_scoped(scope, move || self.run_worker(index, queue, mode, stop))
                        .with_context(|| format!("spawn worker {index}"))
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle?
                        .join()
                        .map_err(|_| anyhow!("worker thread panicked"))?
                })
                .collect()
        });

        let mut summary = DispatchSummary::default();
        for result in results {
            summary = summary.merge(result?);
        }
        info!(
            completed = summary.completed,
            failed = summary.failed,
            "distributor finished"
        );
        Ok(summary)
    }

    fn run_worker<Q>(
        &self,
        index: usize,
        queue: SharedQueue<Q>,
        mode: RunMode,
        stop: CancelToken,
    ) -> Result<DispatchSummary>
    where
        Q: TaskQueue + Send,
    {
        let id = SessionId::new(format!("worker-{index}"));
        let session = self.factory.session(id.clone());
        self.registry.register(session.probe());

        let mut dispatch = self.factory.dispatch_loop(queue, session).with_stop(stop);
        let result = dispatch.run(mode);
        if let Err(err) = &result {
            warn!(session = %id, error = %err, "worker stopped with error");
        }
        dispatch.shutdown();
        self.registry.unregister(&id);
        result.with_context(|| format!("worker {id}"))
    }
}
