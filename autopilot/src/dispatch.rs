//! Task dispatch loop: one task at a time through a recovering session.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::cancel::CancelToken;
use crate::core::task::{Task, TaskId, TaskStatus, summarize_error};
use crate::error::DriverError;
use crate::io::checks::{CheckResult, CheckRunner, run_attached_checks};
use crate::io::clock::Sleeper;
use crate::io::config::DispatchConfig;
use crate::io::store::TaskQueue;
use crate::io::telemetry::{DriverEvent, SharedSink};
use crate::recovery::RecoveringSession;

/// When [`DispatchLoop::run`] returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Stop once no pending task is left.
    UntilIdle,
    /// Keep polling the queue until stopped.
    UntilStopped,
}

/// How one task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed { id: TaskId },
    Failed { id: TaskId, error: String },
    /// The in-flight send was cancelled; the task stays `processing`.
    Cancelled { id: TaskId },
}

/// Why the loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStop {
    Idle,
    Stopped,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSummary {
    pub completed: u32,
    pub failed: u32,
    pub stop: LoopStop,
}

impl DispatchSummary {
    pub fn merge(self, other: DispatchSummary) -> DispatchSummary {
        let stop = match (self.stop, other.stop) {
            (LoopStop::Cancelled, _) | (_, LoopStop::Cancelled) => LoopStop::Cancelled,
            (LoopStop::Stopped, _) | (_, LoopStop::Stopped) => LoopStop::Stopped,
            _ => LoopStop::Idle,
        };
        DispatchSummary {
            completed: self.completed + other.completed,
            failed: self.failed + other.failed,
            stop,
        }
    }
}

impl Default for DispatchSummary {
    fn default() -> Self {
        Self {
            completed: 0,
            failed: 0,
            stop: LoopStop::Idle,
        }
    }
}

pub struct DispatchLoop<Q: TaskQueue> {
    queue: Q,
    session: RecoveringSession,
    checks: Arc<dyn CheckRunner>,
    events: SharedSink,
    sleeper: Arc<dyn Sleeper>,
    config: DispatchConfig,
    stop: CancelToken,
}

impl<Q: TaskQueue> DispatchLoop<Q> {
    pub fn new(
        queue: Q,
        session: RecoveringSession,
        checks: Arc<dyn CheckRunner>,
        events: SharedSink,
        sleeper: Arc<dyn Sleeper>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            queue,
            session,
            checks,
            events,
            sleeper,
            config,
            stop: CancelToken::new(),
        }
    }

    /// Use `stop` as the between-iterations stop flag.
    pub fn with_stop(mut self, stop: CancelToken) -> Self {
        self.stop = stop;
        self
    }

    pub fn stop_handle(&self) -> CancelToken {
        self.stop.clone()
    }

    pub fn queue(&self) -> &Q {
        &self.queue
    }

    pub fn session(&self) -> &RecoveringSession {
        &self.session
    }

    /// Claim and run the next pending task. `None` when the queue is idle.
    #[instrument(skip_all)]
    pub fn run_once(&mut self) -> Result<Option<TaskOutcome>> {
        let Some(task) = self.queue.claim_next().context("claim next task")? else {
            return Ok(None);
        };
        info!(task_id = task.id, checks = task.attached_checks.len(), "dispatching task");
        self.emit_status(task.id, TaskStatus::Processing, None);

        let outcome = match self.session.send(&task.text) {
            Ok(response) => self.finish(&task, response)?,
            Err(DriverError::Cancelled) => {
                info!(task_id = task.id, "send cancelled; task left processing");
                TaskOutcome::Cancelled { id: task.id }
            }
            Err(err) => {
                let kind = err.kind();
                self.fail(task.id, &err.to_string(), kind, format!("{err:?}"))?
            }
        };
        Ok(Some(outcome))
    }

    /// Loop until idle or stopped, pausing between iterations.
    pub fn run(&mut self, mode: RunMode) -> Result<DispatchSummary> {
        let mut summary = DispatchSummary::default();
        let delay = Duration::from_millis(self.config.iteration_delay_ms);
        loop {
            if self.stop.is_cancelled() {
                summary.stop = LoopStop::Stopped;
                break;
            }
            match self.run_once()? {
                Some(TaskOutcome::Completed { .. }) => summary.completed += 1,
                Some(TaskOutcome::Failed { .. }) => summary.failed += 1,
                Some(TaskOutcome::Cancelled { .. }) => {
                    summary.stop = LoopStop::Cancelled;
                    break;
                }
                None if mode == RunMode::UntilIdle => {
                    summary.stop = LoopStop::Idle;
                    break;
                }
                None => {
                    debug!("queue idle");
                    if self.stop.wait_timeout(delay) {
                        summary.stop = LoopStop::Stopped;
                        break;
                    }
                    continue;
                }
            }
            self.sleeper.sleep(delay);
        }
        info!(
            completed = summary.completed,
            failed = summary.failed,
            stop = ?summary.stop,
            "dispatch loop finished"
        );
        Ok(summary)
    }

    /// Stop the session. Call once the loop is done with it.
    pub fn shutdown(&mut self) {
        self.session.stop();
    }

    fn finish(&mut self, task: &Task, response: String) -> Result<TaskOutcome> {
        let results = match run_attached_checks(self.checks.as_ref(), task.id, &task.attached_checks) {
            Ok(results) => results,
            Err(err) => {
                let message = format!("checks could not run: {err:#}");
                return self.fail(task.id, &message, "check_error", format!("{err:?}"));
            }
        };
        for result in &results {
            self.events.emit(&DriverEvent::CheckCompleted {
                task_id: task.id,
                check_id: result.check_id.clone(),
                passed: result.passed,
            });
        }
        if let Some(failed) = results.iter().find(|result| !result.passed) {
            let message = check_failure_message(failed);
            let detail = failed.errors.join("\n");
            return self.fail(task.id, &message, "check_failed", detail);
        }

        self.queue
            .update_status(task.id, TaskStatus::Completed, Some(response), None)
            .with_context(|| format!("complete task {}", task.id))?;
        self.emit_status(task.id, TaskStatus::Completed, None);
        info!(task_id = task.id, "task completed");
        Ok(TaskOutcome::Completed { id: task.id })
    }

    fn fail(&mut self, id: TaskId, message: &str, kind: &str, detail: String) -> Result<TaskOutcome> {
        let error = summarize_error(message, self.config.error_message_limit);
        warn!(task_id = id, kind, error = %error, "task failed");
        self.queue
            .update_status(id, TaskStatus::Error, None, Some(error.clone()))
            .with_context(|| format!("fail task {id}"))?;
        self.emit_status(id, TaskStatus::Error, Some(error.clone()));
        self.events.emit(&DriverEvent::TaskFailed {
            task_id: id,
            kind: kind.to_string(),
            detail,
        });
        Ok(TaskOutcome::Failed { id, error })
    }

    fn emit_status(&self, task_id: TaskId, status: TaskStatus, error: Option<String>) {
        self.events.emit(&DriverEvent::TaskUpdated {
            task_id,
            status,
            error,
        });
    }
}

fn check_failure_message(result: &CheckResult) -> String {
    match result.errors.first() {
        Some(first) => format!("check {} failed: {first}", result.check_id),
        None => format!("check {} failed", result.check_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::resilience::ResiliencePolicy;
    use crate::core::types::SessionId;
    use crate::io::config::RecoveryConfig;
    use crate::io::store::MemoryQueue;
    use crate::recovery::RecoveryManager;
    use crate::session::SessionController;
    use crate::test_support::{
        ProcessScript, RecordingSink, RecordingSleeper, ScriptedCheckRunner, ScriptedSpawner,
        fast_session_config,
    };

    struct Fixture {
        dispatch: DispatchLoop<MemoryQueue>,
        sink: RecordingSink,
        sleeper: RecordingSleeper,
    }

    fn fixture(spawner: &ScriptedSpawner, queue: MemoryQueue, checks: ScriptedCheckRunner) -> Fixture {
        let sink = RecordingSink::default();
        let sleeper = RecordingSleeper::default();
        let controller = SessionController::new(
            SessionId::from("main"),
            fast_session_config(),
            Arc::new(spawner.clone()),
        )
        .with_sleeper(Arc::new(RecordingSleeper::default()));
        let manager = RecoveryManager::new(
            ResiliencePolicy::default(),
            Arc::new(RecordingSleeper::default()),
            Arc::new(sink.clone()),
        );
        let session = RecoveringSession::new(controller, manager, RecoveryConfig::default());
        let dispatch = DispatchLoop::new(
            queue,
            session,
            Arc::new(checks),
            Arc::new(sink.clone()),
            Arc::new(sleeper.clone()),
            DispatchConfig::default(),
        );
        Fixture {
            dispatch,
            sink,
            sleeper,
        }
    }

    #[test]
    fn runs_tasks_in_order_until_idle() {
        let spawner = ScriptedSpawner::new();
        let mut queue = MemoryQueue::new();
        queue.push("first");
        queue.push("second");
        let mut fx = fixture(&spawner, queue, ScriptedCheckRunner::default());

        let summary = fx.dispatch.run(RunMode::UntilIdle).expect("run");
        assert_eq!(
            summary,
            DispatchSummary {
                completed: 2,
                failed: 0,
                stop: LoopStop::Idle
            }
        );
        assert_eq!(spawner.submissions(), vec!["first", "second"]);
        assert_eq!(fx.dispatch.queue().count(TaskStatus::Completed), 2);
        assert_eq!(
            fx.sleeper.recorded(),
            vec![Duration::from_secs(1), Duration::from_secs(1)]
        );
        fx.dispatch.shutdown();
    }

    #[test]
    fn failed_check_marks_task_error() {
        let spawner = ScriptedSpawner::new();
        let mut queue = MemoryQueue::new();
        let id = queue.push_with_checks("build it", ["lint", "test"]);
        let checks = ScriptedCheckRunner::default().failing("lint", &["unused variable"]);
        let mut fx = fixture(&spawner, queue, checks.clone());

        let outcome = fx.dispatch.run_once().expect("run").expect("task");
        assert_eq!(
            outcome,
            TaskOutcome::Failed {
                id,
                error: "check lint failed: unused variable".to_string()
            }
        );
        assert_eq!(checks.calls(), vec![(id, vec!["lint".to_string(), "test".to_string()])]);
        assert!(fx.sink.names().contains(&"checkCompleted"));
        assert!(fx.sink.names().contains(&"taskFailed"));
    }

    #[test]
    fn unrecoverable_send_truncates_stored_error() {
        let spawner = ScriptedSpawner::with_scripts([ProcessScript::FailSpawn; 3]);
        let mut queue = MemoryQueue::new();
        let id = queue.push("hello");
        let mut fx = fixture(&spawner, queue, ScriptedCheckRunner::default());
        fx.dispatch.config.error_message_limit = 20;

        let outcome = fx.dispatch.run_once().expect("run").expect("task");
        let TaskOutcome::Failed { error, .. } = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert!(error.chars().count() <= 20);
        let task = fx.dispatch.queue().get(id).expect("task");
        assert_eq!(task.status, TaskStatus::Error);
        let detail = fx.sink.events().into_iter().find_map(|event| match event {
            DriverEvent::TaskFailed { detail, .. } => Some(detail),
            _ => None,
        });
        assert!(detail.expect("detail").contains("StartupFailed"));
    }

    #[test]
    fn stop_flag_is_checked_between_iterations() {
        let spawner = ScriptedSpawner::new();
        let mut queue = MemoryQueue::new();
        queue.push("never sent");
        let mut fx = fixture(&spawner, queue, ScriptedCheckRunner::default());
        fx.dispatch.stop_handle().cancel();

        let summary = fx.dispatch.run(RunMode::UntilStopped).expect("run");
        assert_eq!(summary.stop, LoopStop::Stopped);
        assert_eq!(spawner.spawn_count(), 0);
        assert_eq!(fx.dispatch.queue().count(TaskStatus::Pending), 1);
    }
}
