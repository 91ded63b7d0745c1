//! End-to-end dispatch against the scripted CLI.
//!
//! Covers the full path from a queued task through submission, readiness
//! detection, crash recovery with context priming, and persistence.

use std::sync::Arc;
use std::time::Duration;

use autopilot::core::resilience::ResiliencePolicy;
use autopilot::core::task::TaskStatus;
use autopilot::core::types::SessionId;
use autopilot::dispatch::{DispatchLoop, DispatchSummary, LoopStop, RunMode};
use autopilot::io::config::{DispatchConfig, RecoveryConfig};
use autopilot::io::store::{FileQueue, MemoryQueue, TaskQueue, load_tasks};
use autopilot::io::telemetry::DriverEvent;
use autopilot::recovery::{RecoveringSession, RecoveryManager};
use autopilot::session::SessionController;
use autopilot::test_support::{
    ProcessScript, RecordingSink, RecordingSleeper, ScriptedCheckRunner, ScriptedSpawner,
    fast_session_config, task_file,
};

struct Harness {
    sink: RecordingSink,
    recovery_sleeper: RecordingSleeper,
}

fn dispatch_loop<Q: TaskQueue>(spawner: &ScriptedSpawner, queue: Q) -> (DispatchLoop<Q>, Harness) {
    let sink = RecordingSink::default();
    let recovery_sleeper = RecordingSleeper::default();
    let controller = SessionController::new(
        SessionId::from("main"),
        fast_session_config(),
        Arc::new(spawner.clone()),
    )
    .with_sleeper(Arc::new(RecordingSleeper::default()))
    .with_events(Arc::new(sink.clone()));
    let manager = RecoveryManager::new(
        ResiliencePolicy::default(),
        Arc::new(recovery_sleeper.clone()),
        Arc::new(sink.clone()),
    );
    let session = RecoveringSession::new(controller, manager, RecoveryConfig::default());
    let dispatch = DispatchLoop::new(
        queue,
        session,
        Arc::new(ScriptedCheckRunner::default()),
        Arc::new(sink.clone()),
        Arc::new(RecordingSleeper::default()),
        DispatchConfig::default(),
    );
    (
        dispatch,
        Harness {
            sink,
            recovery_sleeper,
        },
    )
}

#[test]
fn hello_task_completes_with_response() {
    let spawner = ScriptedSpawner::new();
    let mut queue = MemoryQueue::new();
    let id = queue.push("hello");
    let (mut dispatch, harness) = dispatch_loop(&spawner, queue);

    let summary = dispatch.run(RunMode::UntilIdle).expect("run");
    assert_eq!(
        summary,
        DispatchSummary {
            completed: 1,
            failed: 0,
            stop: LoopStop::Idle
        }
    );

    let task = dispatch.queue().get(id).expect("task").clone();
    assert_eq!(task.status, TaskStatus::Completed);
    assert!(task.completed_at.is_some());
    assert!(task.output.expect("output").contains("done: hello"));

    let statuses: Vec<TaskStatus> = harness
        .sink
        .events()
        .into_iter()
        .filter_map(|event| match event {
            DriverEvent::TaskUpdated { status, .. } => Some(status),
            _ => None,
        })
        .collect();
    assert_eq!(statuses, vec![TaskStatus::Processing, TaskStatus::Completed]);

    dispatch.shutdown();
    assert_eq!(spawner.live_count(), 0);
}

#[test]
fn crash_mid_task_restarts_primes_and_resends() {
    let spawner = ScriptedSpawner::with_scripts([
        ProcessScript::CrashAfter(1),
        ProcessScript::FailSpawn,
        ProcessScript::FailSpawn,
        ProcessScript::Responsive,
    ]);
    let mut queue = MemoryQueue::new();
    queue.push("first");
    let second = queue.push("second");
    let (mut dispatch, harness) = dispatch_loop(&spawner, queue);

    let summary = dispatch.run(RunMode::UntilIdle).expect("run");
    assert_eq!(summary.completed, 2);
    assert_eq!(summary.failed, 0);
    assert_eq!(
        dispatch.queue().get(second).expect("task").status,
        TaskStatus::Completed
    );

    // Each restart attempt waits its backoff delay first.
    assert_eq!(
        harness.recovery_sleeper.recorded(),
        vec![
            Duration::from_secs(1),
            Duration::from_secs(2),
            Duration::from_secs(4)
        ]
    );
    let attempts = harness
        .sink
        .events()
        .into_iter()
        .filter(|event| matches!(event, DriverEvent::RecoveryAttempt { .. }))
        .count();
    assert_eq!(attempts, 3);

    let preserved = harness.sink.events().into_iter().find_map(|event| match event {
        DriverEvent::RecoverySucceeded {
            attempts,
            preserved_snippets,
            ..
        } => Some((attempts, preserved_snippets)),
        _ => None,
    });
    let (attempts, preserved_snippets) = preserved.expect("recovery succeeded");
    assert_eq!(attempts, 3);
    assert!(preserved_snippets > 0);

    let submissions = spawner.submissions();
    assert_eq!(submissions.first().map(String::as_str), Some("first"));
    assert_eq!(submissions.last().map(String::as_str), Some("second"));
    assert!(
        submissions
            .iter()
            .any(|text| text.contains("restarted") && text.contains("first")),
        "priming message carries earlier context: {submissions:?}"
    );

    dispatch.shutdown();
}

#[test]
fn file_queue_persists_outcomes() {
    let (_dir, path) = task_file(&["persist me"]).expect("task file");
    let spawner = ScriptedSpawner::new();
    let queue = FileQueue::open(&path).expect("open");
    let (mut dispatch, _) = dispatch_loop(&spawner, queue);

    dispatch.run(RunMode::UntilIdle).expect("run");
    dispatch.shutdown();

    let tasks = load_tasks(&path).expect("reload");
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].status, TaskStatus::Completed);
    assert!(tasks[0].output.as_deref().is_some_and(|out| out.contains("done: persist me")));
}
