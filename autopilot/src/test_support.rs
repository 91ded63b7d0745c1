//! Test-only fakes: a scripted CLI process, recording sleeper/writer/sink and
//! a scripted check runner.

use std::collections::{BTreeMap, VecDeque};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use anyhow::Result;

use crate::core::task::{Task, TaskId};
use crate::error::DriverError;
use crate::io::checks::{CheckResult, CheckRunner};
use crate::io::clock::Sleeper;
use crate::io::config::SessionConfig;
use crate::io::pty::{ExitInfo, ProcessControl, SessionHandle, SpawnRequest, Spawner};
use crate::io::store::save_tasks;
use crate::io::telemetry::{DriverEvent, EventSink};

/// Idle footer the scripted CLI draws when it waits for input.
pub const IDLE_FOOTER: &str = "? for shortcuts";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Session timings small enough for tests that run against the scripted CLI.
pub fn fast_session_config() -> SessionConfig {
    SessionConfig {
        startup_timeout_ms: 2_000,
        response_timeout_ms: 3_000,
        poll_interval_ms: 5,
        debounce_ms: 30,
        stop_grace_ms: 100,
        ..SessionConfig::default()
    }
}

/// Records requested sleeps without sleeping. Clones share the record.
#[derive(Debug, Clone, Default)]
pub struct RecordingSleeper {
    recorded: Arc<Mutex<Vec<Duration>>>,
}

impl RecordingSleeper {
    pub fn recorded(&self) -> Vec<Duration> {
        lock(&self.recorded).clone()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        lock(&self.recorded).push(duration);
    }
}

#[derive(Debug, Default)]
struct WriterState {
    writes: Vec<Vec<u8>>,
    failures_left: usize,
    failure_kind: Option<io::ErrorKind>,
    /// The first write accepts at most this many bytes.
    short_write: Option<usize>,
}

/// In-memory sink that records each successful `write` call.
#[derive(Debug, Clone, Default)]
pub struct RecordingWriter {
    state: Arc<Mutex<WriterState>>,
}

impl RecordingWriter {
    /// Fails the first `count` writes with `kind`.
    pub fn failing(count: usize, kind: io::ErrorKind) -> Self {
        Self {
            state: Arc::new(Mutex::new(WriterState {
                writes: Vec::new(),
                failures_left: count,
                failure_kind: Some(kind),
                short_write: None,
            })),
        }
    }

    /// Accepts only `accepted` bytes of the first write, then fails the next
    /// write once with `kind`.
    pub fn partial_then_failing(accepted: usize, kind: io::ErrorKind) -> Self {
        Self {
            state: Arc::new(Mutex::new(WriterState {
                writes: Vec::new(),
                failures_left: 1,
                failure_kind: Some(kind),
                short_write: Some(accepted),
            })),
        }
    }

    /// Everything written so far, concatenated.
    pub fn written(&self) -> Vec<u8> {
        lock(&self.state).writes.concat()
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        lock(&self.state).writes.clone()
    }
}

impl Write for RecordingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = lock(&self.state);
        if let Some(limit) = state.short_write.take() {
            let accepted = limit.min(buf.len());
            state.writes.push(buf[..accepted].to_vec());
            return Ok(accepted);
        }
        if state.failures_left > 0 {
            state.failures_left -= 1;
            let kind = state.failure_kind.unwrap_or(io::ErrorKind::Other);
            return Err(io::Error::new(kind, "scripted write failure"));
        }
        state.writes.push(buf.to_vec());
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Collects emitted events. Clones share the record.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<DriverEvent>>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<DriverEvent> {
        lock(&self.events).clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        lock(&self.events).iter().map(DriverEvent::name).collect()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: &DriverEvent) {
        lock(&self.events).push(event.clone());
    }
}

/// Behavior of one scripted child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessScript {
    /// Draws the idle footer at startup and answers every submission.
    Responsive,
    /// Answers `n` submissions, then exits with code 1 partway through the next.
    CrashAfter(usize),
    /// The spawn itself fails.
    FailSpawn,
    /// Runs but never draws the idle footer.
    Silent,
    /// Starts ready, then never reacts to input.
    IgnoresInput,
    /// Asks for permission before answering each submission.
    AsksPermission,
}

#[derive(Debug)]
struct FakeProcess {
    script: ProcessScript,
    tx: Option<Sender<Vec<u8>>>,
    exit: Option<ExitInfo>,
    typed: Vec<u8>,
    answered: usize,
    awaiting_approval: Option<String>,
}

impl FakeProcess {
    fn send(&self, text: &str) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(text.as_bytes().to_vec());
        }
    }

    fn exit(&mut self, code: Option<u32>) {
        if self.exit.is_none() {
            self.exit = Some(ExitInfo {
                code,
                success: code == Some(0),
            });
        }
        self.tx = None;
    }

    fn answer(&mut self, text: &str) {
        self.answered += 1;
        self.send(&format!("\u{25cf} done: {text}\r\n\r\n{IDLE_FOOTER}\r\n"));
    }

    fn on_submit(&mut self, submissions: &Mutex<Vec<String>>) {
        if let Some(pending) = self.awaiting_approval.take() {
            self.send("\x1b[2J\x1b[H");
            self.answer(&pending);
            return;
        }
        let text = String::from_utf8_lossy(&std::mem::take(&mut self.typed)).into_owned();
        lock(submissions).push(text.clone());
        match self.script {
            ProcessScript::Responsive => self.answer(&text),
            ProcessScript::CrashAfter(limit) if self.answered >= limit => {
                self.send("\u{25cf} working on it");
                self.exit(Some(1));
            }
            ProcessScript::CrashAfter(_) => self.answer(&text),
            ProcessScript::AsksPermission => {
                self.send("Do you want to make this edit?\r\n\u{276f} 1. Yes\r\n  2. No\r\n");
                self.awaiting_approval = Some(text);
            }
            ProcessScript::Silent | ProcessScript::IgnoresInput | ProcessScript::FailSpawn => {}
        }
    }
}

struct ScriptedInput {
    process: Arc<Mutex<FakeProcess>>,
    submissions: Arc<Mutex<Vec<String>>>,
}

impl Write for ScriptedInput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut process = lock(&self.process);
        if process.exit.is_some() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "scripted process exited"));
        }
        if buf == b"\r" {
            process.on_submit(&self.submissions);
        } else {
            process.typed.extend_from_slice(buf);
            // Like a terminal, typed text is echoed back.
            process.send(&String::from_utf8_lossy(buf));
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct ScriptedControl {
    process: Arc<Mutex<FakeProcess>>,
}

impl ProcessControl for ScriptedControl {
    fn try_wait(&mut self) -> io::Result<Option<ExitInfo>> {
        Ok(lock(&self.process).exit)
    }

    fn interrupt(&mut self) -> io::Result<()> {
        lock(&self.process).exit(Some(130));
        Ok(())
    }

    fn kill(&mut self) -> io::Result<()> {
        lock(&self.process).exit(None);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct SpawnerState {
    scripts: VecDeque<ProcessScript>,
    requests: Vec<SpawnRequest>,
    processes: Vec<Arc<Mutex<FakeProcess>>>,
}

/// Spawns scripted processes in order; once the scripts run out every
/// further spawn is [`ProcessScript::Responsive`]. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct ScriptedSpawner {
    state: Arc<Mutex<SpawnerState>>,
    submissions: Arc<Mutex<Vec<String>>>,
}

impl ScriptedSpawner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_scripts(scripts: impl IntoIterator<Item = ProcessScript>) -> Self {
        let spawner = Self::default();
        lock(&spawner.state).scripts = scripts.into_iter().collect();
        spawner
    }

    pub fn requests(&self) -> Vec<SpawnRequest> {
        lock(&self.state).requests.clone()
    }

    /// Spawn attempts, including failed ones.
    pub fn spawn_count(&self) -> usize {
        lock(&self.state).requests.len()
    }

    /// Processes that have not exited.
    pub fn live_count(&self) -> usize {
        lock(&self.state)
            .processes
            .iter()
            .filter(|process| lock(process).exit.is_none())
            .count()
    }

    /// Every submitted text, across all processes, in order.
    pub fn submissions(&self) -> Vec<String> {
        lock(&self.submissions).clone()
    }
}

impl Spawner for ScriptedSpawner {
    fn spawn(&self, request: &SpawnRequest) -> Result<SessionHandle, DriverError> {
        let mut state = lock(&self.state);
        state.requests.push(request.clone());
        let script = state.scripts.pop_front().unwrap_or(ProcessScript::Responsive);
        if script == ProcessScript::FailSpawn {
            return Err(DriverError::StartupFailed(format!(
                "scripted spawn failure for {}",
                request.program
            )));
        }

        let (tx, output) = mpsc::channel();
        let process = FakeProcess {
            script,
            tx: Some(tx),
            exit: None,
            typed: Vec::new(),
            answered: 0,
            awaiting_approval: None,
        };
        if script == ProcessScript::Silent {
            process.send("Loading...\r\n");
        } else {
            process.send(&format!(
                "\x1b[2J\x1b[HWelcome to the scripted CLI\r\n\r\n> \r\n{IDLE_FOOTER}\r\n"
            ));
        }

        let process = Arc::new(Mutex::new(process));
        state.processes.push(Arc::clone(&process));
        let pid = 1000 + u32::try_from(state.processes.len()).unwrap_or(0);
        Ok(SessionHandle {
            pid: Some(pid),
            input: Box::new(ScriptedInput {
                process: Arc::clone(&process),
                submissions: Arc::clone(&self.submissions),
            }),
            output,
            started_at: Instant::now(),
            control: Box::new(ScriptedControl { process }),
        })
    }
}

/// Check runner with fixed outcomes per check id. Unknown ids pass.
#[derive(Debug, Clone, Default)]
pub struct ScriptedCheckRunner {
    failures: BTreeMap<String, Vec<String>>,
    calls: Arc<Mutex<Vec<(TaskId, Vec<String>)>>>,
}

impl ScriptedCheckRunner {
    pub fn failing(mut self, check_id: &str, errors: &[&str]) -> Self {
        self.failures.insert(
            check_id.to_string(),
            errors.iter().map(|error| (*error).to_string()).collect(),
        );
        self
    }

    pub fn calls(&self) -> Vec<(TaskId, Vec<String>)> {
        lock(&self.calls).clone()
    }
}

impl CheckRunner for ScriptedCheckRunner {
    fn run(&self, task_id: TaskId, check_ids: &[String]) -> Result<Vec<CheckResult>> {
        lock(&self.calls).push((task_id, check_ids.to_vec()));
        let mut results = Vec::new();
        for check_id in check_ids {
            match self.failures.get(check_id) {
                Some(errors) => {
                    results.push(CheckResult::fail(check_id.clone(), errors.clone()));
                    break;
                }
                None => results.push(CheckResult::pass(check_id.clone())),
            }
        }
        Ok(results)
    }
}

/// A temp directory holding `tasks.json` with one pending task per text.
pub fn task_file(texts: &[&str]) -> Result<(tempfile::TempDir, PathBuf)> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("tasks.json");
    let tasks: Vec<Task> = texts
        .iter()
        .zip(1..)
        .map(|(text, id)| Task::new(id, *text))
        .collect();
    save_tasks(&path, &tasks)?;
    Ok((dir, path))
}
