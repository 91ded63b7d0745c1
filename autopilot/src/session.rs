//! Session controller: one driven CLI process and its readiness protocol.
//!
//! The controller owns the [`SessionHandle`](crate::io::pty::SessionHandle), the screen buffer and the
//! readiness tracker. All waiting happens in one poll loop that is woken early
//! by output, bounded by a deadline, and interruptible through a
//! [`CancelToken`]. A [`SessionProbe`] publishes a read-only view for the
//! health monitor on another thread.

use std::io::{ErrorKind, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, warn};

use crate::cancel::CancelToken;
use crate::core::ansi::{incomplete_utf8_tail, strip_ansi};
use crate::core::classifier::{ReadinessTracker, ScreenAnalyzer};
use crate::core::context::ContextRing;
use crate::core::patterns::CompiledPatterns;
use crate::core::screen::ScreenBuffer;
use crate::core::types::{ReadinessState, SessionId, SessionState};
use crate::error::DriverError;
use crate::io::clock::{Sleeper, ThreadSleeper};
use crate::io::config::SessionConfig;
use crate::io::pty::{ProcessControl, SpawnRequest, Spawner};
use crate::io::submit::{SubmissionConfig, Submitter};
use crate::io::telemetry::{DriverEvent, EventSink, FanOutSink, SharedSink};

const REAP_TIMEOUT: Duration = Duration::from_secs(1);
const REAP_POLL: Duration = Duration::from_millis(20);
const INTERRUPT_BYTE: &[u8] = b"\x03";

pub type SharedControl = Arc<Mutex<Box<dyn ProcessControl>>>;

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Point-in-time view of a session for other threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeSnapshot {
    pub state: SessionState,
    pub pid: Option<u32>,
    pub busy_since: Option<Instant>,
    pub last_output_at: Option<Instant>,
    /// Bytes received since the controller was created.
    pub total_bytes: u64,
}

/// Thread-safe handle the health monitor and registry hold for one session.
pub struct SessionProbe {
    id: SessionId,
    snapshot: Mutex<ProbeSnapshot>,
    control: Mutex<Option<SharedControl>>,
    stuck: AtomicBool,
}

impl SessionProbe {
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            snapshot: Mutex::new(ProbeSnapshot {
                state: SessionState::Stopped,
                pid: None,
                busy_since: None,
                last_output_at: None,
                total_bytes: 0,
            }),
            control: Mutex::new(None),
            stuck: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn snapshot(&self) -> ProbeSnapshot {
        *lock(&self.snapshot)
    }

    /// Whether the attached child is still running. False when none is attached.
    pub fn is_alive(&self) -> bool {
        let Some(control) = lock(&self.control).clone() else {
            return false;
        };
        let mut control = lock(&control);
        matches!(control.try_wait(), Ok(None))
    }

    /// Ask the controller to abandon the in-flight wait as stuck.
    pub fn flag_stuck(&self) {
        self.stuck.store(true, Ordering::SeqCst);
    }

    pub fn is_flagged(&self) -> bool {
        self.stuck.load(Ordering::SeqCst)
    }

    fn take_stuck(&self) -> bool {
        self.stuck.swap(false, Ordering::SeqCst)
    }

    fn clear_stuck(&self) {
        self.stuck.store(false, Ordering::SeqCst);
    }

    pub(crate) fn update(&self, f: impl FnOnce(&mut ProbeSnapshot)) {
        f(&mut lock(&self.snapshot));
    }

    pub(crate) fn attach(&self, control: Option<SharedControl>) {
        *lock(&self.control) = control;
    }
}

impl std::fmt::Debug for SessionProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionProbe")
            .field("id", &self.id)
            .field("snapshot", &self.snapshot())
            .field("stuck", &self.is_flagged())
            .finish_non_exhaustive()
    }
}

struct LiveSession {
    pid: Option<u32>,
    input: Box<dyn Write + Send>,
    output: Receiver<Vec<u8>>,
    control: SharedControl,
    output_closed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Startup,
    Response,
}

pub struct SessionController {
    id: SessionId,
    config: SessionConfig,
    submission: SubmissionConfig,
    analyzer: ScreenAnalyzer,
    spawner: Arc<dyn Spawner>,
    sleeper: Arc<dyn Sleeper>,
    events: FanOutSink,
    probe: Arc<SessionProbe>,
    cancel: CancelToken,
    /// Process-wide interrupt. Never reset, unlike `cancel`.
    interrupt: CancelToken,
    state: SessionState,
    live: Option<LiveSession>,
    screen: ScreenBuffer,
    tracker: ReadinessTracker,
    history: ContextRing,
    last_output_at: Instant,
    busy_since: Option<Instant>,
    /// Start of a UTF-8 character cut off by the previous read.
    partial_char: Vec<u8>,
}

impl SessionController {
    /// A stopped controller using the built-in pattern set.
    pub fn new(id: SessionId, config: SessionConfig, spawner: Arc<dyn Spawner>) -> Self {
        let patterns = CompiledPatterns::default();
        let analyzer = ScreenAnalyzer::new(patterns.clone(), config.debounce());
        let screen = ScreenBuffer::new(config.max_screen_bytes, patterns.clear_markers().clone());
        let history = ContextRing::new(config.context_capacity, config.snippet_chars);
        Self {
            probe: Arc::new(SessionProbe::new(id.clone())),
            id,
            config,
            submission: SubmissionConfig::default(),
            analyzer,
            spawner,
            sleeper: Arc::new(ThreadSleeper),
            events: FanOutSink::default(),
            cancel: CancelToken::new(),
            interrupt: CancelToken::new(),
            state: SessionState::Stopped,
            live: None,
            screen,
            tracker: ReadinessTracker::new(),
            history,
            last_output_at: Instant::now(),
            busy_since: None,
            partial_char: Vec::new(),
        }
    }

    pub fn with_patterns(mut self, patterns: CompiledPatterns) -> Self {
        self.screen = ScreenBuffer::new(
            self.config.max_screen_bytes,
            patterns.clear_markers().clone(),
        );
        self.analyzer = ScreenAnalyzer::new(patterns, self.config.debounce());
        self
    }

    pub fn with_submission(mut self, submission: SubmissionConfig) -> Self {
        self.submission = submission;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_events(mut self, sink: SharedSink) -> Self {
        self.events.push(sink);
        self
    }

    /// Abort startup and in-flight sends with `Cancelled` once `interrupt`
    /// fires. Unlike [`stop_handle`](Self::stop_handle) it stays in effect
    /// across restarts.
    pub fn with_interrupt(mut self, interrupt: CancelToken) -> Self {
        self.interrupt = interrupt;
        self
    }

    /// Add a subscriber for state, output and permission events.
    pub fn subscribe(&mut self, sink: SharedSink) {
        self.events.push(sink);
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn pid(&self) -> Option<u32> {
        self.live.as_ref().and_then(|live| live.pid)
    }

    pub fn probe(&self) -> Arc<SessionProbe> {
        Arc::clone(&self.probe)
    }

    /// Cancels the in-flight `send` from any thread.
    ///
    /// A handle stays bound to the token it was taken from; once used, the
    /// next `start` installs a fresh token.
    pub fn stop_handle(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn history_snapshot(&self) -> Vec<String> {
        self.history.snapshot()
    }

    pub fn restore_history(&mut self, entries: &[String]) {
        self.history.restore(entries);
    }

    /// Stripped text of the live screen.
    pub fn screen_text(&self) -> String {
        self.screen.text()
    }

    /// Spawn the child and wait for its first ready screen.
    #[instrument(skip_all, fields(session = %self.id, skip = skip_permission_prompt))]
    pub fn start(&mut self, skip_permission_prompt: bool) -> Result<(), DriverError> {
        if let Some(live) = self.live.take() {
            debug!(session = %self.id, "tearing down previous handle");
            self.terminate(live);
        }
        if self.cancel.is_cancelled() {
            self.cancel = CancelToken::new();
        }
        self.probe.clear_stuck();
        self.screen.clear();
        self.tracker.reset();
        self.busy_since = None;
        self.partial_char.clear();

        let mut request = SpawnRequest::new(self.config.program.clone()).args(self.config.args.clone());
        if skip_permission_prompt && !self.config.skip_permissions_flag.is_empty() {
            request = request.arg(self.config.skip_permissions_flag.clone());
        }
        request.cwd = self.config.cwd.clone();
        request.rows = self.config.rows;
        request.cols = self.config.cols;
        request.env = self
            .config
            .env
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        self.set_state(SessionState::Starting);
        let handle = match self.spawner.spawn(&request) {
            Ok(handle) => handle,
            Err(err) => {
                warn!(session = %self.id, error = %err, "spawn failed");
                self.set_state(SessionState::Error);
                return Err(err);
            }
        };

        let control: SharedControl = Arc::new(Mutex::new(handle.control));
        self.probe.attach(Some(Arc::clone(&control)));
        self.last_output_at = handle.started_at;
        self.live = Some(LiveSession {
            pid: handle.pid,
            input: handle.input,
            output: handle.output,
            control,
            output_closed: false,
        });
        self.publish();

        match self.await_ready(Phase::Startup, self.config.startup_timeout()) {
            Ok(()) => {
                info!(session = %self.id, pid = ?self.pid(), "session ready");
                self.set_state(SessionState::Ready);
                Ok(())
            }
            Err(err) => {
                warn!(session = %self.id, error = %err, "startup failed");
                if let Some(live) = self.live.take() {
                    self.terminate(live);
                }
                if err != DriverError::Cancelled {
                    self.set_state(SessionState::Error);
                }
                Err(err)
            }
        }
    }

    /// Submit `text` and wait for the CLI to come back to its ready screen.
    ///
    /// Returns the stripped tail of the screen drawn since submission.
    #[instrument(skip_all, fields(session = %self.id, bytes = text.len()))]
    pub fn send(&mut self, text: &str) -> Result<String, DriverError> {
        if self.state != SessionState::Ready {
            return Err(DriverError::InvalidState {
                operation: "send",
                expected: SessionState::Ready,
                actual: self.state,
            });
        }
        self.probe.clear_stuck();
        self.busy_since = Some(Instant::now());
        self.set_state(SessionState::Busy);
        self.history.push("user", text);

        let result = self
            .submit(text)
            .and_then(|()| self.await_ready(Phase::Response, self.config.response_timeout()));
        match result {
            Ok(()) => {
                let response = self.screen.tail_text(self.config.response_tail_chars);
                self.history.push("assistant", &response);
                self.busy_since = None;
                self.set_state(SessionState::Ready);
                Ok(response)
            }
            Err(DriverError::Cancelled) => {
                info!(session = %self.id, "send cancelled");
                Err(DriverError::Cancelled)
            }
            Err(err) => {
                warn!(session = %self.id, error = %err, "send failed");
                self.busy_since = None;
                self.set_state(SessionState::Error);
                Err(err)
            }
        }
    }

    /// Alive, and not silent for too long while busy.
    pub fn is_healthy(&self) -> bool {
        let Some(live) = &self.live else {
            return false;
        };
        let alive = matches!(lock(&live.control).try_wait(), Ok(None));
        if !alive {
            return false;
        }
        !(self.state == SessionState::Busy
            && self.last_output_at.elapsed() > self.config.max_busy_without_output())
    }

    /// Interrupt, wait out the grace period, then kill. Always ends `Stopped`.
    #[instrument(skip_all, fields(session = %self.id))]
    pub fn stop(&mut self) {
        if let Some(live) = self.live.take() {
            self.terminate(live);
        }
        self.busy_since = None;
        self.set_state(SessionState::Stopped);
    }

    fn submit(&mut self, text: &str) -> Result<(), DriverError> {
        // Anything drawn before the keystroke belongs to the previous frame.
        self.pump(Duration::ZERO);

        let submitter = Submitter::new(&self.submission, self.sleeper.as_ref());
        let Some(live) = self.live.as_mut() else {
            return Err(DriverError::ProcessUnavailable(
                "session has no process".to_string(),
            ));
        };
        let screen = &mut self.screen;
        let LiveSession { input, output, .. } = live;
        let sink: &mut dyn Write = &mut **input;
        submitter.submit_with(Some(sink), text, || {
            // Echo of the typed text is not part of the response.
            while output.try_recv().is_ok() {}
            screen.clear();
        })?;

        self.tracker.reset();
        self.last_output_at = Instant::now();
        self.publish();
        Ok(())
    }

    fn await_ready(&mut self, phase: Phase, timeout: Duration) -> Result<(), DriverError> {
        let deadline = Instant::now() + timeout;
        let poll = self.config.poll_interval();
        loop {
            if self.cancel.is_cancelled() || self.interrupt.is_cancelled() {
                return Err(DriverError::Cancelled);
            }
            if phase == Phase::Response && self.probe.take_stuck() {
                let busy_for = self.busy_since.map(|at| at.elapsed()).unwrap_or_default();
                return Err(DriverError::SessionStuck { busy_for });
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            self.pump(poll.min(remaining));

            if let Some(exit) = self.exit_status() {
                return Err(match phase {
                    Phase::Startup => DriverError::StartupFailed(format!(
                        "process exited during startup (exit code {})",
                        exit.map_or_else(|| "unknown".to_string(), |code| code.to_string())
                    )),
                    Phase::Response => DriverError::ProcessCrash { exit_code: exit },
                });
            }

            let quiet = self.last_output_at.elapsed();
            let observation = self.tracker.observe(&self.analyzer, self.screen.live(), quiet);
            if observation.prompt_opened {
                self.on_permission_prompt(observation.prompt_pattern);
            }
            if observation.state == ReadinessState::Ready {
                return Ok(());
            }

            if Instant::now() >= deadline {
                return Err(match phase {
                    Phase::Startup => DriverError::StartupTimeout(timeout),
                    Phase::Response => DriverError::ResponseTimeout(timeout),
                });
            }
        }
    }

    /// Wait up to `wait` for output, then drain whatever else is queued.
    fn pump(&mut self, wait: Duration) {
        let Some(live) = self.live.as_mut() else {
            self.cancel.wait_timeout(wait);
            return;
        };
        if live.output_closed {
            self.cancel.wait_timeout(wait);
            return;
        }

        let mut received = Vec::new();
        match live.output.recv_timeout(wait) {
            Ok(chunk) => received.push(chunk),
            Err(RecvTimeoutError::Timeout) => return,
            Err(RecvTimeoutError::Disconnected) => {
                debug!(session = %self.id, "output closed");
                live.output_closed = true;
                return;
            }
        }
        loop {
            match live.output.try_recv() {
                Ok(chunk) => received.push(chunk),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    live.output_closed = true;
                    break;
                }
            }
        }

        let bytes: Vec<u8> = received.concat();
        self.ingest(&bytes);
    }

    fn ingest(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        if self.screen.append(bytes) {
            debug!(session = %self.id, "screen cleared");
        }
        self.last_output_at = Instant::now();
        self.publish();
        let mut pending = std::mem::take(&mut self.partial_char);
        pending.extend_from_slice(bytes);
        let split = pending.len() - incomplete_utf8_tail(&pending);
        self.partial_char = pending.split_off(split);
        let text = strip_ansi(&pending);
        if !text.is_empty() {
            self.events.emit(&DriverEvent::Output {
                session: self.id.clone(),
                text,
            });
        }
    }

    /// `Some(code)` once the child has exited.
    fn exit_status(&mut self) -> Option<Option<u32>> {
        let live = self.live.as_ref()?;
        match lock(&live.control).try_wait() {
            Ok(Some(exit)) => Some(exit.code),
            Ok(None) => None,
            Err(err) => {
                warn!(session = %self.id, error = %err, "try_wait failed");
                None
            }
        }
    }

    fn on_permission_prompt(&mut self, pattern: Option<String>) {
        let auto_approved = self.config.auto_approve_permissions;
        info!(session = %self.id, pattern = ?pattern, auto_approved, "permission prompt");
        self.events.emit(&DriverEvent::PermissionRequested {
            session: self.id.clone(),
            pattern,
            auto_approved,
        });
        if !auto_approved {
            return;
        }
        let Some(live) = self.live.as_mut() else {
            return;
        };
        let keys = self.config.approval_keys.as_bytes();
        match live.input.write_all(keys).and_then(|()| live.input.flush()) {
            Ok(()) => {
                // The answered prompt must leave the live frame for the latch to release.
                self.screen.clear();
                self.last_output_at = Instant::now();
            }
            Err(err) => warn!(session = %self.id, error = %err, "approval write failed"),
        }
    }

    fn terminate(&self, mut live: LiveSession) {
        self.probe.attach(None);
        let mut control = lock(&live.control);
        if matches!(control.try_wait(), Ok(Some(_))) {
            return;
        }

        match control.interrupt() {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::Unsupported => {
                let _ = live
                    .input
                    .write_all(INTERRUPT_BYTE)
                    .and_then(|()| live.input.flush());
            }
            Err(err) => warn!(session = %self.id, error = %err, "interrupt failed"),
        }
        if wait_for_exit(&mut **control, self.config.stop_grace()) {
            debug!(session = %self.id, "exited after interrupt");
            return;
        }

        if let Err(err) = control.kill() {
            warn!(session = %self.id, error = %err, "kill failed");
        }
        if !wait_for_exit(&mut **control, REAP_TIMEOUT) {
            warn!(session = %self.id, pid = ?live.pid, "child not reaped after kill");
        }
    }

    fn set_state(&mut self, to: SessionState) {
        let from = self.state;
        self.state = to;
        self.publish();
        if from != to {
            debug!(session = %self.id, %from, %to, "state changed");
            self.events.emit(&DriverEvent::StateChanged {
                session: self.id.clone(),
                from,
                to,
            });
        }
    }

    fn publish(&self) {
        let state = self.state;
        let pid = self.pid();
        let busy_since = self.busy_since;
        let last_output_at = Some(self.last_output_at);
        let total_bytes = self.screen.total_bytes();
        self.probe.update(|snapshot| {
            *snapshot = ProbeSnapshot {
                state,
                pid,
                busy_since,
                last_output_at,
                total_bytes,
            };
        });
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        if let Some(live) = self.live.take() {
            self.terminate(live);
        }
    }
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("pid", &self.pid())
            .finish_non_exhaustive()
    }
}

fn wait_for_exit(control: &mut dyn ProcessControl, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if matches!(control.try_wait(), Ok(Some(_))) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(REAP_POLL);
    }
}
