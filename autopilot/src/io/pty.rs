//! Spawning the driven CLI on a pseudo-terminal.
//!
//! A [`Spawner`] turns a [`SpawnRequest`] into a [`SessionHandle`]: an input
//! sink, a channel of output chunks fed by a dedicated reader thread, and a
//! [`ProcessControl`] for liveness and termination. The controller never sees
//! `portable-pty` types, so tests can substitute a scripted process.

use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::Instant;

use portable_pty::{Child, CommandBuilder, MasterPty, PtySize, native_pty_system};
use tracing::{debug, info};

use crate::error::DriverError;

/// How the child exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<u32>,
    pub success: bool,
}

/// What to launch and how big the terminal is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRequest {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub rows: u16,
    pub cols: u16,
}

impl SpawnRequest {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            rows: 50,
            cols: 200,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

/// Liveness and termination for a spawned child.
pub trait ProcessControl: Send {
    /// `Ok(None)` while the child is running.
    fn try_wait(&mut self) -> io::Result<Option<ExitInfo>>;
    /// Deliver an interrupt. `Unsupported` means the caller should write Ctrl-C instead.
    fn interrupt(&mut self) -> io::Result<()>;
    fn kill(&mut self) -> io::Result<()>;
}

/// One live child process. Destroyed and replaced on restart, never reused.
pub struct SessionHandle {
    pub pid: Option<u32>,
    pub input: Box<dyn Write + Send>,
    /// Closed once the child's side of the terminal is gone.
    pub output: Receiver<Vec<u8>>,
    pub started_at: Instant,
    pub control: Box<dyn ProcessControl>,
}

impl SessionHandle {
    pub fn is_alive(&mut self) -> bool {
        matches!(self.control.try_wait(), Ok(None))
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("pid", &self.pid)
            .field("started_at", &self.started_at)
            .finish_non_exhaustive()
    }
}

pub trait Spawner: Send + Sync {
    fn spawn(&self, request: &SpawnRequest) -> Result<SessionHandle, DriverError>;
}

/// Spawns on the platform PTY via `portable-pty`.
#[derive(Debug, Default, Clone, Copy)]
pub struct PtySpawner;

impl Spawner for PtySpawner {
    fn spawn(&self, request: &SpawnRequest) -> Result<SessionHandle, DriverError> {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows: request.rows,
                cols: request.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|err| DriverError::StartupFailed(format!("open pty: {err}")))?;

        let mut cmd = CommandBuilder::new(&request.program);
        cmd.args(&request.args);
        if let Some(cwd) = &request.cwd {
            cmd.cwd(cwd);
        }
        cmd.env("TERM", "xterm-256color");
        for (key, value) in &request.env {
            cmd.env(key, value);
        }

        let child = pair.slave.spawn_command(cmd).map_err(|err| {
            DriverError::StartupFailed(format!("spawn {}: {err}", request.program))
        })?;
        // The child holds its own copy of the slave; ours would keep EOF from arriving.
        drop(pair.slave);

        let pid = child.process_id();
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|err| DriverError::StartupFailed(format!("clone pty reader: {err}")))?;
        let input = pair
            .master
            .take_writer()
            .map_err(|err| DriverError::StartupFailed(format!("take pty writer: {err}")))?;

        let (tx, output) = mpsc::channel();
        thread::Builder::new()
            .name(format!("pty-reader-{}", pid.unwrap_or_default()))
            .spawn(move || pump_output(reader, tx))
            .map_err(|err| DriverError::StartupFailed(format!("spawn reader thread: {err}")))?;

        info!(program = %request.program, pid = ?pid, "spawned pty child");
        Ok(SessionHandle {
            pid,
            input,
            output,
            started_at: Instant::now(),
            control: Box::new(PtyControl {
                child,
                _master: pair.master,
                pid,
            }),
        })
    }
}

/// Forward output chunks until EOF or until the receiver is dropped.
pub fn pump_output(mut reader: Box<dyn Read + Send>, tx: Sender<Vec<u8>>) {
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                // EIO is the normal end of a PTY once the child has exited.
                debug!(error = %err, "pty reader stopped");
                break;
            }
        }
    }
}

struct PtyControl {
    child: Box<dyn Child + Send + Sync>,
    // Dropping the master hangs up the terminal, so it lives as long as the child.
    _master: Box<dyn MasterPty + Send>,
    pid: Option<u32>,
}

impl ProcessControl for PtyControl {
    fn try_wait(&mut self) -> io::Result<Option<ExitInfo>> {
        Ok(self.child.try_wait()?.map(|status| ExitInfo {
            code: Some(status.exit_code()),
            success: status.success(),
        }))
    }

    fn interrupt(&mut self) -> io::Result<()> {
        let Some(pid) = self.pid else {
            return Err(io::Error::new(io::ErrorKind::Unsupported, "pid unknown"));
        };
        signal_interrupt(pid)
    }

    fn kill(&mut self) -> io::Result<()> {
        self.child.kill()
    }
}

#[cfg(unix)]
fn signal_interrupt(pid: u32) -> io::Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid).map_err(|_| io::Error::other("pid out of range"))?;
    // The child leads its own session on the PTY; signal the whole group.
    match signal::killpg(Pid::from_raw(raw), Signal::SIGINT) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(_) => match signal::kill(Pid::from_raw(raw), Signal::SIGINT) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(err) => Err(io::Error::from(err)),
        },
    }
}

#[cfg(not(unix))]
fn signal_interrupt(_pid: u32) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "signals unavailable on this platform",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pump_forwards_chunks_until_eof() {
        let (tx, rx) = mpsc::channel();
        let reader: Box<dyn Read + Send> = Box::new(io::Cursor::new(b"hello pty".to_vec()));
        pump_output(reader, tx);
        let collected: Vec<u8> = rx.iter().flatten().collect();
        assert_eq!(collected, b"hello pty");
    }

    #[test]
    fn request_builder_collects_args() {
        let request = SpawnRequest::new("claude")
            .arg("--verbose")
            .args(["--dangerously-skip-permissions"]);
        assert_eq!(
            request.args,
            vec!["--verbose", "--dangerously-skip-permissions"]
        );
    }
}
