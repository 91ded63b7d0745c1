//! Quality checks attached to tasks.
//!
//! Checks run only after a task's response completed. Each check id maps to a
//! configured shell command; the first failing check stops the run.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use wait_timeout::ChildExt;

use crate::core::task::TaskId;

pub const DEFAULT_CHECK_TIMEOUT_SECS: u64 = 10 * 60;
/// Lines of command output kept as error detail for a failed check.
const ERROR_TAIL_LINES: usize = 20;
/// Bytes of each output stream kept while a check runs.
const OUTPUT_TAIL_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub check_id: String,
    pub passed: bool,
    pub errors: Vec<String>,
}

impl CheckResult {
    pub fn pass(check_id: impl Into<String>) -> Self {
        Self {
            check_id: check_id.into(),
            passed: true,
            errors: Vec::new(),
        }
    }

    pub fn fail(check_id: impl Into<String>, errors: Vec<String>) -> Self {
        Self {
            check_id: check_id.into(),
            passed: false,
            errors,
        }
    }
}

pub trait CheckRunner: Send + Sync {
    /// Run `check_ids` in order, stopping after the first failure.
    fn run(&self, task_id: TaskId, check_ids: &[String]) -> Result<Vec<CheckResult>>;
}

/// One configured check command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckCommand {
    pub command: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for CheckCommand {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            timeout_secs: DEFAULT_CHECK_TIMEOUT_SECS,
        }
    }
}

/// Runs configured commands with a timeout, like a CI guard.
#[derive(Debug, Clone, Default)]
pub struct ShellCheckRunner {
    checks: BTreeMap<String, CheckCommand>,
    workdir: Option<PathBuf>,
}

impl ShellCheckRunner {
    pub fn new(checks: BTreeMap<String, CheckCommand>, workdir: Option<PathBuf>) -> Self {
        Self { checks, workdir }
    }

    fn run_one(&self, task_id: TaskId, check_id: &str) -> Result<CheckResult> {
        let Some(check) = self.checks.get(check_id) else {
            return Ok(CheckResult::fail(
                check_id,
                vec![format!("unknown check {check_id:?}")],
            ));
        };
        let Some((program, args)) = check.command.split_first() else {
            return Ok(CheckResult::fail(
                check_id,
                vec![format!("check {check_id:?} has an empty command")],
            ));
        };

        debug!(task_id, check_id, program = %program, "running check");
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(workdir) = &self.workdir {
            cmd.current_dir(workdir);
        }
        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawn check {check_id}"))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("stdout was not piped"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("stderr was not piped"))?;
        let stdout_handle = thread::spawn(move || read_tail(stdout, OUTPUT_TAIL_BYTES));
        let stderr_handle = thread::spawn(move || read_tail(stderr, OUTPUT_TAIL_BYTES));

        let timeout = Duration::from_secs(check.timeout_secs);
        let status = match child
            .wait_timeout(timeout)
            .with_context(|| format!("wait for check {check_id}"))?
        {
            Some(status) => status,
            None => {
                child.kill().context("kill check process")?;
                child.wait().context("wait check process")?;
                let _ = join_output(stdout_handle);
                let _ = join_output(stderr_handle);
                warn!(task_id, check_id, ?timeout, "check timed out");
                return Ok(CheckResult::fail(
                    check_id,
                    vec![format!("timed out after {timeout:?}")],
                ));
            }
        };

        let stdout = join_output(stdout_handle).context("join check stdout")?;
        let stderr = join_output(stderr_handle).context("join check stderr")?;
        if status.success() {
            return Ok(CheckResult::pass(check_id));
        }

        let mut output = String::from_utf8_lossy(&stdout).into_owned();
        if !output.is_empty() && !output.ends_with('\n') {
            output.push('\n');
        }
        output.push_str(&String::from_utf8_lossy(&stderr));
        let mut errors = tail_lines(&output, ERROR_TAIL_LINES);
        errors.insert(0, format!("exit status {status}"));
        Ok(CheckResult::fail(check_id, errors))
    }
}

impl CheckRunner for ShellCheckRunner {
    fn run(&self, task_id: TaskId, check_ids: &[String]) -> Result<Vec<CheckResult>> {
        let mut results = Vec::with_capacity(check_ids.len());
        for check_id in check_ids {
            let result = self.run_one(task_id, check_id)?;
            let passed = result.passed;
            results.push(result);
            if !passed {
                break;
            }
        }
        Ok(results)
    }
}

/// Run a task's attached checks. No checks means nothing to run.
pub fn run_attached_checks(
    runner: &dyn CheckRunner,
    task_id: TaskId,
    check_ids: &[String],
) -> Result<Vec<CheckResult>> {
    if check_ids.is_empty() {
        return Ok(Vec::new());
    }
    runner.run(task_id, check_ids)
}

/// Read a stream to the end, keeping only its last `limit` bytes.
fn read_tail<R: Read>(mut reader: R, limit: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        let n = match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err).context("read check output"),
        };
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > limit * 2 {
            let excess = buf.len() - limit;
            buf.drain(..excess);
        }
    }
    if buf.len() > limit {
        let excess = buf.len() - limit;
        buf.drain(..excess);
    }
    Ok(buf)
}

fn join_output(handle: thread::JoinHandle<Result<Vec<u8>>>) -> Result<Vec<u8>> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn tail_lines(text: &str, limit: usize) -> Vec<String> {
    let lines: Vec<&str> = text.lines().filter(|line| !line.trim().is_empty()).collect();
    let skip = lines.len().saturating_sub(limit);
    lines[skip..].iter().map(|line| (*line).to_string()).collect()
}
