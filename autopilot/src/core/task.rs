//! Task records and their legal status transitions.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type TaskId = u64;

/// Status of a queued task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Error,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Error => "error",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Error)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected status change.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("task {id}: illegal transition {from} -> {to}")]
pub struct TransitionError {
    pub id: TaskId,
    pub from: TaskStatus,
    pub to: TaskStatus,
}

/// One unit of work fed into the driven CLI.
///
/// Fields are public for serialization, but status changes must go through
/// [`Task::begin`], [`Task::complete`] and [`Task::fail`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub text: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub attached_checks: Vec<String>,
}

impl Task {
    pub fn new(id: TaskId, text: impl Into<String>) -> Self {
        Self {
            id,
            text: text.into(),
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            completed_at: None,
            output: None,
            error: None,
            attached_checks: Vec::new(),
        }
    }

    pub fn with_checks<I, S>(mut self, checks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attached_checks = checks.into_iter().map(Into::into).collect();
        self
    }

    /// `pending -> processing`.
    pub fn begin(&mut self) -> Result<(), TransitionError> {
        self.transition(TaskStatus::Pending, TaskStatus::Processing)
    }

    /// `processing -> completed`.
    pub fn complete(
        &mut self,
        output: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.transition(TaskStatus::Processing, TaskStatus::Completed)?;
        self.completed_at = Some(at);
        self.output = output;
        self.error = None;
        Ok(())
    }

    /// `processing -> error`.
    pub fn fail(&mut self, message: impl Into<String>, at: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(TaskStatus::Processing, TaskStatus::Error)?;
        self.completed_at = Some(at);
        self.error = Some(message.into());
        Ok(())
    }

    /// `processing -> pending`. Never done implicitly; callers requeue on purpose.
    pub fn requeue(&mut self) -> Result<(), TransitionError> {
        self.transition(TaskStatus::Processing, TaskStatus::Pending)?;
        self.completed_at = None;
        self.output = None;
        self.error = None;
        Ok(())
    }

    fn transition(&mut self, from: TaskStatus, to: TaskStatus) -> Result<(), TransitionError> {
        if self.status != from {
            return Err(TransitionError {
                id: self.id,
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }
}

/// Reduce an error message to its first line, capped at `limit` characters.
///
/// Task records only ever hold this short form; full diagnostics go to telemetry.
pub fn summarize_error(message: &str, limit: usize) -> String {
    let first_line = message.lines().next().unwrap_or("").trim();
    if first_line.chars().count() <= limit {
        return first_line.to_string();
    }
    let keep = limit.saturating_sub(3);
    let mut out: String = first_line.chars().take(keep).collect();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions() {
        let mut task = Task::new(1, "hello");
        task.begin().expect("begin");
        assert_eq!(task.status, TaskStatus::Processing);

        let now = Utc::now();
        task.complete(Some("done".to_string()), now).expect("complete");
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.completed_at, Some(now));
        assert_eq!(task.output.as_deref(), Some("done"));
    }

    #[test]
    fn cannot_complete_pending_task() {
        let mut task = Task::new(7, "hello");
        let err = task.complete(None, Utc::now()).unwrap_err();
        assert_eq!(err.from, TaskStatus::Pending);
        assert_eq!(err.to, TaskStatus::Completed);
        assert_eq!(task.status, TaskStatus::Pending);
    }

    #[test]
    fn cannot_restart_terminal_task() {
        let mut task = Task::new(2, "x");
        task.begin().expect("begin");
        task.fail("boom", Utc::now()).expect("fail");
        assert!(task.begin().is_err());
        assert_eq!(task.error.as_deref(), Some("boom"));
    }

    #[test]
    fn requeue_returns_processing_task_to_pending() {
        let mut task = Task::new(4, "again");
        assert!(task.requeue().is_err());
        task.begin().expect("begin");
        task.requeue().expect("requeue");
        assert_eq!(task.status, TaskStatus::Pending);
    }

    #[test]
    fn summarize_keeps_first_line_and_truncates() {
        assert_eq!(summarize_error("short\nsecond line", 20), "short");
        let long = "x".repeat(50);
        let summary = summarize_error(&long, 10);
        assert_eq!(summary, "xxxxxxx...");
        assert_eq!(summary.chars().count(), 10);
    }

    #[test]
    fn task_json_uses_lowercase_status() {
        let task = Task::new(3, "hi").with_checks(["lint"]);
        let json = serde_json::to_value(&task).expect("json");
        assert_eq!(json["status"], "pending");
        assert_eq!(json["attached_checks"][0], "lint");
    }
}
