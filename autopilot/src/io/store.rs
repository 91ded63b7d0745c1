//! Task queue seam and its reference implementations.
//!
//! The dispatch loop only talks to [`TaskQueue`]. `MemoryQueue` keeps tasks in
//! memory, `FileQueue` rewrites a JSON task file atomically on every status
//! change, and `SharedQueue` lets several workers claim from one queue.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use tracing::debug;

use crate::core::task::{Task, TaskId, TaskStatus};

pub trait TaskQueue {
    /// First pending task in FIFO order, without claiming it.
    fn next_pending(&mut self) -> Result<Option<Task>>;

    /// Apply one status transition and persist it. Returns the updated task.
    fn update_status(
        &mut self,
        id: TaskId,
        status: TaskStatus,
        output: Option<String>,
        error: Option<String>,
    ) -> Result<Task>;

    /// Move the next pending task to `processing` and return it.
    fn claim_next(&mut self) -> Result<Option<Task>> {
        let Some(task) = self.next_pending()? else {
            return Ok(None);
        };
        self.update_status(task.id, TaskStatus::Processing, None, None)
            .map(Some)
    }
}

/// Apply a requested status through the task's transition methods.
pub fn apply_status(
    task: &mut Task,
    status: TaskStatus,
    output: Option<String>,
    error: Option<String>,
) -> Result<()> {
    let now = Utc::now();
    match status {
        TaskStatus::Processing => task.begin()?,
        TaskStatus::Completed => task.complete(output, now)?,
        TaskStatus::Error => task.fail(error.unwrap_or_default(), now)?,
        TaskStatus::Pending => task.requeue()?,
    }
    Ok(())
}

#[derive(Debug, Clone, Default)]
pub struct MemoryQueue {
    tasks: Vec<Task>,
    next_id: TaskId,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            next_id: 1,
        }
    }

    pub fn from_tasks(tasks: Vec<Task>) -> Self {
        let next_id = tasks.iter().map(|task| task.id).max().unwrap_or(0) + 1;
        Self { tasks, next_id }
    }

    pub fn push(&mut self, text: impl Into<String>) -> TaskId {
        self.push_with_checks(text, Vec::<String>::new())
    }

    pub fn push_with_checks<I, S>(&mut self, text: impl Into<String>, checks: I) -> TaskId
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let id = self.next_id.max(1);
        self.next_id = id + 1;
        self.tasks.push(Task::new(id, text).with_checks(checks));
        id
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn get(&self, id: TaskId) -> Option<&Task> {
        self.tasks.iter().find(|task| task.id == id)
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|task| task.status == status).count()
    }

    /// Append tasks whose ids are not queued yet. Known ids keep their local
    /// state. Returns how many were added.
    pub fn merge(&mut self, tasks: Vec<Task>) -> usize {
        let mut added = 0;
        for task in tasks {
            if self.get(task.id).is_some() {
                continue;
            }
            self.next_id = self.next_id.max(task.id + 1);
            self.tasks.push(task);
            added += 1;
        }
        added
    }
}

impl TaskQueue for MemoryQueue {
    fn next_pending(&mut self) -> Result<Option<Task>> {
        Ok(self
            .tasks
            .iter()
            .find(|task| task.status == TaskStatus::Pending)
            .cloned())
    }

    fn update_status(
        &mut self,
        id: TaskId,
        status: TaskStatus,
        output: Option<String>,
        error: Option<String>,
    ) -> Result<Task> {
        let task = self
            .tasks
            .iter_mut()
            .find(|task| task.id == id)
            .ok_or_else(|| anyhow!("unknown task {id}"))?;
        apply_status(task, status, output, error)?;
        Ok(task.clone())
    }
}

/// A [`MemoryQueue`] mirrored to a JSON task file.
///
/// Other processes may append tasks to the file while the queue runs. The
/// file is re-read before every lookup and every write, so appended tasks
/// are picked up and never overwritten.
#[derive(Debug)]
pub struct FileQueue {
    path: PathBuf,
    inner: MemoryQueue,
}

impl FileQueue {
    /// Open `path`, starting empty when the file does not exist yet.
    pub fn open(path: &Path) -> Result<Self> {
        let tasks = if path.exists() {
            load_tasks(path)?
        } else {
            Vec::new()
        };
        Ok(Self {
            path: path.to_path_buf(),
            inner: MemoryQueue::from_tasks(tasks),
        })
    }

    pub fn push_with_checks<I, S>(&mut self, text: impl Into<String>, checks: I) -> Result<TaskId>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.refresh()?;
        let id = self.inner.push_with_checks(text, checks);
        self.save()?;
        Ok(id)
    }

    pub fn tasks(&self) -> &[Task] {
        self.inner.tasks()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Pull in tasks appended to the file since the last read.
    pub fn refresh(&mut self) -> Result<usize> {
        if !self.path.exists() {
            return Ok(0);
        }
        let added = self.inner.merge(load_tasks(&self.path)?);
        if added > 0 {
            debug!(path = %self.path.display(), added, "picked up appended tasks");
        }
        Ok(added)
    }

    fn save(&self) -> Result<()> {
        save_tasks(&self.path, self.inner.tasks())
    }
}

impl TaskQueue for FileQueue {
    fn next_pending(&mut self) -> Result<Option<Task>> {
        self.refresh()?;
        self.inner.next_pending()
    }

    fn update_status(
        &mut self,
        id: TaskId,
        status: TaskStatus,
        output: Option<String>,
        error: Option<String>,
    ) -> Result<Task> {
        self.refresh()?;
        let task = self.inner.update_status(id, status, output, error)?;
        self.save()?;
        Ok(task)
    }
}

/// Mutex-wrapped queue shared by distributor workers.
#[derive(Debug)]
pub struct SharedQueue<Q> {
    inner: Arc<Mutex<Q>>,
}

impl<Q> Clone for SharedQueue<Q> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<Q: TaskQueue> SharedQueue<Q> {
    pub fn new(queue: Q) -> Self {
        Self {
            inner: Arc::new(Mutex::new(queue)),
        }
    }

    /// Run `f` with exclusive access to the underlying queue.
    pub fn with<R>(&self, f: impl FnOnce(&mut Q) -> R) -> R {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut *guard)
    }
}

impl<Q: TaskQueue> TaskQueue for SharedQueue<Q> {
    fn next_pending(&mut self) -> Result<Option<Task>> {
        self.with(|queue| queue.next_pending())
    }

    fn update_status(
        &mut self,
        id: TaskId,
        status: TaskStatus,
        output: Option<String>,
        error: Option<String>,
    ) -> Result<Task> {
        self.with(|queue| queue.update_status(id, status, output, error))
    }

    fn claim_next(&mut self) -> Result<Option<Task>> {
        // One lock for find + claim, so two workers never claim the same task.
        self.with(|queue| queue.claim_next())
    }
}

/// Load a JSON array of tasks.
pub fn load_tasks(path: &Path) -> Result<Vec<Task>> {
    debug!(path = %path.display(), "loading task file");
    let contents =
        fs::read_to_string(path).with_context(|| format!("read task file {}", path.display()))?;
    let tasks: Vec<Task> = serde_json::from_str(&contents)
        .with_context(|| format!("parse task file {}", path.display()))?;
    Ok(tasks)
}

/// Atomically write tasks to disk (temp file + rename).
pub fn save_tasks(path: &Path, tasks: &[Task]) -> Result<()> {
    debug!(path = %path.display(), count = tasks.len(), "writing task file");
    let mut buf = serde_json::to_string_pretty(tasks).context("serialize tasks")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp task file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace task file {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claims_in_fifo_order() {
        let mut queue = MemoryQueue::new();
        let first = queue.push("one");
        queue.push("two");

        let claimed = queue.claim_next().expect("claim").expect("task");
        assert_eq!(claimed.id, first);
        assert_eq!(claimed.status, TaskStatus::Processing);
        assert_eq!(queue.next_pending().expect("peek").map(|t| t.text), Some("two".to_string()));
    }

    #[test]
    fn illegal_transition_is_an_error() {
        let mut queue = MemoryQueue::new();
        let id = queue.push("one");
        let err = queue
            .update_status(id, TaskStatus::Completed, None, None)
            .unwrap_err();
        assert!(err.to_string().contains("illegal transition"));
    }

    #[test]
    fn file_queue_persists_every_transition() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("tasks.json");

        let mut queue = FileQueue::open(&path).expect("open");
        let id = queue.push_with_checks("hello", ["lint"]).expect("push");
        queue.claim_next().expect("claim");
        queue
            .update_status(id, TaskStatus::Completed, Some("hi".to_string()), None)
            .expect("complete");

        let reloaded = load_tasks(&path).expect("load");
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded[0].status, TaskStatus::Completed);
        assert_eq!(reloaded[0].output.as_deref(), Some("hi"));
        assert_eq!(reloaded[0].attached_checks, vec!["lint"]);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn file_queue_picks_up_tasks_appended_by_another_process() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("tasks.json");
        let mut queue = FileQueue::open(&path).expect("open");
        let first = queue.push_with_checks("first", Vec::<String>::new()).expect("push");
        queue.claim_next().expect("claim");

        let mut on_disk = load_tasks(&path).expect("load");
        on_disk.push(Task::new(99, "appended"));
        save_tasks(&path, &on_disk).expect("append");

        let next = queue.next_pending().expect("peek").expect("appended task");
        assert_eq!(next.id, 99);
        queue
            .update_status(first, TaskStatus::Completed, None, None)
            .expect("complete");

        let reloaded = load_tasks(&path).expect("reload");
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded[0].status, TaskStatus::Completed);
        assert_eq!(reloaded[1].id, 99);
        assert_eq!(reloaded[1].status, TaskStatus::Pending);
        assert_eq!(queue.push_with_checks("later", Vec::<String>::new()).expect("push"), 100);
    }

    #[test]
    fn appended_task_written_between_claim_and_save_survives() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("tasks.json");
        let mut queue = FileQueue::open(&path).expect("open");
        let first = queue.push_with_checks("first", Vec::<String>::new()).expect("push");
        queue.claim_next().expect("claim");

        let mut on_disk = load_tasks(&path).expect("load");
        on_disk.push(Task::new(7, "late"));
        save_tasks(&path, &on_disk).expect("append");
        queue
            .update_status(first, TaskStatus::Error, None, Some("boom".to_string()))
            .expect("fail");

        let ids: Vec<TaskId> = load_tasks(&path).expect("reload").iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![first, 7]);
    }

    #[test]
    fn reopened_file_queue_continues_ids() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("tasks.json");
        let mut queue = FileQueue::open(&path).expect("open");
        queue.push_with_checks("a", Vec::<String>::new()).expect("push");

        let mut reopened = FileQueue::open(&path).expect("reopen");
        let id = reopened.push_with_checks("b", Vec::<String>::new()).expect("push");
        assert_eq!(id, 2);
    }

    #[test]
    fn shared_queue_claims_each_task_once() {
        let mut queue = MemoryQueue::new();
        for text in ["a", "b", "c"] {
            queue.push(text);
        }
        let shared = SharedQueue::new(queue);

        let mut workers = [shared.clone(), shared.clone()];
        let mut claimed = Vec::new();
        for round in 0..4 {
            if let Some(task) = workers[round % 2].claim_next().expect("claim") {
                claimed.push(task.id);
            }
        }
        assert_eq!(claimed, vec![1, 2, 3]);
        assert_eq!(shared.with(|q| q.count(TaskStatus::Processing)), 3);
    }
}
