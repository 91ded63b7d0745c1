//! Stable exit codes for autopilot CLI commands.

/// Every task completed, or the command succeeded.
pub const OK: i32 = 0;
/// Invalid config, pattern set, task file or arguments, or another error.
pub const INVALID: i32 = 1;
/// The run finished but at least one task ended in `error`.
pub const TASKS_FAILED: i32 = 2;
/// An in-flight task was cancelled and left `processing`.
pub const INTERRUPTED: i32 = 3;
