//! Stable exit codes for `mitosis` CLI commands.

/// Command succeeded; for `run`, the task completed.
pub const OK: i32 = 0;
/// Invalid input, configuration, or an engine/store error.
pub const INVALID: i32 = 1;
/// `mitosis run` finished with a step that exhausted its retries.
pub const TASK_FAILED: i32 = 2;
/// `mitosis run` stopped because the task was cancelled.
pub const CANCELLED: i32 = 3;
