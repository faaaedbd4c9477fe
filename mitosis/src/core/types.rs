//! Shared deterministic types for the state-machine core.
//!
//! These types define stable contracts between core components and the
//! transports. They hold no I/O handles and serialize deterministically.

use serde::Serialize;

use crate::task::{StepStatus, Task, TaskStatus};

/// Outcome of one step transition applied by [`crate::core::transitions`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepTransition {
    pub step_id: String,
    pub status: StepStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    /// True when the step went back to `pending` and may be re-invoked.
    pub should_retry: bool,
    /// Task status after re-aggregation.
    pub task_status: TaskStatus,
    /// True when this transition moved the task into a terminal status.
    pub task_finished: bool,
}

/// Client-facing result of `execute_step` / `retry_step`.
///
/// Carries enough state for a UI to render retry progress without another
/// round-trip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepResult {
    pub task_id: String,
    pub step_id: String,
    pub success: bool,
    pub step_completed: bool,
    pub should_retry: bool,
    pub retry_count: u32,
    pub remaining_retries: u32,
    pub step_failed_permanently: bool,
    pub status: StepStatus,
    pub task_status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepResult {
    pub fn from_transition(
        task_id: &str,
        transition: &StepTransition,
        result: Option<String>,
        error: Option<String>,
    ) -> Self {
        let completed = transition.status == StepStatus::Completed;
        Self {
            task_id: task_id.to_string(),
            step_id: transition.step_id.clone(),
            success: completed,
            step_completed: completed,
            should_retry: transition.should_retry,
            retry_count: transition.retry_count,
            remaining_retries: transition.max_retries.saturating_sub(transition.retry_count),
            step_failed_permanently: transition.status == StepStatus::FailedAfterRetries,
            status: transition.status,
            task_status: transition.task_status,
            result,
            error,
        }
    }
}

/// Step counts reported by `get_task_status`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskStats {
    pub total_steps: usize,
    pub completed_steps: usize,
    pub failed_steps: usize,
    pub in_progress_steps: usize,
    pub remaining_steps: usize,
}

/// Read-only projection of a task with its derived status and stats.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskView {
    pub task_id: String,
    pub title: String,
    pub status: TaskStatus,
    pub current_step_index: usize,
    pub plan: Vec<crate::task::Step>,
    pub stats: TaskStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskView {
    pub fn new(task: Task, status: TaskStatus, stats: TaskStats) -> Self {
        Self {
            task_id: task.task_id,
            title: task.title,
            status,
            current_step_index: task.current_step_index,
            plan: task.plan,
            stats,
            final_result: task.final_result,
            error: task.error,
        }
    }
}
