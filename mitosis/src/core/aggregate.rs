//! Task-level status derived from step statuses.

use chrono::{DateTime, Utc};

use crate::core::types::TaskStats;
use crate::task::{Step, StepStatus, Task, TaskStatus};

/// Derive the task status from its steps.
///
/// - `cancelled` is sticky.
/// - All steps `completed` → `completed`.
/// - No step left to run and at least one `failed_after_retries` →
///   `failed_step_retries`.
/// - Any step started, finished, or retried → `executing`.
/// - Otherwise the task keeps its queue status (`created`/`pending`).
pub fn derive_task_status(task: &Task) -> TaskStatus {
    if task.status == TaskStatus::Cancelled {
        return TaskStatus::Cancelled;
    }
    if task.plan.is_empty() {
        return task.status;
    }

    let all_completed = task
        .plan
        .iter()
        .all(|step| step.status == StepStatus::Completed);
    if all_completed {
        return TaskStatus::Completed;
    }

    let any_open = task.plan.iter().any(|step| !step.status.is_terminal());
    let any_exhausted = task
        .plan
        .iter()
        .any(|step| step.status == StepStatus::FailedAfterRetries);
    if !any_open && any_exhausted {
        return TaskStatus::FailedStepRetries;
    }

    if task.plan.iter().any(has_progress) {
        return TaskStatus::Executing;
    }

    if task.status.is_terminal() {
        // Manual override reopened a finished task.
        TaskStatus::Pending
    } else {
        task.status
    }
}

fn has_progress(step: &Step) -> bool {
    step.status != StepStatus::Pending || step.retry_count > 0
}

/// Index of the first step that has not reached a terminal status.
pub fn first_open_index(plan: &[Step]) -> usize {
    plan.iter()
        .position(|step| !step.status.is_terminal())
        .unwrap_or(plan.len())
}

/// Count steps by bucket.
pub fn task_stats(plan: &[Step]) -> TaskStats {
    let mut stats = TaskStats {
        total_steps: plan.len(),
        ..TaskStats::default()
    };
    for step in plan {
        match step.status {
            StepStatus::Completed => stats.completed_steps += 1,
            StepStatus::FailedAfterRetries => stats.failed_steps += 1,
            StepStatus::Executing => stats.in_progress_steps += 1,
            StepStatus::Pending | StepStatus::Failed => stats.remaining_steps += 1,
        }
    }
    stats
}

/// Re-derive status, cursor, and terminal payload after a step transition.
///
/// Returns true if the task entered a terminal status on this call.
pub fn refresh_task(task: &mut Task, now: DateTime<Utc>) -> bool {
    let was_terminal = task.status.is_terminal();
    let status = derive_task_status(task);
    task.status = status;
    task.current_step_index = task.current_step_index.max(first_open_index(&task.plan));
    task.updated_at = now;

    match status {
        TaskStatus::Completed => {
            task.completed_at.get_or_insert(now);
            task.final_result = Some(task.completed_results().join("\n\n"));
            task.error = None;
        }
        TaskStatus::FailedStepRetries => {
            task.completed_at.get_or_insert(now);
            task.error = first_exhausted_error(task);
        }
        TaskStatus::Cancelled => {
            task.completed_at.get_or_insert(now);
        }
        TaskStatus::Created | TaskStatus::Pending | TaskStatus::Executing => {
            task.completed_at = None;
            task.final_result = None;
            task.error = None;
        }
    }

    !was_terminal && status.is_terminal()
}

fn first_exhausted_error(task: &Task) -> Option<String> {
    task.plan
        .iter()
        .find(|step| step.status == StepStatus::FailedAfterRetries)
        .map(|step| {
            format!(
                "step '{}' failed after {} retries: {}",
                step.id,
                step.retry_count,
                step.final_error.as_deref().unwrap_or("unknown error")
            )
        })
}
