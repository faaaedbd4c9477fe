//! Semantic invariants over a task record.

use std::collections::HashSet;

use crate::core::aggregate::derive_task_status;
use crate::task::{StepStatus, Task, TaskStatus};

/// Check invariants that serde cannot express:
/// - No duplicate step ids
/// - `max_step_retries > 0`
/// - `retry_count <= max_step_retries` and never above the attempt log length
/// - `final_error` set iff the step is `failed_after_retries`
/// - `completed_at` only on `completed` steps
/// - At most one step `executing`
/// - `completed` task iff every step is `completed`
/// - `current_step_index` within the plan
pub fn validate_invariants(task: &Task) -> Vec<String> {
    let mut errors = Vec::new();
    let mut seen = HashSet::new();
    let path = task.task_id.as_str();

    if task.max_step_retries == 0 {
        errors.push(format!("{path}: max_step_retries must be > 0"));
    }
    if task.current_step_index > task.plan.len() {
        errors.push(format!(
            "{path}: current_step_index {} exceeds plan length {}",
            task.current_step_index,
            task.plan.len()
        ));
    }

    let mut executing = 0usize;
    for step in &task.plan {
        let step_path = format!("{path}/{}", step.id);
        if !seen.insert(step.id.as_str()) {
            errors.push(format!("duplicate step id '{}' in {path}", step.id));
        }
        if step.retry_count > task.max_step_retries {
            errors.push(format!(
                "{step_path}: retry_count {} exceeds max_step_retries {}",
                step.retry_count, task.max_step_retries
            ));
        }
        if step.retry_attempts.len() < step.retry_count as usize {
            errors.push(format!(
                "{step_path}: retry_count {} exceeds recorded attempts {}",
                step.retry_count,
                step.retry_attempts.len()
            ));
        }
        let exhausted = step.status == StepStatus::FailedAfterRetries;
        if exhausted != step.final_error.is_some() {
            errors.push(format!(
                "{step_path}: final_error must be set iff status is failed_after_retries"
            ));
        }
        if step.completed_at.is_some() && step.status != StepStatus::Completed {
            errors.push(format!(
                "{step_path}: completed_at set on {} step",
                step.status.as_str()
            ));
        }
        if step.status == StepStatus::Executing {
            executing += 1;
        }
    }

    if executing > 1 {
        errors.push(format!("{path}: {executing} steps executing at once"));
    }

    let all_completed =
        !task.plan.is_empty() && task.plan.iter().all(|s| s.status == StepStatus::Completed);
    if all_completed != (task.status == TaskStatus::Completed)
        && task.status != TaskStatus::Cancelled
    {
        errors.push(format!(
            "{path}: status {} inconsistent with steps (derived {})",
            task.status.as_str(),
            derive_task_status(task).as_str()
        ));
    }

    errors
}
