//! Engine-owned step transitions.
//!
//! ```text
//! pending   --(execute)-->                              executing
//! executing --(tool success)-->                         completed            [terminal]
//! executing --(tool failure, retry_count <  max)-->     pending              [retry_count += 1]
//! executing --(tool failure, retry_count == max)-->     failed_after_retries [terminal]
//! ```
//!
//! Every function mutates an in-memory [`Task`] and re-aggregates its status.
//! Persisting the result is the caller's job.

use chrono::{DateTime, Utc};

use crate::core::aggregate::refresh_task;
use crate::core::retry::RetryPolicy;
use crate::core::selector::blocking_step;
use crate::core::types::StepTransition;
use crate::error::EngineError;
use crate::task::{RetryAttempt, Step, StepStatus, Task, TaskStatus};

/// Check every precondition for moving `step_id` into `executing`.
///
/// Returns the step's index in the plan.
pub fn check_executable(task: &Task, step_id: &str) -> Result<usize, EngineError> {
    if task.status == TaskStatus::Cancelled {
        return Err(EngineError::TaskCancelled {
            task_id: task.task_id.clone(),
        });
    }

    let index = task
        .step_index(step_id)
        .ok_or_else(|| EngineError::StepNotFound {
            task_id: task.task_id.clone(),
            step_id: step_id.to_string(),
        })?;
    let step = &task.plan[index];

    match step.status {
        StepStatus::FailedAfterRetries => {
            return Err(EngineError::RetryExhausted {
                step_id: step_id.to_string(),
                max_retries: task.max_step_retries,
            });
        }
        StepStatus::Completed => {
            return Err(EngineError::StepAlreadyCompleted {
                step_id: step_id.to_string(),
            });
        }
        StepStatus::Executing => {
            return Err(EngineError::StepAlreadyExecuting {
                step_id: step_id.to_string(),
            });
        }
        StepStatus::Pending | StepStatus::Failed => {}
    }

    if let Some(blocking) = blocking_step(task, index) {
        return Err(EngineError::out_of_order(
            step_id,
            &blocking.id,
            blocking.status,
        ));
    }

    Ok(index)
}

/// Move a runnable step into `executing`.
///
/// This is the compare-and-swap body: it refuses unless the step is runnable
/// and the task is not cancelled. Ordering is checked separately by
/// [`check_executable`].
pub fn begin_step(task: &mut Task, step_id: &str, now: DateTime<Utc>) -> bool {
    if task.status == TaskStatus::Cancelled {
        return false;
    }
    let Some(step) = task.step_mut(step_id) else {
        return false;
    };
    if !step.status.is_runnable() {
        return false;
    }
    step.status = StepStatus::Executing;
    step.started_at = Some(now);
    task.status = TaskStatus::Executing;
    task.updated_at = now;
    true
}

/// Record a successful tool call.
pub fn record_success(
    task: &mut Task,
    step_id: &str,
    result: String,
    now: DateTime<Utc>,
) -> Result<StepTransition, EngineError> {
    let step = executing_step(task, step_id)?;
    step.status = StepStatus::Completed;
    step.completed_at = Some(now);
    step.result = Some(result);
    let retry_count = step.retry_count;

    Ok(finish(task, step_id, StepStatus::Completed, retry_count, false, now))
}

/// Record a failed tool call and let the retry policy pick the next status.
///
/// The cap is the task's own `max_step_retries`.
pub fn record_failure(
    task: &mut Task,
    step_id: &str,
    error: String,
    now: DateTime<Utc>,
) -> Result<StepTransition, EngineError> {
    let policy = RetryPolicy::new(task.max_step_retries);
    let step = executing_step(task, step_id)?;
    step.retry_attempts.push(RetryAttempt {
        timestamp: now,
        error: error.clone(),
    });
    step.retry_count += 1;

    let decision = policy.decide(step.retry_count);
    let status = if decision.retry {
        StepStatus::Pending
    } else {
        step.final_error.get_or_insert(error);
        StepStatus::FailedAfterRetries
    };
    step.status = status;
    let retry_count = step.retry_count;

    Ok(finish(task, step_id, status, retry_count, decision.retry, now))
}

/// Manual override: mark a step done or not done without consulting the
/// retry policy.
///
/// Returns `Ok(false)` when the step already had the requested status.
/// An exhausted step is terminal: its retry count and final error stay as
/// recorded, so it refuses both directions.
pub fn override_step(
    task: &mut Task,
    step_id: &str,
    completed: bool,
    now: DateTime<Utc>,
) -> Result<bool, EngineError> {
    if task.status == TaskStatus::Cancelled {
        return Err(EngineError::TaskCancelled {
            task_id: task.task_id.clone(),
        });
    }
    let task_id = task.task_id.clone();
    let max_retries = task.max_step_retries;
    let step = task
        .step_mut(step_id)
        .ok_or_else(|| EngineError::StepNotFound {
            task_id,
            step_id: step_id.to_string(),
        })?;

    match step.status {
        StepStatus::Executing => {
            return Err(EngineError::StepAlreadyExecuting {
                step_id: step_id.to_string(),
            });
        }
        StepStatus::FailedAfterRetries => {
            return Err(EngineError::RetryExhausted {
                step_id: step_id.to_string(),
                max_retries,
            });
        }
        StepStatus::Pending | StepStatus::Completed | StepStatus::Failed => {}
    }

    let target = if completed {
        StepStatus::Completed
    } else {
        StepStatus::Failed
    };
    if step.status == target {
        return Ok(false);
    }

    step.status = target;
    if completed {
        step.completed_at = Some(now);
    } else {
        step.completed_at = None;
        step.result = None;
    }

    refresh_task(task, now);
    Ok(true)
}

/// Cancel a task. Returns false if it was already terminal.
pub fn cancel(task: &mut Task, now: DateTime<Utc>) -> bool {
    if task.status.is_terminal() {
        return false;
    }
    task.status = TaskStatus::Cancelled;
    refresh_task(task, now);
    true
}

fn executing_step<'a>(task: &'a mut Task, step_id: &str) -> Result<&'a mut Step, EngineError> {
    let task_id = task.task_id.clone();
    let max_retries = task.max_step_retries;
    let step = task
        .step_mut(step_id)
        .ok_or_else(|| EngineError::StepNotFound {
            task_id,
            step_id: step_id.to_string(),
        })?;
    match step.status {
        StepStatus::Executing => Ok(step),
        StepStatus::FailedAfterRetries => Err(EngineError::RetryExhausted {
            step_id: step_id.to_string(),
            max_retries,
        }),
        StepStatus::Completed => Err(EngineError::StepAlreadyCompleted {
            step_id: step_id.to_string(),
        }),
        StepStatus::Pending | StepStatus::Failed => Err(EngineError::StepNotExecuting {
            step_id: step_id.to_string(),
        }),
    }
}

fn finish(
    task: &mut Task,
    step_id: &str,
    status: StepStatus,
    retry_count: u32,
    should_retry: bool,
    now: DateTime<Utc>,
) -> StepTransition {
    let task_finished = refresh_task(task, now);
    StepTransition {
        step_id: step_id.to_string(),
        status,
        retry_count,
        max_retries: task.max_step_retries,
        should_retry,
        task_status: task.status,
        task_finished,
    }
}
