//! Deterministic step selection in plan order.

use crate::task::{Step, StepStatus, Task};

/// First step before `index` that has not reached a terminal status.
///
/// A step may only start once every earlier step is `completed` or
/// `failed_after_retries`.
pub fn blocking_step(task: &Task, index: usize) -> Option<&Step> {
    task.plan
        .iter()
        .take(index)
        .find(|step| !step.status.is_terminal())
}

/// The step a driver should execute next.
///
/// Returns `None` when the task has nothing runnable: either every step is
/// terminal, or the first open step is already `executing`.
pub fn next_runnable_step(task: &Task) -> Option<&Step> {
    let open = task.plan.iter().find(|step| !step.status.is_terminal())?;
    open.status.is_runnable().then_some(open)
}

/// True if the step used up its retry budget.
pub fn is_exhausted(step: &Step) -> bool {
    step.status == StepStatus::FailedAfterRetries
}
