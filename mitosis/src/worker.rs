//! Background driver that runs a task's steps in plan order.
//!
//! Request handlers only enqueue; the tool calls happen here. At most one
//! driver runs per `task_id`, drivers for different tasks run concurrently.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::core::selector::next_runnable_step;
use crate::engine::TaskEngine;
use crate::error::EngineError;
use crate::io::config::MitosisConfig;
use crate::task::TaskStatus;

/// Why a driver stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriveStop {
    /// The task reached `completed` or `failed_step_retries`.
    Finished(TaskStatus),
    Cancelled,
    /// Another caller holds the open step in `executing`.
    Busy { step_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriveOutcome {
    pub task_id: String,
    /// Tool invocations made by this driver, retries included.
    pub attempts: u32,
    pub stop: DriveStop,
}

#[derive(Clone)]
pub struct TaskWorker {
    engine: Arc<TaskEngine>,
    active: Arc<Mutex<HashSet<String>>>,
    retry_delay: Duration,
}

impl TaskWorker {
    pub fn new(engine: Arc<TaskEngine>, retry_delay: Duration) -> Self {
        Self {
            engine,
            active: Arc::new(Mutex::new(HashSet::new())),
            retry_delay,
        }
    }

    pub fn from_config(engine: Arc<TaskEngine>, config: &MitosisConfig) -> Self {
        Self::new(engine, Duration::from_millis(config.retry.retry_delay_ms))
    }

    pub fn engine(&self) -> &Arc<TaskEngine> {
        &self.engine
    }

    /// Spawn a driver for `task_id`. Returns false if one is already running.
    pub fn enqueue(&self, task_id: &str) -> bool {
        let Some(guard) = ActiveGuard::claim(&self.active, task_id) else {
            debug!(task_id, "driver already running");
            return false;
        };
        let worker = self.clone();
        let task_id = task_id.to_string();
        tokio::spawn(async move {
            let _guard = guard;
            match worker.drive(&task_id).await {
                Ok(outcome) => info!(task_id, attempts = outcome.attempts, stop = ?outcome.stop, "driver stopped"),
                Err(err) => warn!(task_id, err = %err, "driver aborted"),
            }
        });
        true
    }

    /// Drive `task_id` on the current task until it stops.
    pub async fn run(&self, task_id: &str) -> Result<DriveOutcome, EngineError> {
        let Some(_guard) = ActiveGuard::claim(&self.active, task_id) else {
            return Ok(DriveOutcome {
                task_id: task_id.to_string(),
                attempts: 0,
                stop: DriveStop::Busy {
                    step_id: String::new(),
                },
            });
        };
        self.drive(task_id).await
    }

    pub fn is_active(&self, task_id: &str) -> bool {
        lock(&self.active).contains(task_id)
    }

    async fn drive(&self, task_id: &str) -> Result<DriveOutcome, EngineError> {
        let mut attempts = 0u32;
        let outcome = |attempts, stop| DriveOutcome {
            task_id: task_id.to_string(),
            attempts,
            stop,
        };

        let mut task = self.engine.fetch_task(task_id).await?;
        if task.status == TaskStatus::Created {
            task = self.engine.start_task(task_id).await?;
        }

        loop {
            match task.status {
                TaskStatus::Cancelled => return Ok(outcome(attempts, DriveStop::Cancelled)),
                status if status.is_terminal() => return Ok(outcome(attempts, DriveStop::Finished(status))),
                _ => {}
            }
            let Some(step) = next_runnable_step(&task) else {
                let step_id = task
                    .plan
                    .iter()
                    .find(|step| !step.status.is_terminal())
                    .map(|step| step.id.clone())
                    .unwrap_or_default();
                return Ok(outcome(attempts, DriveStop::Busy { step_id }));
            };
            let step_id = step.id.clone();

            attempts += 1;
            match self.engine.execute_step(task_id, &step_id).await {
                Ok(result) if result.should_retry => {
                    debug!(task_id, step_id, retry_count = result.retry_count, "retrying after delay");
                    tokio::time::sleep(self.retry_delay).await;
                }
                Ok(_) => {}
                Err(EngineError::TaskCancelled { .. }) => return Ok(outcome(attempts, DriveStop::Cancelled)),
                Err(EngineError::StepAlreadyExecuting { step_id }) => {
                    return Ok(outcome(attempts, DriveStop::Busy { step_id }));
                }
                Err(err) => return Err(err),
            }
            task = self.engine.fetch_task(task_id).await?;
        }
    }
}

/// Membership in the active set, released on drop.
struct ActiveGuard {
    active: Arc<Mutex<HashSet<String>>>,
    task_id: String,
}

impl ActiveGuard {
    fn claim(active: &Arc<Mutex<HashSet<String>>>, task_id: &str) -> Option<Self> {
        if !lock(active).insert(task_id.to_string()) {
            return None;
        }
        Some(Self {
            active: Arc::clone(active),
            task_id: task_id.to_string(),
        })
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        lock(&self.active).remove(&self.task_id);
    }
}

fn lock(active: &Mutex<HashSet<String>>) -> std::sync::MutexGuard<'_, HashSet<String>> {
    active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::memory_store::MemoryStore;
    use crate::io::tools::Tool;
    use crate::test_support::{ScriptedTool, engine_with, new_task_with_steps};

    fn worker(tool: Arc<ScriptedTool>) -> TaskWorker {
        let engine = engine_with(Arc::new(MemoryStore::new()), vec![tool as Arc<dyn Tool>]);
        TaskWorker::new(Arc::new(engine), Duration::ZERO)
    }

    #[tokio::test]
    async fn drives_all_steps_in_order() {
        let tool = Arc::new(ScriptedTool::always_succeeding());
        let worker = worker(tool.clone());
        worker
            .engine()
            .create_task(new_task_with_steps("t1", ScriptedTool::NAME, 3))
            .await
            .expect("create");

        let outcome = worker.run("t1").await.expect("drive");
        assert_eq!(outcome.stop, DriveStop::Finished(TaskStatus::Completed));
        assert_eq!(outcome.attempts, 3);
        assert_eq!(tool.calls(), 3);
        assert!(!worker.is_active("t1"));
    }

    #[tokio::test]
    async fn retries_until_success() {
        let tool = Arc::new(ScriptedTool::succeed_after(2));
        let worker = worker(tool.clone());
        worker
            .engine()
            .create_task(new_task_with_steps("t1", ScriptedTool::NAME, 1))
            .await
            .expect("create");

        let outcome = worker.run("t1").await.expect("drive");
        assert_eq!(outcome.stop, DriveStop::Finished(TaskStatus::Completed));
        assert_eq!(outcome.attempts, 3);
        let task = worker.engine().fetch_task("t1").await.expect("fetch");
        assert_eq!(task.plan[0].retry_count, 2);
    }

    #[tokio::test]
    async fn exhausted_step_does_not_block_later_steps() {
        let tool = Arc::new(ScriptedTool::new(
            (0..5).map(|n| Err(format!("err {n}"))).collect(),
            Ok("ok".to_string()),
        ));
        let worker = worker(tool.clone());
        worker
            .engine()
            .create_task(new_task_with_steps("t1", ScriptedTool::NAME, 2))
            .await
            .expect("create");

        let outcome = worker.run("t1").await.expect("drive");
        assert_eq!(outcome.stop, DriveStop::Finished(TaskStatus::FailedStepRetries));
        assert_eq!(tool.calls(), 6);
        let task = worker.engine().fetch_task("t1").await.expect("fetch");
        assert_eq!(task.plan[1].status, crate::task::StepStatus::Completed);
    }

    #[tokio::test]
    async fn cancelled_task_is_not_driven() {
        let tool = Arc::new(ScriptedTool::always_succeeding());
        let worker = worker(tool.clone());
        worker
            .engine()
            .create_task(new_task_with_steps("t1", ScriptedTool::NAME, 1))
            .await
            .expect("create");
        worker.engine().cancel_task("t1").await.expect("cancel");

        let outcome = worker.run("t1").await.expect("drive");
        assert_eq!(outcome.stop, DriveStop::Cancelled);
        assert_eq!(tool.calls(), 0);
    }
}
