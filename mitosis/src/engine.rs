//! Task/Step state machine service.
//!
//! The engine is the single writer of task and step statuses. It combines
//! the pure transitions in [`crate::core`] with the store, the cache, the
//! tool registry, and the event broadcaster:
//!
//! - Writes go to the store first, then replace the cache entry.
//! - Moving a step into `executing` is a compare-and-swap in the store, so
//!   overlapping calls for one step run the tool once.
//! - Tool errors, panics, and timeouts become step failures; they never
//!   escape as engine errors.
//! - Broadcast problems are logged and never change an outcome.
//! - A step outcome that could not be written (store outage, dropped
//!   caller) is held in memory and written before the task is next read, so
//!   a step is never left `executing` by a live process.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broadcast::{EventBroadcaster, EventType};
use crate::core::aggregate::{derive_task_status, task_stats};
use crate::core::selector::is_exhausted;
use crate::core::transitions::{
    cancel, check_executable, override_step, record_failure, record_success,
};
use crate::core::types::{StepResult, StepTransition, TaskView};
use crate::error::{BroadcastError, EngineError, StoreError};
use crate::io::cache::TaskCache;
use crate::io::config::MitosisConfig;
use crate::io::store::{ConversationMessage, FileRecord, TaskPatch, TaskStore};
use crate::io::tools::{ToolRegistry, ToolRequest};
use crate::task::{MAX_STEP_RETRIES, Step, StepStatus, Task, TaskStatus};

/// Error recorded for a step whose call never reported back.
pub const INTERRUPTED_ERROR: &str = "interrupted before completion";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub max_step_retries: u32,
    pub cache_capacity: usize,
    pub cache_ttl: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_step_retries: MAX_STEP_RETRIES,
            cache_capacity: 256,
            cache_ttl: Duration::from_secs(30),
        }
    }
}

impl EngineConfig {
    pub fn from_config(config: &MitosisConfig) -> Self {
        Self {
            max_step_retries: config.retry.max_step_retries,
            cache_capacity: config.cache.capacity,
            cache_ttl: Duration::from_secs(config.cache.ttl_secs),
        }
    }
}

/// Input to [`TaskEngine::create_task`].
#[derive(Debug, Clone)]
pub struct NewTask {
    /// Reusing an id replaces the stored task.
    pub task_id: Option<String>,
    pub title: String,
    pub steps: Vec<Step>,
    /// Stored as the first `user` message of the conversation.
    pub origin_message: Option<String>,
}

/// What startup recovery did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub scanned: usize,
    /// Steps found `executing` and recorded as failed attempts.
    pub interrupted_steps: usize,
    /// Tasks that should be handed back to the worker.
    pub requeue: Vec<String>,
}

pub struct TaskEngine {
    store: Arc<dyn TaskStore>,
    cache: TaskCache,
    tools: Arc<ToolRegistry>,
    events: Option<Arc<EventBroadcaster>>,
    max_step_retries: u32,
    /// Step outcomes whose write failed, keyed by task id.
    unsettled: Mutex<HashMap<String, TaskPatch>>,
}

impl TaskEngine {
    pub fn new(store: Arc<dyn TaskStore>, tools: Arc<ToolRegistry>, config: EngineConfig) -> Self {
        Self {
            store,
            cache: TaskCache::new(config.cache_capacity, config.cache_ttl),
            tools,
            events: None,
            max_step_retries: config.max_step_retries,
            unsettled: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_events(mut self, events: Arc<EventBroadcaster>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    pub fn events(&self) -> Option<&Arc<EventBroadcaster>> {
        self.events.as_ref()
    }

    pub fn max_step_retries(&self) -> u32 {
        self.max_step_retries
    }

    /// Create (or replace) a task with every step reset to `pending`.
    pub async fn create_task(&self, new: NewTask) -> Result<Task, EngineError> {
        validate_plan(&new.steps, &self.tools)?;
        let task_id = new
            .task_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let task = Task::new(
            task_id,
            new.title,
            new.steps,
            self.max_step_retries,
            Utc::now(),
        );
        self.store.save_task(&task).await.map_err(|e| persistence(&task.task_id, e))?;
        self.cache.put(&task);
        if let Some(message) = new.origin_message.as_deref() {
            self.record_message(&task.task_id, "user", message).await?;
        }
        info!(task_id = %task.task_id, steps = task.plan.len(), "task created");
        Ok(task)
    }

    /// Move a `created` task to `pending`. Other statuses are left alone.
    pub async fn start_task(&self, task_id: &str) -> Result<Task, EngineError> {
        let mut task = self.fetch_task(task_id).await?;
        match task.status {
            TaskStatus::Cancelled => {
                return Err(EngineError::TaskCancelled {
                    task_id: task_id.to_string(),
                });
            }
            TaskStatus::Created => {}
            _ => return Ok(task),
        }
        task.status = TaskStatus::Pending;
        task.updated_at = Utc::now();
        let stored = self.write_patch(&task, None).await?;
        info!(task_id, "task queued");
        self.publish(task_id, EventType::TaskProgress, progress_payload(&stored));
        Ok(stored)
    }

    /// Run one step through its tool and record the outcome.
    pub async fn execute_step(&self, task_id: &str, step_id: &str) -> Result<StepResult, EngineError> {
        let task = self.fetch_task(task_id).await?;
        check_executable(&task, step_id)?;

        let Some(mut task) = self
            .store
            .begin_step(task_id, step_id, Utc::now())
            .await
            .map_err(|e| persistence(task_id, e))?
        else {
            // Lost the swap: report what the winner left behind.
            let current = self.fetch_task(task_id).await?;
            check_executable(&current, step_id)?;
            return Err(EngineError::StepAlreadyExecuting {
                step_id: step_id.to_string(),
            });
        };
        self.cache.put(&task);

        // Until the outcome is stored, a dropped call counts as interrupted.
        let mut interrupted = task.clone();
        record_failure(&mut interrupted, step_id, INTERRUPTED_ERROR.to_string(), Utc::now())?;
        let mut in_flight = InFlight {
            unsettled: &self.unsettled,
            task_id,
            patch: Some(TaskPatch::from_task(&interrupted, Some(step_id))),
        };

        let step = task
            .step(step_id)
            .cloned()
            .ok_or_else(|| EngineError::StepNotFound {
                task_id: task_id.to_string(),
                step_id: step_id.to_string(),
            })?;
        info!(task_id, step_id, tool = %step.tool, retry_count = step.retry_count, "step executing");
        self.publish(
            task_id,
            EventType::TaskProgress,
            json!({
                "step_id": step_id,
                "step_title": step.title,
                "status": StepStatus::Executing,
                "retry_count": step.retry_count,
                "current_step_index": task.current_step_index,
            }),
        );

        let request = ToolRequest::for_step(&task, &step);
        let outcome = self.tools.execute(&step.tool, &request).await;

        let now = Utc::now();
        let (transition, result, failure) = match outcome {
            Ok(output) => {
                let transition = record_success(&mut task, step_id, output.summary.clone(), now)?;
                (transition, Some(output.summary), None)
            }
            Err(err) => {
                let message = err.to_string();
                warn!(task_id, step_id, err = %message, "step attempt failed");
                let transition = record_failure(&mut task, step_id, message.clone(), now)?;
                (transition, None, Some(message))
            }
        };
        info!(
            task_id,
            step_id,
            status = transition.status.as_str(),
            retry_count = transition.retry_count,
            task_status = transition.task_status.as_str(),
            "step finished"
        );

        in_flight.patch = Some(TaskPatch::from_task(&task, Some(step_id)));
        let stored = self.write_patch(&task, Some(step_id)).await?;
        in_flight.patch = None;
        let step_result = self.report_step(&stored, &transition, result, failure);
        Ok(step_result)
    }

    /// Explicit retry. Exhausted steps are rejected, never silently ignored.
    pub async fn retry_step(&self, task_id: &str, step_id: &str) -> Result<StepResult, EngineError> {
        let task = self.fetch_task(task_id).await?;
        if task.step(step_id).is_some_and(is_exhausted) {
            warn!(task_id, step_id, "retry rejected: retries exhausted");
            return Err(EngineError::RetryExhausted {
                step_id: step_id.to_string(),
                max_retries: task.max_step_retries,
            });
        }
        debug!(task_id, step_id, "explicit retry");
        self.execute_step(task_id, step_id).await
    }

    /// Read through the cache. A store failure falls back to a stale cache
    /// entry when there is one.
    pub async fn get_task(&self, task_id: &str) -> Result<Task, EngineError> {
        if let Err(err) = self.settle(task_id).await {
            debug!(task_id, err = %err, "unsettled step outcome kept for later");
        }
        if let Some(task) = self.cache.get(task_id) {
            return Ok(task);
        }
        match self.store.get_task(task_id).await {
            Ok(Some(task)) => {
                self.cache.put(&task);
                Ok(task)
            }
            Ok(None) => {
                self.cache.invalidate(task_id);
                Err(EngineError::TaskNotFound {
                    task_id: task_id.to_string(),
                })
            }
            Err(err) => match self.cache.get_stale(task_id) {
                Some(stale) => {
                    warn!(task_id, err = %err, "store unavailable, serving stale cache entry");
                    Ok(stale)
                }
                None => Err(persistence(task_id, err)),
            },
        }
    }

    /// Read-only view with derived status and step counts.
    pub async fn get_task_status(&self, task_id: &str) -> Result<TaskView, EngineError> {
        let task = self.get_task(task_id).await?;
        let status = if task.status.is_terminal() {
            task.status
        } else {
            derive_task_status(&task)
        };
        let stats = task_stats(&task.plan);
        Ok(TaskView::new(task, status, stats))
    }

    /// Manual override: mark a step done (`completed = true`) or reopen it
    /// as `failed` with a fresh retry budget. Skips the retry policy.
    pub async fn update_step_progress(
        &self,
        task_id: &str,
        step_id: &str,
        completed: bool,
    ) -> Result<bool, EngineError> {
        let mut task = self.fetch_task(task_id).await?;
        let was_terminal = task.status.is_terminal();
        if !override_step(&mut task, step_id, completed, Utc::now())? {
            return Ok(false);
        }
        let stored = self.write_patch(&task, Some(step_id)).await?;
        info!(task_id, step_id, completed, status = stored.status.as_str(), "step overridden");

        self.publish(task_id, EventType::TaskProgress, progress_payload(&stored));
        if !was_terminal && stored.status.is_terminal() {
            self.publish(task_id, EventType::TaskCompleted, completion_payload(&stored));
        }
        Ok(true)
    }

    /// Cancel a task. Terminal tasks are returned unchanged.
    pub async fn cancel_task(&self, task_id: &str) -> Result<Task, EngineError> {
        let mut task = self.fetch_task(task_id).await?;
        if !cancel(&mut task, Utc::now()) {
            return Ok(task);
        }
        let stored = self.write_patch(&task, None).await?;
        info!(task_id, "task cancelled");
        self.publish(task_id, EventType::TaskCompleted, completion_payload(&stored));
        Ok(stored)
    }

    /// Delete a task and its conversation and file records.
    pub async fn delete_task(&self, task_id: &str) -> Result<(), EngineError> {
        let removed = self
            .store
            .delete_task(task_id)
            .await
            .map_err(|e| persistence(task_id, e))?;
        self.cache.invalidate(task_id);
        if !removed {
            return Err(EngineError::TaskNotFound {
                task_id: task_id.to_string(),
            });
        }
        info!(task_id, "task deleted");
        Ok(())
    }

    /// Turn steps stranded in `executing` by a previous process into failed
    /// attempts and list the tasks that should be driven again.
    pub async fn recover_incomplete_tasks(&self) -> Result<RecoveryReport, EngineError> {
        let tasks = self
            .store
            .list_incomplete_tasks()
            .await
            .map_err(EngineError::Persistence)?;
        let mut report = RecoveryReport {
            scanned: tasks.len(),
            ..RecoveryReport::default()
        };

        for mut task in tasks {
            let stranded = task
                .plan
                .iter()
                .filter(|step| step.status == StepStatus::Executing)
                .map(|step| step.id.clone())
                .collect::<Vec<_>>();
            for step_id in &stranded {
                let transition =
                    record_failure(&mut task, step_id, INTERRUPTED_ERROR.to_string(), Utc::now())?;
                task = self.write_patch(&task, Some(step_id)).await?;
                report.interrupted_steps += 1;
                warn!(
                    task_id = %task.task_id,
                    step_id,
                    status = transition.status.as_str(),
                    retry_count = transition.retry_count,
                    "recovered interrupted step"
                );
                self.report_step(&task, &transition, None, Some(INTERRUPTED_ERROR.to_string()));
            }
            if matches!(task.status, TaskStatus::Pending | TaskStatus::Executing) {
                report.requeue.push(task.task_id.clone());
            }
        }
        info!(
            scanned = report.scanned,
            interrupted = report.interrupted_steps,
            requeue = report.requeue.len(),
            "startup recovery finished"
        );
        Ok(report)
    }

    /// Delete terminal tasks not updated within `retention_days`.
    pub async fn cleanup_expired(&self, retention_days: u32) -> Result<usize, EngineError> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));
        let expired = self
            .store
            .list_tasks(&TaskStatus::TERMINAL)
            .await
            .map_err(EngineError::Persistence)?
            .into_iter()
            .filter(|task| task.updated_at < cutoff)
            .collect::<Vec<_>>();

        let mut removed = 0usize;
        for task in expired {
            if self
                .store
                .delete_task(&task.task_id)
                .await
                .map_err(|e| persistence(&task.task_id, e))?
            {
                removed += 1;
            }
            self.cache.invalidate(&task.task_id);
        }
        if removed > 0 {
            info!(removed, retention_days, "expired tasks deleted");
        }
        Ok(removed)
    }

    pub async fn record_message(
        &self,
        task_id: &str,
        role: &str,
        content: &str,
    ) -> Result<ConversationMessage, EngineError> {
        let message = ConversationMessage {
            task_id: task_id.to_string(),
            role: role.to_string(),
            content: content.to_string(),
            timestamp: Utc::now(),
        };
        self.store
            .append_message(&message)
            .await
            .map_err(|e| persistence(task_id, e))?;
        Ok(message)
    }

    pub async fn conversation(&self, task_id: &str) -> Result<Vec<ConversationMessage>, EngineError> {
        self.store
            .list_messages(task_id)
            .await
            .map_err(|e| persistence(task_id, e))
    }

    pub async fn record_file(&self, file: FileRecord) -> Result<(), EngineError> {
        self.store
            .record_file(&file)
            .await
            .map_err(|e| persistence(&file.task_id, e))
    }

    pub async fn files(&self, task_id: &str) -> Result<Vec<FileRecord>, EngineError> {
        self.store
            .list_files(task_id)
            .await
            .map_err(|e| persistence(task_id, e))
    }

    /// Read straight from the store. Every write path starts here so
    /// preconditions are never checked against a cached copy.
    pub async fn fetch_task(&self, task_id: &str) -> Result<Task, EngineError> {
        self.settle(task_id).await?;
        self.store
            .get_task(task_id)
            .await
            .map_err(|e| persistence(task_id, e))?
            .ok_or_else(|| EngineError::TaskNotFound {
                task_id: task_id.to_string(),
            })
    }

    /// Write a held step outcome if its step is still the one left
    /// `executing`. On failure the outcome stays held.
    async fn settle(&self, task_id: &str) -> Result<(), EngineError> {
        let Some(patch) = self.lock_unsettled().remove(task_id) else {
            return Ok(());
        };
        let Some(step) = patch.step.clone() else {
            return Ok(());
        };

        let stored = match self.store.get_task(task_id).await {
            Ok(stored) => stored,
            Err(err) => {
                self.lock_unsettled().insert(task_id.to_string(), patch);
                return Err(persistence(task_id, err));
            }
        };
        let stranded = stored
            .as_ref()
            .and_then(|task| task.step(&step.id))
            .is_some_and(|current| {
                // Document stores may keep only millisecond precision.
                current.status == StepStatus::Executing
                    && current.started_at.map(|t| t.timestamp_millis())
                        == step.started_at.map(|t| t.timestamp_millis())
            });
        if !stranded {
            debug!(task_id, step_id = %step.id, "held step outcome no longer applies");
            return Ok(());
        }

        match self.store.update_task(task_id, &patch).await {
            Ok(stored) => {
                self.cache.put(&stored);
                warn!(
                    task_id,
                    step_id = %step.id,
                    status = step.status.as_str(),
                    retry_count = step.retry_count,
                    "settled step outcome after failed write"
                );
                self.publish(task_id, EventType::TaskProgress, progress_payload(&stored));
                Ok(())
            }
            Err(StoreError::NotFound(_)) => Ok(()),
            Err(err) => {
                self.lock_unsettled().insert(task_id.to_string(), patch);
                Err(persistence(task_id, err))
            }
        }
    }

    fn lock_unsettled(&self) -> std::sync::MutexGuard<'_, HashMap<String, TaskPatch>> {
        self.unsettled.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn write_patch(&self, task: &Task, step_id: Option<&str>) -> Result<Task, EngineError> {
        let patch = TaskPatch::from_task(task, step_id);
        match self.store.update_task(&task.task_id, &patch).await {
            Ok(stored) => {
                self.cache.put(&stored);
                Ok(stored)
            }
            Err(StoreError::NotFound(_)) => {
                self.cache.invalidate(&task.task_id);
                Err(EngineError::TaskNotFound {
                    task_id: task.task_id.clone(),
                })
            }
            Err(err) => {
                self.cache.invalidate(&task.task_id);
                Err(persistence(&task.task_id, err))
            }
        }
    }

    /// Publish the events for a recorded step outcome and build the result.
    fn report_step(
        &self,
        stored: &Task,
        transition: &StepTransition,
        result: Option<String>,
        failure: Option<String>,
    ) -> StepResult {
        let task_id = stored.task_id.as_str();
        let mut step_result = StepResult::from_transition(task_id, transition, result, failure);
        // A cancel that landed mid-call keeps the task cancelled.
        step_result.task_status = stored.status;

        let payload = serde_json::to_value(&step_result).unwrap_or(Value::Null);
        if transition.status == StepStatus::Completed {
            self.publish(task_id, EventType::StepCompleted, payload);
        } else {
            self.publish(task_id, EventType::Error, payload);
        }
        self.publish(task_id, EventType::TaskProgress, progress_payload(stored));
        if transition.task_finished && stored.status == transition.task_status {
            self.publish(task_id, EventType::TaskCompleted, completion_payload(stored));
        }
        step_result
    }

    fn publish(&self, task_id: &str, event: EventType, data: Value) {
        match &self.events {
            Some(bus) => {
                bus.publish(task_id, event, data);
            }
            None => {
                warn!(task_id, event = event.as_str(), err = %BroadcastError::NotInitialized, "event dropped");
            }
        }
    }
}

fn validate_plan(steps: &[Step], tools: &ToolRegistry) -> Result<(), EngineError> {
    if steps.is_empty() {
        return Err(EngineError::InvalidPlan("plan has no steps".to_string()));
    }
    let mut seen = std::collections::HashSet::new();
    for step in steps {
        if step.id.trim().is_empty() {
            return Err(EngineError::InvalidPlan("step id must not be empty".to_string()));
        }
        if !seen.insert(step.id.as_str()) {
            return Err(EngineError::InvalidPlan(format!(
                "duplicate step id '{}'",
                step.id
            )));
        }
        if !tools.contains(&step.tool) {
            return Err(EngineError::InvalidPlan(format!(
                "step '{}' uses unknown tool '{}'",
                step.id, step.tool
            )));
        }
    }
    Ok(())
}

/// Holds the outcome to store for an executing step. Dropped while still
/// holding one (write failed, caller went away), it parks the outcome on the
/// engine for [`TaskEngine::settle`].
struct InFlight<'a> {
    unsettled: &'a Mutex<HashMap<String, TaskPatch>>,
    task_id: &'a str,
    patch: Option<TaskPatch>,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some(patch) = self.patch.take() {
            warn!(task_id = self.task_id, "step outcome not stored, holding it");
            self.unsettled
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(self.task_id.to_string(), patch);
        }
    }
}

fn persistence(task_id: &str, err: StoreError) -> EngineError {
    error!(task_id, err = %err, "persistence failure");
    EngineError::Persistence(err)
}

fn progress_payload(task: &Task) -> Value {
    json!({
        "status": task.status,
        "current_step_index": task.current_step_index,
        "stats": task_stats(&task.plan),
    })
}

fn completion_payload(task: &Task) -> Value {
    json!({
        "status": task.status,
        "final_result": task.final_result,
        "error": task.error,
        "completed_at": task.completed_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::memory_store::MemoryStore;
    use crate::io::tools::Tool;
    use crate::test_support::{ScriptedTool, engine_with, new_task, new_task_with_steps};

    fn engine(tool: Arc<ScriptedTool>) -> TaskEngine {
        engine_with(Arc::new(MemoryStore::new()), vec![tool as Arc<dyn Tool>])
    }

    #[tokio::test]
    async fn create_rejects_empty_and_duplicate_plans() {
        let engine = engine(Arc::new(ScriptedTool::always_succeeding()));
        let mut empty = new_task("t1", ScriptedTool::NAME);
        empty.steps.clear();
        assert!(matches!(
            engine.create_task(empty).await,
            Err(EngineError::InvalidPlan(_))
        ));

        let mut dup = new_task_with_steps("t1", ScriptedTool::NAME, 2);
        dup.steps[1].id = dup.steps[0].id.clone();
        assert!(matches!(
            engine.create_task(dup).await,
            Err(EngineError::InvalidPlan(_))
        ));
    }

    #[tokio::test]
    async fn create_rejects_unknown_tools() {
        let engine = engine(Arc::new(ScriptedTool::always_succeeding()));
        let err = engine
            .create_task(new_task("t1", "browser"))
            .await
            .expect_err("unknown tool");
        assert!(err.to_string().contains("unknown tool 'browser'"));
    }

    #[tokio::test]
    async fn create_assigns_id_when_missing() {
        let engine = engine(Arc::new(ScriptedTool::always_succeeding()));
        let mut new = new_task("ignored", ScriptedTool::NAME);
        new.task_id = None;
        let task = engine.create_task(new).await.expect("create");
        assert!(Uuid::parse_str(&task.task_id).is_ok());
    }

    #[tokio::test]
    async fn start_moves_created_to_pending_once() {
        let engine = engine(Arc::new(ScriptedTool::always_succeeding()));
        engine.create_task(new_task("t1", ScriptedTool::NAME)).await.expect("create");

        let started = engine.start_task("t1").await.expect("start");
        assert_eq!(started.status, TaskStatus::Pending);
        let again = engine.start_task("t1").await.expect("start again");
        assert_eq!(again.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn success_advances_cursor_and_finishes_task() {
        let engine = engine(Arc::new(ScriptedTool::always_succeeding()));
        engine
            .create_task(new_task_with_steps("t1", ScriptedTool::NAME, 2))
            .await
            .expect("create");

        let first = engine.execute_step("t1", "step-1").await.expect("step 1");
        assert!(first.step_completed);
        assert_eq!(first.task_status, TaskStatus::Executing);
        assert_eq!(engine.get_task("t1").await.expect("get").current_step_index, 1);

        let second = engine.execute_step("t1", "step-2").await.expect("step 2");
        assert_eq!(second.task_status, TaskStatus::Completed);
        let task = engine.get_task("t1").await.expect("get");
        assert_eq!(task.final_result.as_deref(), Some("ok\n\nok"));
        assert!(task.completed_at.is_some());
    }

    #[tokio::test]
    async fn retry_step_rejects_completed_step() {
        let engine = engine(Arc::new(ScriptedTool::always_succeeding()));
        engine.create_task(new_task("t1", ScriptedTool::NAME)).await.expect("create");
        engine.execute_step("t1", "step-1").await.expect("run");

        let err = engine.retry_step("t1", "step-1").await.expect_err("completed");
        assert!(matches!(err, EngineError::StepAlreadyCompleted { .. }));
    }

    #[tokio::test]
    async fn status_view_counts_steps() {
        let engine = engine(Arc::new(ScriptedTool::always_failing("nope")));
        engine
            .create_task(new_task_with_steps("t1", ScriptedTool::NAME, 3))
            .await
            .expect("create");
        engine.execute_step("t1", "step-1").await.expect("attempt");

        let view = engine.get_task_status("t1").await.expect("status");
        assert_eq!(view.status, TaskStatus::Executing);
        assert_eq!(view.stats.total_steps, 3);
        assert_eq!(view.stats.remaining_steps, 3);
        assert_eq!(view.plan[0].retry_count, 1);
    }

    #[tokio::test]
    async fn override_is_idempotent() {
        let engine = engine(Arc::new(ScriptedTool::always_succeeding()));
        engine.create_task(new_task("t1", ScriptedTool::NAME)).await.expect("create");

        assert!(engine.update_step_progress("t1", "step-1", true).await.expect("override"));
        assert!(!engine.update_step_progress("t1", "step-1", true).await.expect("no-op"));
        let task = engine.get_task("t1").await.expect("get");
        assert_eq!(task.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn missing_task_is_not_found() {
        let engine = engine(Arc::new(ScriptedTool::always_succeeding()));
        assert!(matches!(
            engine.execute_step("nope", "step-1").await,
            Err(EngineError::TaskNotFound { .. })
        ));
        assert!(matches!(
            engine.delete_task("nope").await,
            Err(EngineError::TaskNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn cleanup_keeps_recent_and_active_tasks() {
        let engine = engine(Arc::new(ScriptedTool::always_succeeding()));
        engine.create_task(new_task("done", ScriptedTool::NAME)).await.expect("create");
        engine.execute_step("done", "step-1").await.expect("run");
        engine.create_task(new_task("open", ScriptedTool::NAME)).await.expect("create");

        assert_eq!(engine.cleanup_expired(30).await.expect("cleanup"), 0);

        let mut old = engine.fetch_task("done").await.expect("fetch");
        old.updated_at = Utc::now() - chrono::Duration::days(31);
        engine.store().save_task(&old).await.expect("backdate");

        assert_eq!(engine.cleanup_expired(30).await.expect("cleanup"), 1);
        assert!(engine.fetch_task("done").await.is_err());
        assert!(engine.fetch_task("open").await.is_ok());
    }
}
