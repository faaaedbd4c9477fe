//! Persistence Store boundary consumed by the engine.
//!
//! The store is the source of truth for task records. Implementations must
//! make `begin_step` an atomic compare-and-swap and must never let
//! `update_task` overwrite a stored `cancelled` status.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::StoreError;
use crate::io::config::StoreConfig;
use crate::io::memory_store::MemoryStore;
use crate::io::mongo_store::MongoStore;
use crate::task::{Step, Task, TaskStatus};

/// One message of the per-task conversation log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub task_id: String,
    pub role: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// A file produced for a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub task_id: String,
    pub name: String,
    pub path: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

/// Field-level update for a stored task.
///
/// Carries the task-level fields plus at most one replaced step, so two
/// writers touching different fields never clobber each other with a stale
/// full document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskPatch {
    pub status: TaskStatus,
    pub current_step_index: usize,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub final_result: Option<String>,
    pub error: Option<String>,
    pub step: Option<Step>,
}

impl TaskPatch {
    /// Patch that writes the task-level fields of `task` and, if given, the
    /// current state of `step_id`.
    pub fn from_task(task: &Task, step_id: Option<&str>) -> Self {
        Self {
            status: task.status,
            current_step_index: task.current_step_index,
            updated_at: task.updated_at,
            completed_at: task.completed_at,
            final_result: task.final_result.clone(),
            error: task.error.clone(),
            step: step_id.and_then(|id| task.step(id)).cloned(),
        }
    }

    /// Apply to an in-memory record with the same rules a document store
    /// enforces: a cancelled task keeps its status and terminal fields, the
    /// step is written regardless.
    pub fn apply(&self, task: &mut Task) {
        if task.status != TaskStatus::Cancelled {
            task.status = self.status;
            task.current_step_index = self.current_step_index;
            task.completed_at = self.completed_at;
            task.final_result = self.final_result.clone();
            task.error = self.error.clone();
        }
        task.updated_at = self.updated_at;
        if let Some(step) = &self.step
            && let Some(slot) = task.step_mut(&step.id)
        {
            *slot = step.clone();
        }
    }
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Short backend name for health output.
    fn backend(&self) -> &'static str;

    /// Insert or replace by `task_id`.
    async fn save_task(&self, task: &Task) -> Result<(), StoreError>;

    async fn get_task(&self, task_id: &str) -> Result<Option<Task>, StoreError>;

    /// Partial update. Returns the stored task after the write, or
    /// `StoreError::NotFound` if no task has this id.
    async fn update_task(&self, task_id: &str, patch: &TaskPatch) -> Result<Task, StoreError>;

    /// Atomically move `step_id` from `pending`/`failed` to `executing`.
    ///
    /// Returns the updated task if this caller won the swap, `None` if the
    /// task is missing, cancelled, or the step was not runnable.
    async fn begin_step(
        &self,
        task_id: &str,
        step_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>, StoreError>;

    /// Delete a task with its conversation and file records.
    async fn delete_task(&self, task_id: &str) -> Result<bool, StoreError>;

    async fn list_tasks(&self, statuses: &[TaskStatus]) -> Result<Vec<Task>, StoreError>;

    /// Tasks startup recovery must look at.
    async fn list_incomplete_tasks(&self) -> Result<Vec<Task>, StoreError> {
        self.list_tasks(&TaskStatus::INCOMPLETE).await
    }

    async fn append_message(&self, message: &ConversationMessage) -> Result<(), StoreError>;

    async fn list_messages(&self, task_id: &str) -> Result<Vec<ConversationMessage>, StoreError>;

    async fn record_file(&self, file: &FileRecord) -> Result<(), StoreError>;

    async fn list_files(&self, task_id: &str) -> Result<Vec<FileRecord>, StoreError>;

    /// Connectivity check for health endpoints.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Open the configured backend: MongoDB when a URL is set, otherwise the
/// in-memory store with an optional JSON snapshot.
pub async fn open_store(config: &StoreConfig) -> Result<Arc<dyn TaskStore>, StoreError> {
    if let Some(url) = config.mongo_url.as_deref().filter(|url| !url.trim().is_empty()) {
        let store = MongoStore::connect(url, &config.database).await?;
        info!(database = %config.database, "using mongodb store");
        return Ok(Arc::new(store));
    }
    let store = match &config.memory_db_path {
        Some(path) => {
            info!(path = %path.display(), "using in-memory store with snapshot");
            MemoryStore::with_snapshot(path)?
        }
        None => {
            info!("using in-memory store");
            MemoryStore::new()
        }
    };
    Ok(Arc::new(store))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::StepStatus;
    use crate::test_support::{step_with_status, task_with_steps};

    #[test]
    fn patch_never_revives_cancelled_task() {
        let mut stored = task_with_steps(vec![step_with_status("a", StepStatus::Executing)]);
        stored.status = TaskStatus::Cancelled;

        let mut finished = stored.clone();
        finished.status = TaskStatus::Completed;
        finished.plan[0] = step_with_status("a", StepStatus::Completed);
        TaskPatch::from_task(&finished, Some("a")).apply(&mut stored);

        assert_eq!(stored.status, TaskStatus::Cancelled);
        assert_eq!(stored.plan[0].status, StepStatus::Completed);
    }

    #[test]
    fn patch_only_touches_named_step() {
        let mut stored = task_with_steps(vec![
            step_with_status("a", StepStatus::Pending),
            step_with_status("b", StepStatus::Pending),
        ]);
        let mut changed = stored.clone();
        changed.plan[0].status = StepStatus::Executing;
        changed.plan[1].status = StepStatus::Completed;

        TaskPatch::from_task(&changed, Some("a")).apply(&mut stored);

        assert_eq!(stored.plan[0].status, StepStatus::Executing);
        assert_eq!(stored.plan[1].status, StepStatus::Pending);
    }
}
