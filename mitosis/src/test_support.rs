//! Test-only builders, scripted collaborators, and fault injection.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tempfile::TempDir;
use tokio::sync::Notify;

use crate::engine::{EngineConfig, NewTask, TaskEngine};
use crate::error::{LlmError, StoreError, ToolExecutionError};
use crate::io::llm::LanguageModel;
use crate::io::memory_store::MemoryStore;
use crate::io::store::{ConversationMessage, FileRecord, TaskPatch, TaskStore};
use crate::io::tools::{Tool, ToolOutput, ToolRegistry, ToolRequest};
use crate::task::{MAX_STEP_RETRIES, RetryAttempt, Step, StepStatus, Task, TaskStatus};

/// A step in `status` with the bookkeeping that status implies, so the
/// result passes invariant checks on its own.
pub fn step_with_status(id: &str, status: StepStatus) -> Step {
    let now = Utc::now();
    let mut step = Step::new(id, format!("{id} title"), format!("{id} description"), ScriptedTool::NAME);
    step.status = status;
    match status {
        StepStatus::Pending | StepStatus::Failed => {}
        StepStatus::Executing => step.started_at = Some(now),
        StepStatus::Completed => {
            step.started_at = Some(now);
            step.completed_at = Some(now);
            step.result = Some(format!("{id} done"));
        }
        StepStatus::FailedAfterRetries => {
            step.started_at = Some(now);
            step.retry_count = MAX_STEP_RETRIES;
            step.retry_attempts = (0..MAX_STEP_RETRIES)
                .map(|_| RetryAttempt {
                    timestamp: now,
                    error: "failed".to_string(),
                })
                .collect();
            step.final_error = Some("failed".to_string());
        }
    }
    step
}

/// A `created` task holding `steps` as given (no reset, no re-aggregation).
pub fn task_with_steps(steps: Vec<Step>) -> Task {
    let now = Utc::now();
    Task {
        task_id: "task-1".to_string(),
        title: "Test task".to_string(),
        status: TaskStatus::Created,
        plan: steps,
        current_step_index: 0,
        max_step_retries: MAX_STEP_RETRIES,
        created_at: now,
        updated_at: now,
        completed_at: None,
        final_result: None,
        error: None,
    }
}

pub fn tool_request(task_id: &str, step_id: &str) -> ToolRequest {
    ToolRequest {
        task_id: task_id.to_string(),
        task_title: "Test task".to_string(),
        step_id: step_id.to_string(),
        step_title: format!("{step_id} title"),
        step_description: format!("{step_id} description"),
        previous_results: Vec::new(),
    }
}

/// A single-step task bound to `tool`.
pub fn new_task(task_id: &str, tool: &str) -> NewTask {
    new_task_with_steps(task_id, tool, 1)
}

pub fn new_task_with_steps(task_id: &str, tool: &str, steps: usize) -> NewTask {
    NewTask {
        task_id: Some(task_id.to_string()),
        title: format!("{task_id} title"),
        steps: (1..=steps)
            .map(|n| Step::new(format!("step-{n}"), format!("Step {n}"), "do it", tool))
            .collect(),
        origin_message: None,
    }
}

/// Engine over `store` with `tools` and default settings, no broadcaster.
pub fn engine_with(store: Arc<dyn TaskStore>, tools: Vec<Arc<dyn Tool>>) -> TaskEngine {
    let mut registry = ToolRegistry::new(std::time::Duration::from_secs(5));
    for tool in tools {
        registry.register(tool);
    }
    TaskEngine::new(store, Arc::new(registry), EngineConfig::default())
}

/// A temporary directory and a snapshot path inside it.
pub fn temp_snapshot() -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("mitosis.json");
    (dir, path)
}

/// Tool that replays a fixed sequence of outcomes, then a fallback.
pub struct ScriptedTool {
    outcomes: Mutex<VecDeque<Result<String, String>>>,
    fallback: Result<String, String>,
    calls: AtomicUsize,
}

impl ScriptedTool {
    pub const NAME: &'static str = "scripted";

    pub fn new(outcomes: Vec<Result<String, String>>, fallback: Result<String, String>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into()),
            fallback,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn always_succeeding() -> Self {
        Self::new(Vec::new(), Ok("ok".to_string()))
    }

    pub fn always_failing(error: &str) -> Self {
        Self::new(Vec::new(), Err(error.to_string()))
    }

    /// Fails `failures` times with `attempt N failed`, then succeeds.
    pub fn succeed_after(failures: usize) -> Self {
        let outcomes = (1..=failures)
            .map(|n| Err(format!("attempt {n} failed")))
            .collect();
        Self::new(outcomes, Ok("ok".to_string()))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Tool for ScriptedTool {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn description(&self) -> &str {
        "Replays scripted outcomes."
    }

    async fn execute(&self, _request: &ToolRequest) -> Result<ToolOutput, ToolExecutionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self
            .outcomes
            .lock()
            .expect("outcomes lock")
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        next.map(ToolOutput::text)
            .map_err(|message| ToolExecutionError::failed(Self::NAME, message))
    }
}

/// Tool that parks until released, for overlapping-call tests.
pub struct BlockingTool {
    entered: Notify,
    release: Notify,
    calls: AtomicUsize,
}

impl BlockingTool {
    pub const NAME: &'static str = "blocking";

    pub fn new() -> Self {
        Self {
            entered: Notify::new(),
            release: Notify::new(),
            calls: AtomicUsize::new(0),
        }
    }

    pub async fn wait_until_entered(&self) {
        self.entered.notified().await;
    }

    pub fn release(&self) {
        self.release.notify_one();
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for BlockingTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for BlockingTool {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn description(&self) -> &str {
        "Blocks until released."
    }

    async fn execute(&self, _request: &ToolRequest) -> Result<ToolOutput, ToolExecutionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.entered.notify_one();
        self.release.notified().await;
        Ok(ToolOutput::text("released"))
    }
}

pub struct PanickingTool;

impl PanickingTool {
    pub const NAME: &'static str = "panicking";
}

#[async_trait]
impl Tool for PanickingTool {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn description(&self) -> &str {
        "Always panics."
    }

    async fn execute(&self, _request: &ToolRequest) -> Result<ToolOutput, ToolExecutionError> {
        panic!("boom");
    }
}

/// Language model with one canned reply, or none (every call fails).
pub struct StaticModel {
    reply: Option<String>,
}

impl StaticModel {
    pub fn replying(reply: &str) -> Self {
        Self {
            reply: Some(reply.to_string()),
        }
    }

    pub fn failing() -> Self {
        Self { reply: None }
    }
}

#[async_trait]
impl LanguageModel for StaticModel {
    fn model(&self) -> &str {
        "static"
    }

    async fn generate(&self, _prompt: &str) -> Result<String, LlmError> {
        self.reply.clone().ok_or(LlmError::EmptyResponse)
    }

    async fn health(&self) -> bool {
        self.reply.is_some()
    }
}

/// Memory store whose reads and writes can be switched to fail.
pub struct FailingStore {
    inner: MemoryStore,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl FailingStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
        }
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_read(&self) -> Result<(), StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Connection("injected read failure".to_string()));
        }
        Ok(())
    }

    fn check_write(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Connection("injected write failure".to_string()));
        }
        Ok(())
    }
}

impl Default for FailingStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for FailingStore {
    fn backend(&self) -> &'static str {
        "failing"
    }

    async fn save_task(&self, task: &Task) -> Result<(), StoreError> {
        self.check_write()?;
        self.inner.save_task(task).await
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<Task>, StoreError> {
        self.check_read()?;
        self.inner.get_task(task_id).await
    }

    async fn update_task(&self, task_id: &str, patch: &TaskPatch) -> Result<Task, StoreError> {
        self.check_write()?;
        self.inner.update_task(task_id, patch).await
    }

    async fn begin_step(
        &self,
        task_id: &str,
        step_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>, StoreError> {
        self.check_write()?;
        self.inner.begin_step(task_id, step_id, now).await
    }

    async fn delete_task(&self, task_id: &str) -> Result<bool, StoreError> {
        self.check_write()?;
        self.inner.delete_task(task_id).await
    }

    async fn list_tasks(&self, statuses: &[TaskStatus]) -> Result<Vec<Task>, StoreError> {
        self.check_read()?;
        self.inner.list_tasks(statuses).await
    }

    async fn append_message(&self, message: &ConversationMessage) -> Result<(), StoreError> {
        self.check_write()?;
        self.inner.append_message(message).await
    }

    async fn list_messages(&self, task_id: &str) -> Result<Vec<ConversationMessage>, StoreError> {
        self.check_read()?;
        self.inner.list_messages(task_id).await
    }

    async fn record_file(&self, file: &FileRecord) -> Result<(), StoreError> {
        self.check_write()?;
        self.inner.record_file(file).await
    }

    async fn list_files(&self, task_id: &str) -> Result<Vec<FileRecord>, StoreError> {
        self.check_read()?;
        self.inner.list_files(task_id).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check_read()
    }
}
