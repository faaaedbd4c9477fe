//! Task and Step records as they are persisted.
//!
//! A [`Task`] embeds its ordered plan of [`Step`]s; steps are never stored on
//! their own and never referenced across tasks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default cap on failed attempts per step.
pub const MAX_STEP_RETRIES: u32 = 5;

/// Lifecycle status of a task.
///
/// `failed_step_retries` is the single terminal failure status. Older documents
/// that carry `failed` or `completed_with_failures` are read as it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Created,
    Pending,
    Executing,
    Completed,
    #[serde(alias = "failed", alias = "completed_with_failures")]
    FailedStepRetries,
    Cancelled,
}

impl TaskStatus {
    /// Statuses that startup recovery and the worker still care about.
    pub const INCOMPLETE: [TaskStatus; 3] = [
        TaskStatus::Created,
        TaskStatus::Pending,
        TaskStatus::Executing,
    ];

    /// Statuses after which no step may transition again.
    pub const TERMINAL: [TaskStatus; 3] = [
        TaskStatus::Completed,
        TaskStatus::FailedStepRetries,
        TaskStatus::Cancelled,
    ];

    pub fn is_terminal(self) -> bool {
        Self::TERMINAL.contains(&self)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Created => "created",
            TaskStatus::Pending => "pending",
            TaskStatus::Executing => "executing",
            TaskStatus::Completed => "completed",
            TaskStatus::FailedStepRetries => "failed_step_retries",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

/// Lifecycle status of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Executing,
    Completed,
    /// Manually marked as not done; retryable like `Pending`.
    Failed,
    FailedAfterRetries,
}

impl StepStatus {
    /// No transition leaves a terminal step except the manual override.
    pub fn is_terminal(self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::FailedAfterRetries)
    }

    /// True if `execute_step` may move this step into `executing`.
    pub fn is_runnable(self) -> bool {
        matches!(self, StepStatus::Pending | StepStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Executing => "executing",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::FailedAfterRetries => "failed_after_retries",
        }
    }
}

/// One failed execution attempt, kept for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryAttempt {
    pub timestamp: DateTime<Utc>,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    /// Unique within the parent plan only.
    pub id: String,
    pub title: String,
    pub description: String,
    /// Registered tool name invoked for this step.
    pub tool: String,
    pub status: StepStatus,
    #[serde(default)]
    pub retry_count: u32,
    /// Append-only log of failed attempts.
    #[serde(default)]
    pub retry_attempts: Vec<RetryAttempt>,
    /// Summary produced by the tool on success.
    #[serde(default)]
    pub result: Option<String>,
    /// Set once, when the step reaches `failed_after_retries`.
    #[serde(default)]
    pub final_error: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Step {
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        description: impl Into<String>,
        tool: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: description.into(),
            tool: tool.into(),
            status: StepStatus::Pending,
            retry_count: 0,
            retry_attempts: Vec::new(),
            result: None,
            final_error: None,
            started_at: None,
            completed_at: None,
        }
    }

    /// Drop any execution state so the step starts fresh in a new plan.
    pub fn reset(&mut self) {
        self.status = StepStatus::Pending;
        self.retry_count = 0;
        self.retry_attempts.clear();
        self.result = None;
        self.final_error = None;
        self.started_at = None;
        self.completed_at = None;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub title: String,
    pub status: TaskStatus,
    pub plan: Vec<Step>,
    /// Index of the first step that has not reached a terminal status.
    #[serde(default)]
    pub current_step_index: usize,
    /// Retry cap captured at creation so later config changes do not
    /// reinterpret stored counters.
    #[serde(default = "default_max_step_retries")]
    pub max_step_retries: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub final_result: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

fn default_max_step_retries() -> u32 {
    MAX_STEP_RETRIES
}

impl Task {
    /// Build a freshly planned task with every step reset to `pending`.
    pub fn new(
        task_id: impl Into<String>,
        title: impl Into<String>,
        mut plan: Vec<Step>,
        max_step_retries: u32,
        now: DateTime<Utc>,
    ) -> Self {
        for step in &mut plan {
            step.reset();
        }
        Self {
            task_id: task_id.into(),
            title: title.into(),
            status: TaskStatus::Created,
            plan,
            current_step_index: 0,
            max_step_retries,
            created_at: now,
            updated_at: now,
            completed_at: None,
            final_result: None,
            error: None,
        }
    }

    pub fn step(&self, step_id: &str) -> Option<&Step> {
        self.plan.iter().find(|step| step.id == step_id)
    }

    pub fn step_mut(&mut self, step_id: &str) -> Option<&mut Step> {
        self.plan.iter_mut().find(|step| step.id == step_id)
    }

    pub fn step_index(&self, step_id: &str) -> Option<usize> {
        self.plan.iter().position(|step| step.id == step_id)
    }

    /// Results of completed steps, in plan order.
    pub fn completed_results(&self) -> Vec<String> {
        self.plan
            .iter()
            .filter(|step| step.status == StepStatus::Completed)
            .filter_map(|step| step.result.clone())
            .collect()
    }
}
