//! Error taxonomy shared by the engine, stores, tools, and transports.

use thiserror::Error;

use crate::task::StepStatus;

/// Errors surfaced by the task/step state machine.
///
/// Tool failures never appear here: they are recorded on the step and
/// reported through [`StepResult`](crate::core::types::StepResult).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("task '{task_id}' not found")]
    TaskNotFound { task_id: String },

    #[error("step '{step_id}' not found in task '{task_id}'")]
    StepNotFound { task_id: String, step_id: String },

    #[error("step '{step_id}' has exceeded maximum retries ({max_retries})")]
    RetryExhausted { step_id: String, max_retries: u32 },

    #[error("step '{step_id}' is already executing")]
    StepAlreadyExecuting { step_id: String },

    #[error("step '{step_id}' is not executing")]
    StepNotExecuting { step_id: String },

    #[error("step '{step_id}' is already completed")]
    StepAlreadyCompleted { step_id: String },

    #[error("step '{step_id}' cannot run before step '{blocking_step_id}' ({blocking_status})")]
    StepOutOfOrder {
        step_id: String,
        blocking_step_id: String,
        blocking_status: &'static str,
    },

    #[error("task '{task_id}' is cancelled")]
    TaskCancelled { task_id: String },

    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    #[error("persistence error: {0}")]
    Persistence(#[from] StoreError),
}

impl EngineError {
    pub(crate) fn out_of_order(step_id: &str, blocking_id: &str, status: StepStatus) -> Self {
        EngineError::StepOutOfOrder {
            step_id: step_id.to_string(),
            blocking_step_id: blocking_id.to_string(),
            blocking_status: status.as_str(),
        }
    }
}

/// Persistence Store failures.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("item not found: {0}")]
    NotFound(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Failures reported by a tool invocation. Always converted into a step failure.
#[derive(Debug, Error)]
pub enum ToolExecutionError {
    #[error("unknown tool '{0}'")]
    UnknownTool(String),

    #[error("tool '{tool}' timed out after {timeout_secs}s")]
    Timeout { tool: String, timeout_secs: u64 },

    #[error("tool '{tool}' is unavailable: {reason}")]
    Unavailable { tool: String, reason: String },

    #[error("tool '{tool}' failed: {message}")]
    Failed { tool: String, message: String },
}

impl ToolExecutionError {
    pub fn failed(tool: &str, message: impl Into<String>) -> Self {
        ToolExecutionError::Failed {
            tool: tool.to_string(),
            message: message.into(),
        }
    }
}

/// Event delivery failures. Logged and swallowed by the engine.
#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error("event broadcaster is not initialized")]
    NotInitialized,

    #[error("connection {0} is closed")]
    ConnectionClosed(u64),
}

/// LLM backend failures.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("llm request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("llm returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("llm returned an empty response")]
    EmptyResponse,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_exhausted_message_is_stable() {
        let err = EngineError::RetryExhausted {
            step_id: "step-1".to_string(),
            max_retries: 5,
        };
        assert!(err.to_string().contains("exceeded maximum retries"));
    }

    #[test]
    fn out_of_order_names_blocking_step() {
        let err = EngineError::out_of_order("step-2", "step-1", StepStatus::Pending);
        assert_eq!(
            err.to_string(),
            "step 'step-2' cannot run before step 'step-1' (pending)"
        );
    }
}
