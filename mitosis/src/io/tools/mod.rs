//! Tool Executor: named capabilities a step can invoke.
//!
//! The registry is the only caller of [`Tool::execute`]. It bounds every
//! call with the configured timeout and converts panics into ordinary
//! [`ToolExecutionError`]s, so a step can never be left `executing` by a
//! misbehaving tool.

pub mod generate;
pub mod search;
pub mod shell;

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use tracing::{instrument, warn};

use crate::error::ToolExecutionError;
use crate::io::config::ToolsConfig;
use crate::io::llm::LanguageModel;
use crate::task::{Step, Task};

pub use generate::ContentGenerationTool;
pub use search::WebSearchTool;
pub use shell::ShellTool;

/// Everything a tool learns about the step it runs for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolRequest {
    pub task_id: String,
    pub task_title: String,
    pub step_id: String,
    pub step_title: String,
    pub step_description: String,
    /// Results of earlier completed steps, in plan order.
    pub previous_results: Vec<String>,
}

impl ToolRequest {
    pub fn for_step(task: &Task, step: &Step) -> Self {
        Self {
            task_id: task.task_id.clone(),
            task_title: task.title.clone(),
            step_id: step.id.clone(),
            step_title: step.title.clone(),
            step_description: step.description.clone(),
            previous_results: task.completed_results(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolOutput {
    /// Human-readable result stored on the step.
    pub summary: String,
    /// Structured payload for clients.
    pub data: Value,
}

impl ToolOutput {
    pub fn text(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            data: Value::Null,
        }
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    /// Registry key; steps refer to tools by this name.
    fn name(&self) -> &str;

    /// Shown to the LLM planner.
    fn description(&self) -> &str;

    async fn execute(&self, request: &ToolRequest) -> Result<ToolOutput, ToolExecutionError>;

    async fn is_available(&self) -> bool {
        true
    }
}

pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
    timeout: Duration,
}

impl ToolRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            tools: BTreeMap::new(),
            timeout,
        }
    }

    /// `web_search`, `shell` (when enabled), and `content_generation`.
    pub fn builtin(config: &ToolsConfig, llm: Arc<dyn LanguageModel>) -> Self {
        let mut registry = Self::new(config.timeout());
        registry.register(Arc::new(WebSearchTool::new(&config.search)));
        if config.shell.enabled {
            registry.register(Arc::new(ShellTool::new(&config.shell, config.timeout())));
        }
        registry.register(Arc::new(ContentGenerationTool::new(llm)));
        registry
    }

    /// Register a tool, replacing any previous tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    /// `(name, description)` pairs in name order.
    pub fn catalog(&self) -> Vec<(String, String)> {
        self.tools
            .values()
            .map(|tool| (tool.name().to_string(), tool.description().to_string()))
            .collect()
    }

    /// Availability of each registered tool, for health output.
    pub async fn availability(&self) -> BTreeMap<String, bool> {
        let mut out = BTreeMap::new();
        for (name, tool) in &self.tools {
            out.insert(name.clone(), tool.is_available().await);
        }
        out
    }

    /// Run a tool with the registry timeout. Panics and timeouts come back as
    /// errors like any other failure.
    #[instrument(skip(self, request), fields(task_id = %request.task_id, step_id = %request.step_id))]
    pub async fn execute(
        &self,
        name: &str,
        request: &ToolRequest,
    ) -> Result<ToolOutput, ToolExecutionError> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| ToolExecutionError::UnknownTool(name.to_string()))?;

        let call = AssertUnwindSafe(tool.execute(request)).catch_unwind();
        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => {
                let message = panic_message(panic.as_ref());
                warn!(tool = name, message = %message, "tool panicked");
                Err(ToolExecutionError::failed(name, format!("tool panicked: {message}")))
            }
            Err(_) => Err(ToolExecutionError::Timeout {
                tool: name.to_string(),
                timeout_secs: self.timeout.as_secs(),
            }),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{BlockingTool, PanickingTool, ScriptedTool, tool_request};

    #[tokio::test]
    async fn unknown_tool_is_an_error() {
        let registry = ToolRegistry::new(Duration::from_secs(1));
        let err = registry
            .execute("missing", &tool_request("t1", "a"))
            .await
            .expect_err("unknown");
        assert!(matches!(err, ToolExecutionError::UnknownTool(_)));
    }

    #[tokio::test]
    async fn panics_become_failures() {
        let mut registry = ToolRegistry::new(Duration::from_secs(1));
        registry.register(Arc::new(PanickingTool));
        let err = registry
            .execute(PanickingTool::NAME, &tool_request("t1", "a"))
            .await
            .expect_err("panic");
        assert!(err.to_string().contains("tool panicked: boom"));
    }

    #[tokio::test]
    async fn slow_tool_times_out() {
        let mut registry = ToolRegistry::new(Duration::from_millis(20));
        registry.register(Arc::new(BlockingTool::new()));
        let err = registry
            .execute(BlockingTool::NAME, &tool_request("t1", "a"))
            .await
            .expect_err("timeout");
        assert!(matches!(err, ToolExecutionError::Timeout { .. }));
    }

    #[tokio::test]
    async fn scripted_tool_runs_through_registry() {
        let tool = Arc::new(ScriptedTool::succeed_after(1));
        let mut registry = ToolRegistry::new(Duration::from_secs(1));
        registry.register(tool.clone());

        let request = tool_request("t1", "a");
        assert!(registry.execute(ScriptedTool::NAME, &request).await.is_err());
        assert!(registry.execute(ScriptedTool::NAME, &request).await.is_ok());
        assert_eq!(tool.calls(), 2);
        assert_eq!(registry.names(), vec![ScriptedTool::NAME.to_string()]);
    }
}
