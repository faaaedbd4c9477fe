//! Shared application state for the HTTP server.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use mitosis::broadcast::EventBroadcaster;
use mitosis::engine::TaskEngine;
use mitosis::services::Services;
use mitosis::worker::TaskWorker;

/// Cloned into every handler; all fields are shared handles.
#[derive(Clone)]
pub struct AppState {
    pub services: Arc<Services>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(services: Services) -> Self {
        Self {
            services: Arc::new(services),
            started_at: Utc::now(),
        }
    }

    pub fn engine(&self) -> &Arc<TaskEngine> {
        &self.services.engine
    }

    pub fn worker(&self) -> &TaskWorker {
        &self.services.worker
    }

    pub fn events(&self) -> &Arc<EventBroadcaster> {
        &self.services.events
    }
}

#[cfg(test)]
pub mod testing {
    //! State wired to an in-memory store, a scripted model, and scripted
    //! tools registered under the builtin tool names.

    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use mitosis::error::ToolExecutionError;
    use mitosis::io::config::MitosisConfig;
    use mitosis::io::memory_store::MemoryStore;
    use mitosis::io::tools::{Tool, ToolOutput, ToolRegistry, ToolRequest};
    use mitosis::services::Services;
    use mitosis::test_support::{ScriptedTool, StaticModel};

    use super::AppState;

    pub struct NamedTool {
        name: &'static str,
        inner: ScriptedTool,
    }

    #[async_trait]
    impl Tool for NamedTool {
        fn name(&self) -> &str {
            self.name
        }

        fn description(&self) -> &str {
            "scripted builtin"
        }

        async fn execute(&self, request: &ToolRequest) -> Result<ToolOutput, ToolExecutionError> {
            self.inner.execute(request).await
        }
    }

    /// Every builtin tool behaves like `make()`.
    pub fn state_with(make: impl Fn() -> ScriptedTool) -> AppState {
        let mut config = MitosisConfig::default();
        config.llm.plan_with_llm = false;
        config.retry.retry_delay_ms = 0;
        let mut tools = ToolRegistry::new(Duration::from_secs(5));
        for name in ["web_search", "shell", "content_generation"] {
            tools.register(Arc::new(NamedTool { name, inner: make() }));
        }
        let services = Services::assemble(
            config,
            Arc::new(MemoryStore::new()),
            Arc::new(StaticModel::replying("hello!")),
            tools,
        )
        .expect("services");
        AppState::new(services)
    }

    pub fn state() -> AppState {
        state_with(ScriptedTool::always_succeeding)
    }
}
