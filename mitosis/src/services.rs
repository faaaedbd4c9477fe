//! Wiring shared by the CLI and the server: one place that turns a
//! [`MitosisConfig`] into a running engine with its collaborators.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::broadcast::EventBroadcaster;
use crate::core::classifier::{IntentClassifier, IntentType, RuleClassifier};
use crate::core::planner::PlanDraft;
use crate::engine::{EngineConfig, NewTask, TaskEngine};
use crate::error::EngineError;
use crate::io::config::MitosisConfig;
use crate::io::llm::{LanguageModel, OllamaClient};
use crate::io::planner::PlanGenerator;
use crate::io::store::{TaskStore, open_store};
use crate::io::tools::ToolRegistry;
use crate::task::Task;
use crate::worker::TaskWorker;

const CASUAL_FALLBACK: &str =
    "Hi! Describe something you want researched, written, or run and I will plan it as a task.";

/// Reply to one chat message.
#[derive(Debug, Clone)]
pub struct ChatOutcome {
    pub intent: IntentType,
    pub response: String,
    /// Set when the message became a task.
    pub task: Option<Task>,
    pub draft: Option<PlanDraft>,
    /// True when earlier messages existed for the conversation.
    pub memory_used: bool,
}

pub struct Services {
    pub config: MitosisConfig,
    pub store: Arc<dyn TaskStore>,
    pub llm: Arc<dyn LanguageModel>,
    pub events: Arc<EventBroadcaster>,
    pub engine: Arc<TaskEngine>,
    pub worker: TaskWorker,
    pub planner: Arc<PlanGenerator>,
    pub classifier: Arc<dyn IntentClassifier>,
}

impl Services {
    pub async fn build(config: MitosisConfig) -> Result<Self> {
        let store = open_store(&config.store).await.context("open task store")?;
        let llm: Arc<dyn LanguageModel> =
            Arc::new(OllamaClient::new(&config.llm).context("build llm client")?);
        let tools = ToolRegistry::builtin(&config.tools, Arc::clone(&llm));
        Self::assemble(config, store, llm, tools)
    }

    /// Assemble from explicit collaborators. Tests use this to inject
    /// scripted tools and models.
    pub fn assemble(
        config: MitosisConfig,
        store: Arc<dyn TaskStore>,
        llm: Arc<dyn LanguageModel>,
        tools: ToolRegistry,
    ) -> Result<Self> {
        let events = Arc::new(EventBroadcaster::new(config.events.connection_buffer));
        let planner_llm = config.llm.plan_with_llm.then(|| Arc::clone(&llm));
        let planner = PlanGenerator::new(planner_llm, tools.catalog()).context("build planner")?;
        let engine = TaskEngine::new(
            Arc::clone(&store),
            Arc::new(tools),
            EngineConfig::from_config(&config),
        )
        .with_events(Arc::clone(&events));
        let engine = Arc::new(engine);
        let worker = TaskWorker::from_config(Arc::clone(&engine), &config);
        debug!(store = store.backend(), model = llm.model(), "services assembled");
        Ok(Self {
            config,
            store,
            llm,
            events,
            engine,
            worker,
            planner: Arc::new(planner),
            classifier: Arc::new(RuleClassifier::new()),
        })
    }

    /// Plan `request` and create a task for it. The task is left `created`.
    pub async fn create_planned_task(
        &self,
        request: &str,
        task_id: Option<String>,
    ) -> Result<(Task, PlanDraft), EngineError> {
        let draft = self.planner.generate(request).await;
        let task = self
            .engine
            .create_task(NewTask {
                task_id,
                title: draft.enhanced_title.clone(),
                steps: draft.steps.clone(),
                origin_message: Some(request.to_string()),
            })
            .await?;
        Ok((task, draft))
    }

    /// Classify and answer a chat message. Task requests are planned,
    /// created, started, and handed to the worker before this returns.
    pub async fn chat(&self, message: &str, task_id: Option<String>) -> Result<ChatOutcome, EngineError> {
        let memory_used = match task_id.as_deref() {
            Some(id) => !self.engine.conversation(id).await?.is_empty(),
            None => false,
        };
        let intent = self.classifier.classify(message);

        if intent == IntentType::Casual {
            let response = self.casual_reply(message).await;
            if let Some(id) = task_id.as_deref() {
                self.engine.record_message(id, "user", message).await?;
                self.engine.record_message(id, "assistant", &response).await?;
            }
            return Ok(ChatOutcome {
                intent,
                response,
                task: None,
                draft: None,
                memory_used,
            });
        }

        let (task, draft) = self.create_planned_task(message, task_id).await?;
        let task = self.engine.start_task(&task.task_id).await?;
        self.worker.enqueue(&task.task_id);
        let response = format!(
            "I created a {}-step plan for \"{}\" and started working on it.",
            task.plan.len(),
            task.title
        );
        self.engine
            .record_message(&task.task_id, "assistant", &response)
            .await?;
        info!(task_id = %task.task_id, steps = task.plan.len(), "task created from chat");
        Ok(ChatOutcome {
            intent,
            response,
            task: Some(task),
            draft: Some(draft),
            memory_used,
        })
    }

    async fn casual_reply(&self, message: &str) -> String {
        let prompt = format!(
            "You are a helpful assistant. Reply briefly and conversationally.\n\nUser: {}\nAssistant:",
            message.trim()
        );
        match self.llm.generate(&prompt).await {
            Ok(reply) => reply.trim().to_string(),
            Err(err) => {
                warn!(err = %err, "llm unavailable for casual reply");
                CASUAL_FALLBACK.to_string()
            }
        }
    }
}
