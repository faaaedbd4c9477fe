//! Plan generation: LLM first, rule planner as the safety net.
//!
//! The LLM reply is never trusted. It must contain a JSON object that passes
//! the embedded schema and names only registered tools; anything else falls
//! back to [`rule_plan`].

use std::sync::{Arc, LazyLock};

use anyhow::{Context, Result, anyhow, bail};
use jsonschema::{Validator, validator_for};
use minijinja::{Environment, context};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::core::planner::{Complexity, PlanDraft, TaskType, rule_plan};
use crate::io::llm::LanguageModel;
use crate::task::Step;

const PLAN_TEMPLATE: &str = include_str!("prompts/plan.md");
const PLAN_SCHEMA: &str = include_str!("schemas/plan.schema.json");

const MIN_STEPS: usize = 2;
const MAX_STEPS: usize = 6;

static FENCED_JSON: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").expect("fenced json pattern should be valid")
});

#[derive(Debug, Clone, Serialize)]
struct ToolContext {
    name: String,
    description: String,
}

#[derive(Debug, Deserialize)]
struct LlmPlan {
    enhanced_title: String,
    task_type: TaskType,
    complexity: Complexity,
    steps: Vec<LlmStep>,
}

#[derive(Debug, Deserialize)]
struct LlmStep {
    title: String,
    description: String,
    tool: String,
}

pub struct PlanGenerator {
    llm: Option<Arc<dyn LanguageModel>>,
    env: Environment<'static>,
    schema: Validator,
    tools: Vec<ToolContext>,
}

impl PlanGenerator {
    /// `tools` is the registry catalog as `(name, description)` pairs.
    pub fn new(llm: Option<Arc<dyn LanguageModel>>, tools: Vec<(String, String)>) -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("plan", PLAN_TEMPLATE)
            .context("load plan template")?;
        let schema_value: Value = serde_json::from_str(PLAN_SCHEMA).context("parse plan schema")?;
        let schema = validator_for(&schema_value).map_err(|err| anyhow!("invalid plan schema: {err}"))?;
        Ok(Self {
            llm,
            env,
            schema,
            tools: tools
                .into_iter()
                .map(|(name, description)| ToolContext { name, description })
                .collect(),
        })
    }

    /// Rule planner only.
    pub fn rules_only() -> Result<Self> {
        Self::new(None, Vec::new())
    }

    /// Draft a plan for `request`. Never fails: LLM problems are logged and
    /// the rule planner answers instead.
    pub async fn generate(&self, request: &str) -> PlanDraft {
        let Some(llm) = &self.llm else {
            return rule_plan(request);
        };
        match self.generate_with_llm(llm.as_ref(), request).await {
            Ok(draft) => {
                debug!(steps = draft.steps.len(), "llm plan accepted");
                draft
            }
            Err(err) => {
                warn!(err = %format!("{err:#}"), "llm plan rejected, using rule planner");
                rule_plan(request)
            }
        }
    }

    async fn generate_with_llm(&self, llm: &dyn LanguageModel, request: &str) -> Result<PlanDraft> {
        let prompt = self.render(request)?;
        let reply = llm.generate(&prompt).await.context("llm generate")?;
        self.parse_reply(&reply)
    }

    fn render(&self, request: &str) -> Result<String> {
        let template = self.env.get_template("plan")?;
        let rendered = template.render(context! {
            request => request.trim(),
            tools => &self.tools,
            min_steps => MIN_STEPS,
            max_steps => MAX_STEPS,
        })?;
        Ok(rendered)
    }

    fn parse_reply(&self, reply: &str) -> Result<PlanDraft> {
        let raw = extract_json(reply).context("no JSON object in llm reply")?;
        let value: Value = serde_json::from_str(raw).context("parse llm plan json")?;
        if !self.schema.is_valid(&value) {
            let messages = self
                .schema
                .iter_errors(&value)
                .map(|err| err.to_string())
                .collect::<Vec<_>>();
            bail!("plan schema validation failed: {}", messages.join("; "));
        }
        let plan: LlmPlan = serde_json::from_value(value).context("deserialize llm plan")?;

        if let Some(unknown) = plan
            .steps
            .iter()
            .find(|step| !self.tools.iter().any(|tool| tool.name == step.tool))
        {
            bail!("plan names unknown tool '{}'", unknown.tool);
        }

        let steps = plan
            .steps
            .into_iter()
            .enumerate()
            .map(|(idx, step)| {
                Step::new(
                    format!("step-{}", idx + 1),
                    step.title.trim(),
                    step.description.trim(),
                    step.tool,
                )
            })
            .collect();
        Ok(PlanDraft {
            enhanced_title: plan.enhanced_title.trim().to_string(),
            task_type: plan.task_type,
            complexity: plan.complexity,
            steps,
        })
    }
}

/// A fenced JSON block if present, else the span from the first `{` to the
/// last `}`.
fn extract_json(reply: &str) -> Option<&str> {
    if let Some(caps) = FENCED_JSON.captures(reply) {
        return caps.get(1).map(|m| m.as_str());
    }
    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    (end > start).then(|| &reply[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::StaticModel;

    fn catalog() -> Vec<(String, String)> {
        vec![
            ("web_search".to_string(), "Search the web".to_string()),
            ("content_generation".to_string(), "Write text".to_string()),
        ]
    }

    fn generator(reply: Option<&str>) -> PlanGenerator {
        let llm: Arc<dyn LanguageModel> = match reply {
            Some(text) => Arc::new(StaticModel::replying(text)),
            None => Arc::new(StaticModel::failing()),
        };
        PlanGenerator::new(Some(llm), catalog()).expect("generator")
    }

    const GOOD_REPLY: &str = r#"Here is the plan:
```json
{"enhanced_title": "Rust async history", "task_type": "research", "complexity": "low",
 "steps": [
   {"title": "Search", "description": "find sources", "tool": "web_search"},
   {"title": "Write", "description": "write summary", "tool": "content_generation"}
 ]}
```"#;

    #[tokio::test]
    async fn valid_reply_becomes_plan() {
        let draft = generator(Some(GOOD_REPLY)).generate("rust async history").await;
        assert_eq!(draft.enhanced_title, "Rust async history");
        assert_eq!(draft.steps.len(), 2);
        assert_eq!(draft.steps[1].id, "step-2");
        assert_eq!(draft.steps[1].tool, "content_generation");
    }

    #[tokio::test]
    async fn unknown_tool_falls_back_to_rules() {
        let reply = r#"{"enhanced_title": "X", "task_type": "general", "complexity": "low",
            "steps": [{"title": "Browse", "description": "click", "tool": "browser"}]}"#;
        let draft = generator(Some(reply)).generate("research rust").await;
        assert_eq!(draft, rule_plan("research rust"));
    }

    #[tokio::test]
    async fn schema_violation_falls_back_to_rules() {
        let reply = r#"{"enhanced_title": "X", "task_type": "poetry", "complexity": "low", "steps": []}"#;
        let draft = generator(Some(reply)).generate("write a poem").await;
        assert_eq!(draft, rule_plan("write a poem"));
    }

    #[tokio::test]
    async fn llm_error_falls_back_to_rules() {
        let draft = generator(None).generate("research rust").await;
        assert_eq!(draft, rule_plan("research rust"));
    }

    #[test]
    fn prompt_lists_registered_tools() {
        let prompt = generator(None).render("do things").expect("render");
        assert!(prompt.contains("- `web_search`: Search the web"));
        assert!(prompt.contains("Request: do things"));
    }

    #[test]
    fn extract_json_handles_bare_objects() {
        assert_eq!(extract_json("sure: {\"a\": 1} done"), Some("{\"a\": 1}"));
        assert_eq!(extract_json("no json here"), None);
    }
}
