//! `content_generation`: ask the LLM to write the step's deliverable.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::error::ToolExecutionError;
use crate::io::llm::LanguageModel;
use crate::io::tools::{Tool, ToolOutput, ToolRequest};

pub const NAME: &str = "content_generation";

/// Previous results are clipped so long searches cannot crowd out the
/// instruction.
const MAX_CONTEXT_CHARS: usize = 6_000;

pub struct ContentGenerationTool {
    llm: Arc<dyn LanguageModel>,
}

impl ContentGenerationTool {
    pub fn new(llm: Arc<dyn LanguageModel>) -> Self {
        Self { llm }
    }
}

fn build_prompt(request: &ToolRequest) -> String {
    let mut context = request.previous_results.join("\n\n");
    if context.chars().count() > MAX_CONTEXT_CHARS {
        context = context.chars().take(MAX_CONTEXT_CHARS).collect();
        context.push_str("\n[truncated]");
    }
    let mut prompt = format!(
        "You are completing one step of a larger task.\n\nTask: {}\nStep: {}\nInstructions: {}\n",
        request.task_title, request.step_title, request.step_description
    );
    if !context.is_empty() {
        prompt.push_str(&format!("\nResults from earlier steps:\n{context}\n"));
    }
    prompt.push_str("\nWrite the deliverable for this step in Markdown. Do not describe what you would do; do it.");
    prompt
}

#[async_trait]
impl Tool for ContentGenerationTool {
    fn name(&self) -> &str {
        NAME
    }

    fn description(&self) -> &str {
        "Write text (reports, outlines, summaries, code) with the language model."
    }

    async fn execute(&self, request: &ToolRequest) -> Result<ToolOutput, ToolExecutionError> {
        let prompt = build_prompt(request);
        let text = self
            .llm
            .generate(&prompt)
            .await
            .map_err(|e| ToolExecutionError::failed(NAME, e.to_string()))?;
        Ok(ToolOutput {
            data: json!({ "model": self.llm.model(), "characters": text.chars().count() }),
            summary: text,
        })
    }

    async fn is_available(&self) -> bool {
        self.llm.health().await
    }
}
