//! Rule-based plan drafting.
//!
//! Deterministic fallback used whenever the LLM planner is unavailable or
//! returns something unusable.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::task::Step;

pub const TOOL_WEB_SEARCH: &str = "web_search";
pub const TOOL_SHELL: &str = "shell";
pub const TOOL_CONTENT_GENERATION: &str = "content_generation";

const MAX_TITLE_CHARS: usize = 80;

static INLINE_COMMAND: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"`([^`]+)`").expect("inline command pattern should be valid"));

static RESEARCH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(research|investigate|find|search|look up|sources?|compare)\b")
        .expect("research pattern should be valid")
});

static DEVELOPMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(code|program|script|app|api|build|implement|develop|deploy|install|run|execute)\b")
        .expect("development pattern should be valid")
});

static CONTENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(write|draft|article|blog|essay|post|email|document|story|presentation)\b")
        .expect("content pattern should be valid")
});

static ANALYSIS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(analy[sz]e|analysis|data|statistics|metrics|trends?|evaluate|assess)\b")
        .expect("analysis pattern should be valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Research,
    Development,
    Content,
    Analysis,
    General,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Low,
    Medium,
    High,
}

/// A plan ready to be turned into a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanDraft {
    pub enhanced_title: String,
    pub task_type: TaskType,
    pub complexity: Complexity,
    pub steps: Vec<Step>,
}

/// Classify the kind of work a request asks for. First match wins, in the
/// order analysis, research, content, development.
pub fn task_type(title: &str) -> TaskType {
    if ANALYSIS.is_match(title) {
        TaskType::Analysis
    } else if RESEARCH.is_match(title) {
        TaskType::Research
    } else if CONTENT.is_match(title) {
        TaskType::Content
    } else if DEVELOPMENT.is_match(title) {
        TaskType::Development
    } else {
        TaskType::General
    }
}

pub fn complexity(title: &str) -> Complexity {
    match title.split_whitespace().count() {
        0..=7 => Complexity::Low,
        8..=19 => Complexity::Medium,
        _ => Complexity::High,
    }
}

/// Capitalize, collapse whitespace, drop trailing punctuation, cap length.
pub fn enhance_title(title: &str) -> String {
    let collapsed = title.split_whitespace().collect::<Vec<_>>().join(" ");
    let trimmed = collapsed.trim_end_matches(['.', '!', '?', ',', ';', ':']);
    let mut chars = trimmed.chars();
    let mut out = match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
        None => return "Untitled task".to_string(),
    };
    if out.chars().count() > MAX_TITLE_CHARS {
        out = out.chars().take(MAX_TITLE_CHARS).collect::<String>();
        out.push('…');
    }
    out
}

/// Draft a plan from keyword rules.
///
/// Backtick-quoted text in the request becomes a leading `shell` step so
/// explicit commands run before anything is written up.
pub fn rule_plan(title: &str) -> PlanDraft {
    let enhanced_title = enhance_title(title);
    let kind = task_type(title);
    let complexity = complexity(title);
    let subject = enhanced_title.as_str();

    let mut specs: Vec<(String, String, &str)> = INLINE_COMMAND
        .captures_iter(title)
        .map(|caps| {
            let command = caps[1].trim().to_string();
            (format!("Run `{command}`"), command, TOOL_SHELL)
        })
        .collect();

    let templates: &[(&str, &str, &str)] = match kind {
        TaskType::Research => &[
            ("Research sources", "Search the web for sources about: {}", TOOL_WEB_SEARCH),
            ("Analyze findings", "Extract the key findings relevant to: {}", TOOL_CONTENT_GENERATION),
            ("Write report", "Write a structured report on: {}", TOOL_CONTENT_GENERATION),
        ],
        TaskType::Development => &[
            ("Research approach", "Look up documentation and prior art for: {}", TOOL_WEB_SEARCH),
            ("Draft implementation", "Write the implementation plan and code for: {}", TOOL_CONTENT_GENERATION),
            ("Document result", "Document usage and next steps for: {}", TOOL_CONTENT_GENERATION),
        ],
        TaskType::Content => &[
            ("Gather material", "Collect reference material about: {}", TOOL_WEB_SEARCH),
            ("Outline", "Produce an outline for: {}", TOOL_CONTENT_GENERATION),
            ("Write draft", "Write the full piece for: {}", TOOL_CONTENT_GENERATION),
        ],
        TaskType::Analysis => &[
            ("Collect data", "Find data and statistics about: {}", TOOL_WEB_SEARCH),
            ("Analyze data", "Analyze the collected data for: {}", TOOL_CONTENT_GENERATION),
            ("Summarize insights", "Summarize insights and recommendations for: {}", TOOL_CONTENT_GENERATION),
        ],
        TaskType::General => &[
            ("Gather context", "Search for background on: {}", TOOL_WEB_SEARCH),
            ("Produce result", "Produce the requested result for: {}", TOOL_CONTENT_GENERATION),
        ],
    };
    specs.extend(templates.iter().map(|(step_title, description, tool)| {
        (step_title.to_string(), description.replace("{}", subject), *tool)
    }));
    if complexity == Complexity::High {
        specs.push((
            "Review and refine".to_string(),
            format!("Review the previous results for gaps and refine them: {subject}"),
            TOOL_CONTENT_GENERATION,
        ));
    }

    let steps = specs
        .into_iter()
        .enumerate()
        .map(|(idx, (step_title, description, tool))| {
            Step::new(format!("step-{}", idx + 1), step_title, description, tool)
        })
        .collect();

    PlanDraft {
        enhanced_title,
        task_type: kind,
        complexity,
        steps,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn research_request_gets_search_first() {
        let draft = rule_plan("research the history of rust async");
        assert_eq!(draft.task_type, TaskType::Research);
        assert_eq!(draft.steps.len(), 3);
        assert_eq!(draft.steps[0].tool, TOOL_WEB_SEARCH);
        assert_eq!(draft.steps[0].id, "step-1");
        assert!(draft.steps[0].description.ends_with("Research the history of rust async"));
    }

    #[test]
    fn inline_commands_become_shell_steps() {
        let draft = rule_plan("check disk usage with `df -h` and write a summary");
        assert_eq!(draft.steps[0].tool, TOOL_SHELL);
        assert_eq!(draft.steps[0].description, "df -h");
        assert_eq!(draft.steps[1].id, "step-2");
    }

    #[test]
    fn long_requests_get_review_step() {
        let title = "write a detailed blog post comparing five different approaches to error handling across several popular programming languages today";
        let draft = rule_plan(title);
        assert_eq!(draft.complexity, Complexity::High);
        assert_eq!(draft.steps.last().map(|s| s.title.as_str()), Some("Review and refine"));
    }

    #[test]
    fn enhance_title_normalizes_text() {
        assert_eq!(enhance_title("  build   a cli tool!! "), "Build a cli tool");
        assert_eq!(enhance_title(""), "Untitled task");
        assert_eq!(enhance_title(&"x".repeat(100)).chars().count(), MAX_TITLE_CHARS + 1);
    }

    #[test]
    fn unmatched_request_is_general() {
        let draft = rule_plan("something about cats");
        assert_eq!(draft.task_type, TaskType::General);
        assert_eq!(draft.steps.len(), 2);
    }
}
