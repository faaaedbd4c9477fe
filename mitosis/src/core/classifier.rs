//! Intent classification for inbound chat messages.
//!
//! The classifier sits behind [`IntentClassifier`] so a model-backed
//! implementation can replace the rule set without touching the engine.

use regex::Regex;
use serde::Serialize;

/// Whether a message is small talk or asks for work to be done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentType {
    Casual,
    Task,
}

pub trait IntentClassifier: Send + Sync {
    fn classify(&self, message: &str) -> IntentType;
}

const GREETING_PATTERN: &str = r"(?i)^\s*(hi|hello|hey|hola|good (morning|afternoon|evening)|thanks|thank you|how are you|what's up|bye)\b";

const TASK_PATTERN: &str = r"(?i)\b(create|make|build|write|generate|research|search|find|analy[sz]e|compare|investigate|develop|implement|design|plan|draft|summari[sz]e|list|run|execute|install|deploy|fix|report|document|prepare)\b";

/// Word-boundary keyword rules.
///
/// - Task verbs anywhere → `Task`.
/// - Greetings or anything shorter than `min_task_words` words → `Casual`.
/// - Longer messages default to `Task`.
pub struct RuleClassifier {
    greeting: Regex,
    task: Regex,
    min_task_words: usize,
}

impl RuleClassifier {
    pub fn new() -> Self {
        Self {
            greeting: Regex::new(GREETING_PATTERN).expect("greeting pattern should be valid"),
            task: Regex::new(TASK_PATTERN).expect("task pattern should be valid"),
            min_task_words: 6,
        }
    }
}

impl Default for RuleClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl IntentClassifier for RuleClassifier {
    fn classify(&self, message: &str) -> IntentType {
        let trimmed = message.trim();
        if self.task.is_match(trimmed) {
            return IntentType::Task;
        }
        if self.greeting.is_match(trimmed) {
            return IntentType::Casual;
        }
        if trimmed.split_whitespace().count() < self.min_task_words {
            IntentType::Casual
        } else {
            IntentType::Task
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn greetings_are_casual() {
        let classifier = RuleClassifier::new();
        assert_eq!(classifier.classify("Hello there!"), IntentType::Casual);
        assert_eq!(classifier.classify("thanks"), IntentType::Casual);
    }

    #[test]
    fn task_verbs_win_over_greetings() {
        let classifier = RuleClassifier::new();
        assert_eq!(
            classifier.classify("hi, can you research rust web frameworks"),
            IntentType::Task
        );
    }

    #[test]
    fn verbs_match_whole_words_only() {
        let classifier = RuleClassifier::new();
        // "planet" contains "plan" but is not a task verb.
        assert_eq!(classifier.classify("nice planet"), IntentType::Casual);
    }

    #[test]
    fn long_messages_default_to_task() {
        let classifier = RuleClassifier::new();
        assert_eq!(
            classifier.classify("the quarterly numbers for our three regional offices"),
            IntentType::Task
        );
    }

    #[test]
    fn empty_message_is_casual() {
        assert_eq!(RuleClassifier::new().classify("   "), IntentType::Casual);
    }
}
