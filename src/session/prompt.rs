//! Chat prompt assembly.
//!
//! Prompts use a plain role-prefixed layout that any instruction-tuned GGUF
//! model copes with:
//!
//! ```text
//! System: <system prompt>
//!
//! User: <earlier turn>
//! Assistant: <earlier reply>
//! User: <new message>
//! Assistant:
//! ```

use crate::transcript::{Role, TranscriptMessage};

const SYSTEM_SEPARATOR: &str = "\n\n";

/// Fluent builder for one chat-turn prompt.
#[derive(Debug, Default)]
pub struct PromptBuilder {
    system: Option<String>,
    turns: Vec<(Role, String)>,
}

impl PromptBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Leading system instructions.  Blank text is skipped.
    pub fn system(mut self, text: impl Into<String>) -> Self {
        let s = text.into();
        let trimmed = s.trim();
        self.system = (!trimmed.is_empty()).then(|| trimmed.to_string());
        self
    }

    /// Append earlier transcript messages in order.  Empty messages (e.g. a
    /// failed assistant turn) carry nothing for the model and are skipped.
    pub fn history<'a, I>(mut self, messages: I) -> Self
    where
        I: IntoIterator<Item = &'a TranscriptMessage>,
    {
        for m in messages {
            let content = m.content.trim();
            if !content.is_empty() {
                self.turns.push((m.role, content.to_string()));
            }
        }
        self
    }

    /// Finish with the new user message and an open assistant turn.
    pub fn build(self, user_message: &str) -> String {
        let mut prompt = String::new();
        if let Some(system) = &self.system {
            prompt.push_str("System: ");
            prompt.push_str(system);
            prompt.push_str(SYSTEM_SEPARATOR);
        }
        for (role, content) in &self.turns {
            prompt.push_str(label(*role));
            prompt.push_str(": ");
            prompt.push_str(content);
            prompt.push('\n');
        }
        prompt.push_str("User: ");
        prompt.push_str(user_message.trim());
        prompt.push_str("\nAssistant:");
        prompt
    }
}

fn label(role: Role) -> &'static str {
    match role {
        Role::User => "User",
        Role::Assistant => "Assistant",
    }
}
