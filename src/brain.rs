//! # Brain module (prompt composition)
//!
//! The **brain** turns a session's state into the message list sent to the
//! generation backend. Given an optional retrieval context, the session
//! [`History`] and the new user prompt, it produces:
//!
//! 1. a system message with the template's context instruction followed by the
//!    retrieved context (only when a context is set),
//! 2. one user message holding, in order,
//!    - the most recent `window` history messages as a labeled transcript (only when
//!      the history is non-empty),
//!    - the raw user prompt under the template's user-prompt label.
//!
//! The brain does no I/O; it is pure string assembly so the exact wording can be
//! checked in tests.
//!
//! ## Quick start
//! ```rust
//! use avs_rag::brain::Brain;
//! use avs_rag::session_messages::{ChatMessage, History};
//! use avs_rag::template::PromptTemplate;
//!
//! let template = PromptTemplate::default();
//! let brain = Brain::new(30, &template);
//! let mut history = History::new();
//! history.push(ChatMessage::user("Hi"));
//! history.push(ChatMessage::assistant("Hello!"));
//!
//! let messages = brain.compose(Some("Rust was first released in 2015."), &history, "When?");
//! assert_eq!(messages.len(), 2);
//! assert!(messages[1].content.ends_with("USER PROMPT:\nWhen?"));
//! ```

use crate::session_messages::{ChatMessage, History};
use crate::template::PromptTemplate;

/// Number of history messages included in a prompt when not configured otherwise.
pub const DEFAULT_HISTORY_WINDOW: usize = 30;

/// Prompt composer.
#[derive(Debug, Clone)]
pub struct Brain<'a> {
    /// How many of the latest history messages are included.
    pub window: usize,
    /// Wording used for each section.
    pub template: &'a PromptTemplate,
}

impl<'a> Brain<'a> {
    pub fn new(window: usize, template: &'a PromptTemplate) -> Self {
        Self { window, template }
    }

    /// Build the message list for one generation call.
    pub fn compose(
        &self,
        context: Option<&str>,
        history: &History,
        prompt: &str,
    ) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(2);

        if let Some(context) = context {
            messages.push(ChatMessage::system(format!(
                "{} {}",
                self.template.context_instruction, context
            )));
        }

        let mut body = String::new();
        if !history.is_empty() && self.window > 0 {
            body.push_str(&self.template.transcript_label);
            body.push('\n');
            body.push_str(&history.transcript(self.window));
            body.push_str("\n\n");
        }
        body.push_str(&self.template.user_prompt_label);
        body.push('\n');
        body.push_str(prompt);

        tracing::debug!(
            context = context.is_some(),
            history = history.len(),
            "Composed prompt"
        );

        messages.push(ChatMessage::user(body));
        messages
    }
}
