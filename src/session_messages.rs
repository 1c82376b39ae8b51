//! # Session Messages Module
//!
//! Conversation history for one session.
//!
//! A [`History`] is an ordered, append-only list of [`ChatMessage`]s owned by a
//! single [`SessionOrchestrator`](crate::orchestrator::SessionOrchestrator). It lives
//! exactly as long as the connection that created it and is never persisted.
//!
//! Storage is unbounded for the session's lifetime; prompt construction only ever
//! reads the most recent slice through [`History::window`].

use async_openai::types::Role;
use serde::{Deserialize, Serialize};

/// A single turn (role + content).
///
/// # Examples
/// ```rust
/// use avs_rag::session_messages::ChatMessage;
/// use async_openai::types::Role;
///
/// let m = ChatMessage::user("Hello, world!");
/// assert_eq!(m.role, Role::User);
/// assert_eq!(m.content, "Hello, world!");
/// ```
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ChatMessage {
    /// The role of the message (System / User / Assistant).
    pub role: Role,
    /// The textual content of the message.
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Human-readable label for transcripts.
    pub fn role_label(&self) -> &'static str {
        match self.role {
            Role::System => "System",
            Role::User => "User",
            Role::Assistant => "Assistant",
            _ => "Tool",
        }
    }
}

/// Append-only conversation history.
#[derive(Debug, Default, Clone)]
pub struct History {
    messages: Vec<ChatMessage>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// All stored messages, oldest first.
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// The most recent `size` messages, oldest first.
    pub fn window(&self, size: usize) -> &[ChatMessage] {
        let start = self.messages.len().saturating_sub(size);
        &self.messages[start..]
    }

    /// Render the most recent `size` messages as `Role: content` lines.
    pub fn transcript(&self, size: usize) -> String {
        self.window(size)
            .iter()
            .map(|m| format!("{}: {}", m.role_label(), m.content))
            .collect::<Vec<_>>()
            .join("\n")
    }
}
