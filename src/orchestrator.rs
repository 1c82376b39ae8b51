//! # Session orchestrator
//!
//! Owns one session's conversation state and drives the generation backend.
//!
//! State per session:
//! - the generation model identifier and provider,
//! - the [`History`] of completed exchanges,
//! - an optional retrieval context, replaced before each query by the dispatcher,
//! - whether replies are streamed.
//!
//! ## Query lifecycle
//! [`SessionOrchestrator::query`] pushes text fragments to a callback as they are
//! produced and returns the full reply. Cancellation is cooperative: the
//! [`CancellationToken`] is checked at every suspension point (waiting for the
//! stream to open and for each fragment), and once it fires no further fragment
//! is delivered. The backend stream is dropped on every exit path.
//!
//! History changes only on success:
//! - streaming: the user prompt and the concatenated reply are appended,
//! - non-streaming: only the assistant reply is appended.
//!
//! A cancelled or failed query leaves the history exactly as it was.

use std::sync::Arc;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::brain::{Brain, DEFAULT_HISTORY_WINDOW};
use crate::error::RagError;
use crate::generation::GenerationProvider;
use crate::session_messages::{ChatMessage, History};
use crate::template::PromptTemplate;

/// Per-session conversation state and generation driver.
pub struct SessionOrchestrator {
    model: String,
    generator: Arc<dyn GenerationProvider>,
    template: Arc<PromptTemplate>,
    history: History,
    context: Option<String>,
    stream: bool,
    history_window: usize,
}

impl SessionOrchestrator {
    /// Create a streaming orchestrator with an empty history.
    pub fn new(
        model: impl Into<String>,
        generator: Arc<dyn GenerationProvider>,
        template: Arc<PromptTemplate>,
    ) -> Self {
        Self {
            model: model.into(),
            generator,
            template,
            history: History::new(),
            context: None,
            stream: true,
            history_window: DEFAULT_HISTORY_WINDOW,
        }
    }

    pub fn with_streaming(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    /// Number of recent history messages included in each prompt.
    pub fn with_history_window(mut self, window: usize) -> Self {
        self.history_window = window;
        self
    }

    /// Replace the retrieval context. History is not touched.
    pub fn set_context(&mut self, context: Option<String>) {
        self.context = context;
    }

    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn is_streaming(&self) -> bool {
        self.stream
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Answer `prompt`, handing each fragment to `on_fragment` in production order.
    ///
    /// In non-streaming mode the whole reply is handed over as a single fragment.
    ///
    /// # Errors
    /// - [`RagError::InvalidInput`] if `prompt` is empty or whitespace; no backend
    ///   call is made.
    /// - [`RagError::Cancelled`] once `cancel` fires.
    /// - [`RagError::Connection`], [`RagError::Backend`] or [`RagError::Internal`]
    ///   from the generation backend.
    pub async fn query<F>(
        &mut self,
        prompt: &str,
        cancel: &CancellationToken,
        mut on_fragment: F,
    ) -> Result<String, RagError>
    where
        F: FnMut(String) + Send,
    {
        if prompt.trim().is_empty() {
            return Err(RagError::InvalidInput("prompt is empty".into()));
        }

        let messages = Brain::new(self.history_window, &self.template).compose(
            self.context.as_deref(),
            &self.history,
            prompt,
        );
        debug!(
            model = %self.model,
            messages = messages.len(),
            stream = self.stream,
            "Starting generation"
        );

        if !self.stream {
            let reply = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RagError::Cancelled),
                reply = self.generator.complete(&self.model, &messages) => reply?,
            };
            on_fragment(reply.clone());
            self.history.push(ChatMessage::assistant(reply.clone()));
            info!(chars = reply.len(), "Generation completed");
            return Ok(reply);
        }

        let mut fragments = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RagError::Cancelled),
            stream = self.generator.stream(&self.model, &messages) => stream?,
        };

        let mut reply = String::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    warn!(partial_chars = reply.len(), "Generation cancelled, discarding partial reply");
                    return Err(RagError::Cancelled);
                }
                next = fragments.next() => next,
            };
            match next {
                Some(Ok(fragment)) => {
                    if fragment.is_empty() {
                        continue;
                    }
                    reply.push_str(&fragment);
                    on_fragment(fragment);
                }
                Some(Err(e)) => return Err(e),
                None => break,
            }
        }

        self.history.push(ChatMessage::user(prompt));
        self.history.push(ChatMessage::assistant(reply.clone()));
        info!(chars = reply.len(), "Generation completed");
        Ok(reply)
    }
}
