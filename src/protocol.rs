//! # Wire protocol
//!
//! JSON text frames exchanged on a session connection.
//!
//! Inbound:
//!
//! | frame | meaning |
//! |---|---|
//! | `{"content": "<prompt>"}` | query request |
//! | `{"type": "abort"}` | cancel the running query |
//!
//! Outbound frames all have the shape `{"type": <kind>, "content": <string>}` with
//! kind one of `message`, `done`, `error`, `aborted` (see [`ServerEvent`]).

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::RagError;

/// Content of the `done` event.
pub const DONE_MESSAGE: &str = "Query completed successfully.";

/// Content of the `aborted` event sent in reply to an abort request.
pub const ABORTED_MESSAGE: &str = "Query aborted";

/// A parsed inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientCommand {
    Query { content: String },
    Abort,
}

impl ClientCommand {
    /// Parse one inbound text frame.
    ///
    /// # Errors
    /// [`RagError::InvalidInput`] if the frame is not a JSON object, names an unknown
    /// `type`, or is a query without a string `content`.
    pub fn parse(frame: &str) -> Result<Self, RagError> {
        let value: JsonValue = serde_json::from_str(frame)
            .map_err(|_| RagError::InvalidInput("Invalid JSON object passed.".into()))?;
        let JsonValue::Object(object) = value else {
            return Err(RagError::InvalidInput("Expected a JSON object.".into()));
        };

        match object.get("type") {
            Some(JsonValue::String(kind)) if kind == "abort" => return Ok(ClientCommand::Abort),
            None | Some(JsonValue::Null) => {}
            Some(JsonValue::String(kind)) if kind == "query" => {}
            Some(other) => {
                return Err(RagError::InvalidInput(format!(
                    "Unknown message type: {other}"
                )));
            }
        }

        match object.get("content") {
            Some(JsonValue::String(content)) => Ok(ClientCommand::Query {
                content: content.clone(),
            }),
            Some(_) => Err(RagError::InvalidInput("content must be a string.".into())),
            None => Err(RagError::InvalidInput(
                "No content provided in the message.".into(),
            )),
        }
    }
}

/// An outbound frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "content", rename_all = "lowercase")]
pub enum ServerEvent {
    /// One streamed fragment.
    Message(String),
    /// Generation finished.
    Done(String),
    /// Recoverable failure; the session stays open.
    Error(String),
    /// The running query was cancelled.
    Aborted(String),
}

impl ServerEvent {
    pub fn done() -> Self {
        ServerEvent::Done(DONE_MESSAGE.to_string())
    }

    pub fn aborted() -> Self {
        ServerEvent::Aborted(ABORTED_MESSAGE.to_string())
    }

    pub fn error(err: &RagError) -> Self {
        ServerEvent::Error(err.to_string())
    }

    /// `true` for `done`, `error` and `aborted`.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ServerEvent::Message(_))
    }

    /// Serialize to a JSON text frame.
    pub fn to_frame(&self) -> String {
        // a map of two string fields always serializes
        serde_json::to_string(self).unwrap_or_default()
    }
}
