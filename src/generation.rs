//! # Generation providers
//!
//! Conversation → text, behind the [`GenerationProvider`] capability.
//!
//! A provider can answer in one piece ([`GenerationProvider::complete`]) or as a
//! finite stream of text fragments ([`GenerationProvider::stream`]). Dropping a
//! [`FragmentStream`] releases the underlying connection, so callers that stop
//! early (cancellation, failure) do not need any extra cleanup.
//!
//! Implementations:
//! - [`OpenAiGeneration`]: chat completions on an OpenAI-compatible server.
//! - [`ScriptedGeneration`]: replays queued [`Script`]s; used by tests to drive the
//!   orchestrator and dispatcher without a model server.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_openai::{
    Client,
    config::OpenAIConfig,
    error::OpenAIError,
    types::{
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequest, CreateChatCompletionRequestArgs, Role,
    },
};
use async_trait::async_trait;
use futures::{StreamExt, stream::BoxStream};
use tracing::debug;

use crate::error::RagError;
use crate::session_messages::ChatMessage;

/// Connect timeout for backend HTTP clients. Generation itself is bounded by the
/// per-task deadline, not by the HTTP client.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Incremental text fragments of one generation.
pub type FragmentStream = BoxStream<'static, Result<String, RagError>>;

/// Something that can generate a reply to a conversation.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// Generate the full reply in one call.
    async fn complete(&self, model: &str, messages: &[ChatMessage]) -> Result<String, RagError>;

    /// Start a streamed generation.
    async fn stream(&self, model: &str, messages: &[ChatMessage])
    -> Result<FragmentStream, RagError>;
}

/// Creates an OpenAI-compatible API client.
///
/// # Parameters
/// - `api_base`: Base URL including the version prefix, e.g. `http://localhost:11434/v1`.
/// - `api_key`: Bearer token; local servers usually accept anything.
pub fn create_client(api_base: &str, api_key: &str) -> Result<Client<OpenAIConfig>, RagError> {
    let openai_config = OpenAIConfig::new()
        .with_api_key(api_key)
        .with_api_base(api_base);
    let http_client = reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .map_err(|e| RagError::Internal(format!("http client: {e}")))?;
    debug!("Client created with api base {}", api_base);
    Ok(Client::with_config(openai_config).with_http_client(http_client))
}

/// Chat completions against an OpenAI-compatible server.
pub struct OpenAiGeneration {
    client: Client<OpenAIConfig>,
}

impl OpenAiGeneration {
    pub fn new(client: Client<OpenAIConfig>) -> Self {
        Self { client }
    }

    fn build_request(
        model: &str,
        messages: &[ChatMessage],
    ) -> Result<CreateChatCompletionRequest, OpenAIError> {
        let messages = messages
            .iter()
            .map(to_request_message)
            .collect::<Result<Vec<_>, _>>()?;
        CreateChatCompletionRequestArgs::default()
            .model(model)
            .messages(messages)
            .build()
    }
}

/// Convert a session message into the OpenAI request type.
fn to_request_message(message: &ChatMessage) -> Result<ChatCompletionRequestMessage, OpenAIError> {
    let content = message.content.clone();
    Ok(match message.role {
        Role::System => ChatCompletionRequestSystemMessageArgs::default()
            .content(content)
            .build()?
            .into(),
        Role::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
            .content(content)
            .build()?
            .into(),
        _ => ChatCompletionRequestUserMessageArgs::default()
            .content(content)
            .build()?
            .into(),
    })
}

#[async_trait]
impl GenerationProvider for OpenAiGeneration {
    async fn complete(&self, model: &str, messages: &[ChatMessage]) -> Result<String, RagError> {
        let request = Self::build_request(model, messages)
            .map_err(|e| RagError::from_backend("chat completion", e))?;
        debug!("Sending request: {:?}", request);

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e| RagError::from_backend("chat completion", e))?;

        if response.choices.is_empty() {
            return Err(RagError::Backend(
                "chat completion: response contained no choices".into(),
            ));
        }
        Ok(response
            .choices
            .into_iter()
            .filter_map(|choice| choice.message.content)
            .collect())
    }

    async fn stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
    ) -> Result<FragmentStream, RagError> {
        let request = Self::build_request(model, messages)
            .map_err(|e| RagError::from_backend("chat completion stream", e))?;
        debug!("Sending streaming request: {:?}", request);

        let stream = self
            .client
            .chat()
            .create_stream(request)
            .await
            .map_err(|e| RagError::from_backend("chat completion stream", e))?;

        Ok(stream
            .filter_map(|item| async move {
                match item {
                    Ok(response) => {
                        let text: String = response
                            .choices
                            .into_iter()
                            .filter_map(|choice| choice.delta.content)
                            .collect();
                        (!text.is_empty()).then_some(Ok(text))
                    }
                    Err(e) => Some(Err(RagError::from_backend("chat completion stream", e))),
                }
            })
            .boxed())
    }
}

/// One scripted reply for [`ScriptedGeneration`].
#[derive(Debug, Clone, Default)]
pub struct Script {
    fragments: Vec<String>,
    delay: Duration,
    failure: Option<RagError>,
    refusal: Option<RagError>,
    stall: bool,
}

impl Script {
    /// Reply with these fragments, in order.
    pub fn reply<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fragments: fragments.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Never produce anything; the call only ends when the caller gives up.
    pub fn stalled() -> Self {
        Self {
            stall: true,
            ..Self::default()
        }
    }

    /// Fail before any fragment is produced.
    pub fn refused(err: RagError) -> Self {
        Self {
            refusal: Some(err),
            ..Self::default()
        }
    }

    /// Sleep this long before each fragment.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail with `err` after the fragments have been produced.
    pub fn then_fail(mut self, err: RagError) -> Self {
        self.failure = Some(err);
        self
    }
}

/// Deterministic generation backend.
///
/// Each call consumes the next queued [`Script`]; once the queue is empty the
/// fallback script is replayed. Every request's messages are recorded.
pub struct ScriptedGeneration {
    scripts: Mutex<VecDeque<Script>>,
    fallback: Script,
    requests: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedGeneration {
    pub fn new(fallback: Script) -> Self {
        Self {
            scripts: Mutex::new(VecDeque::new()),
            fallback,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Queue `script` for the next unscripted call.
    pub fn push(&self, script: Script) {
        lock(&self.scripts).push_back(script);
    }

    /// Messages of every request received so far.
    pub fn requests(&self) -> Vec<Vec<ChatMessage>> {
        lock(&self.requests).clone()
    }

    pub fn calls(&self) -> usize {
        lock(&self.requests).len()
    }

    fn next_script(&self, messages: &[ChatMessage]) -> Script {
        lock(&self.requests).push(messages.to_vec());
        lock(&self.scripts)
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl GenerationProvider for ScriptedGeneration {
    async fn complete(&self, _model: &str, messages: &[ChatMessage]) -> Result<String, RagError> {
        let script = self.next_script(messages);
        if let Some(err) = script.refusal {
            return Err(err);
        }
        if script.stall {
            futures::future::pending::<()>().await;
        }
        if !script.delay.is_zero() {
            tokio::time::sleep(script.delay).await;
        }
        match script.failure {
            Some(err) => Err(err),
            None => Ok(script.fragments.concat()),
        }
    }

    async fn stream(
        &self,
        _model: &str,
        messages: &[ChatMessage],
    ) -> Result<FragmentStream, RagError> {
        let script = self.next_script(messages);
        if let Some(err) = script.refusal {
            return Err(err);
        }
        if script.stall {
            return Ok(futures::stream::pending().boxed());
        }

        let delay = script.delay;
        let items = script
            .fragments
            .into_iter()
            .map(Ok)
            .chain(script.failure.map(Err));
        Ok(futures::stream::iter(items)
            .then(move |item| async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                item
            })
            .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use httpmock::prelude::*;
    use serde_json::json;

    fn setup() {
        let _ = tracing_subscriber::fmt::try_init();
    }

    fn chunk(content: &str) -> String {
        let body = json!({
            "id": "chatcmpl-1",
            "object": "chat.completion.chunk",
            "created": 1700000000,
            "model": "gemma3:4b",
            "choices": [{
                "index": 0,
                "delta": { "role": "assistant", "content": content },
                "finish_reason": null
            }]
        });
        format!("data: {body}\n\n")
    }

    #[tokio::test]
    async fn test_create_client() {
        setup();
        let client = create_client("http://mock.api.base/v1", "mock_api_key");
        assert!(client.is_ok(), "Failed to create client");
    }

    #[tokio::test]
    async fn test_openai_complete() {
        setup();
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/chat/completions")
                    .body_includes("USER PROMPT");
                then.status(200)
                    .header("content-type", "application/json")
                    .json_body(json!({
                        "id": "chatcmpl-1",
                        "object": "chat.completion",
                        "created": 1700000000,
                        "model": "gemma3:4b",
                        "choices": [{
                            "index": 0,
                            "message": { "role": "assistant", "content": "Hello there" },
                            "finish_reason": "stop"
                        }]
                    }));
            })
            .await;

        let generator = OpenAiGeneration::new(create_client(&server.url("/v1"), "").unwrap());
        let reply = generator
            .complete("gemma3:4b", &[ChatMessage::user("USER PROMPT:\nhi")])
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(reply, "Hello there");
    }

    #[tokio::test]
    async fn test_openai_stream() {
        setup();
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/chat/completions");
                then.status(200)
                    .header("content-type", "text/event-stream")
                    .body(format!("{}{}data: [DONE]\n\n", chunk("Hel"), chunk("lo")));
            })
            .await;

        let generator = OpenAiGeneration::new(create_client(&server.url("/v1"), "").unwrap());
        let fragments: Vec<String> = generator
            .stream("gemma3:4b", &[ChatMessage::user("hi")])
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();

        assert_eq!(fragments, vec!["Hel".to_string(), "lo".to_string()]);
    }

    #[tokio::test]
    async fn test_openai_api_error_is_backend_error() {
        setup();
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/chat/completions");
                then.status(404)
                    .header("content-type", "application/json")
                    .json_body(json!({
                        "error": {
                            "message": "model \"missing\" not found",
                            "type": "api_error",
                            "param": null,
                            "code": null
                        }
                    }));
            })
            .await;

        let generator = OpenAiGeneration::new(create_client(&server.url("/v1"), "").unwrap());
        let err = generator
            .complete("missing", &[ChatMessage::user("hi")])
            .await
            .unwrap_err();
        assert_eq!(
            err,
            RagError::Backend("chat completion: model \"missing\" not found".to_string())
        );
    }

    #[tokio::test]
    async fn test_openai_unreachable_is_connection_error() {
        setup();
        let generator =
            OpenAiGeneration::new(create_client("http://127.0.0.1:9/v1", "").unwrap());
        let err = generator
            .complete("gemma3:4b", &[ChatMessage::user("hi")])
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::Connection(_)));
    }

    #[tokio::test]
    async fn test_scripted_generation_replays_queue() {
        let generator = ScriptedGeneration::new(Script::reply(["fallback"]));
        generator.push(Script::reply(["a", "b"]));
        generator.push(Script::reply(["x"]).then_fail(RagError::Backend("boom".into())));

        let first: Vec<String> = generator
            .stream("m", &[ChatMessage::user("1")])
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(first, vec!["a", "b"]);

        let second: Vec<Result<String, RagError>> = generator
            .stream("m", &[ChatMessage::user("2")])
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(second.len(), 2);
        assert!(second[1].is_err());

        assert_eq!(
            generator.complete("m", &[ChatMessage::user("3")]).await.unwrap(),
            "fallback"
        );
        assert_eq!(generator.calls(), 3);
        assert_eq!(generator.requests()[2][0].content, "3");
    }
}
