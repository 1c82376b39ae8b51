//! # Query dispatcher
//!
//! Per-session state machine between the transport and the
//! [`SessionOrchestrator`].
//!
//! A dispatcher is either **Idle** or **Active** (one query task running). For each
//! inbound frame it:
//!
//! 1. parses the frame; a malformed frame produces an `error` event and nothing else,
//! 2. on `{"type": "abort"}` cancels the running task (if any), waits for it to
//!    exit, and emits `aborted`; the session keeps listening,
//! 3. on a query cancels and awaits any running task, then spawns a new one that
//!    - embeds the prompt and searches the shared [`VectorStore`] when it is not
//!      empty, setting the hits (newline-joined) as the orchestrator's context, or
//!      clearing the context when nothing matched,
//!    - runs [`SessionOrchestrator::query`], forwarding each fragment as a
//!      `message` event,
//!    - finishes with `done`, or `error` for any failure.
//!
//! Only one task exists per session and it is always awaited before the next one
//! starts, so fragments from a superseded query can never interleave with the
//! newer one. A cancelled task emits nothing; the dispatcher's own `aborted` event
//! is the signal. Each task also runs under a deadline; when it expires the task
//! is torn down the same way and the client receives `aborted`.
//!
//! The dispatcher is transport-agnostic: frames come in as a [`Stream`] of strings
//! and events go out on an unbounded channel, which the WebSocket layer in
//! [`crate::server`] (or a test) drains.

use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::embeddings::EmbeddingProvider;
use crate::error::RagError;
use crate::orchestrator::SessionOrchestrator;
use crate::protocol::{ClientCommand, ServerEvent};
use crate::vector_store::{DEFAULT_THRESHOLD, DEFAULT_TOP_K, VectorStore};

/// Default upper bound on the lifetime of one query task.
pub const DEFAULT_TASK_DEADLINE: Duration = Duration::from_secs(300);

/// Where outbound events go.
pub type EventSender = mpsc::UnboundedSender<ServerEvent>;

/// Retrieval dependencies and knobs shared by all queries of a session.
#[derive(Clone)]
pub struct Retrieval {
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub store: Arc<RwLock<VectorStore>>,
    pub top_k: usize,
    pub threshold: f32,
}

impl Retrieval {
    pub fn new(embedder: Arc<dyn EmbeddingProvider>, store: Arc<RwLock<VectorStore>>) -> Self {
        Self {
            embedder,
            store,
            top_k: DEFAULT_TOP_K,
            threshold: DEFAULT_THRESHOLD,
        }
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    /// Retrieval context for `prompt`, or `None` when the store is empty or nothing
    /// clears the threshold.
    async fn context_for(
        &self,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, RagError> {
        if self.store.read().await.is_empty() {
            return Ok(None);
        }

        let query_vector = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RagError::Cancelled),
            vector = self.embedder.embed_one(prompt) => vector?,
        };

        let hits = self
            .store
            .read()
            .await
            .search(&query_vector, self.top_k, self.threshold)?;
        debug!(hits = hits.len(), "Retrieval finished");

        Ok((!hits.is_empty()).then(|| hits.join("\n")))
    }
}

/// Observable dispatcher state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    Idle,
    Active,
}

/// The session's single task slot.
struct QueryTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl QueryTask {
    fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Signal cancellation and wait for the task to exit.
    async fn cancel(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            if e.is_panic() {
                error!("Query task panicked: {}", e);
            }
        }
    }
}

/// Per-session query state machine.
pub struct QueryDispatcher {
    session_id: u64,
    orchestrator: Arc<Mutex<SessionOrchestrator>>,
    retrieval: Retrieval,
    deadline: Duration,
    outbound: EventSender,
    current: Option<QueryTask>,
}

impl QueryDispatcher {
    pub fn new(
        session_id: u64,
        orchestrator: SessionOrchestrator,
        retrieval: Retrieval,
        outbound: EventSender,
    ) -> Self {
        Self {
            session_id,
            orchestrator: Arc::new(Mutex::new(orchestrator)),
            retrieval,
            deadline: DEFAULT_TASK_DEADLINE,
            outbound,
            current: None,
        }
    }

    /// Upper bound on a single query task.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn state(&self) -> DispatcherState {
        match &self.current {
            Some(task) if task.is_running() => DispatcherState::Active,
            _ => DispatcherState::Idle,
        }
    }

    /// Shared handle to the session's orchestrator.
    pub fn orchestrator(&self) -> Arc<Mutex<SessionOrchestrator>> {
        self.orchestrator.clone()
    }

    /// Process inbound frames until the stream ends, then cancel any running task.
    pub async fn run<S>(mut self, mut inbound: S)
    where
        S: Stream<Item = String> + Unpin,
    {
        {
            let session = self.orchestrator.lock().await;
            info!(
                session = self.session_id,
                model = %session.model(),
                stream = session.is_streaming(),
                "Session started"
            );
        }
        while let Some(frame) = inbound.next().await {
            self.handle_frame(&frame).await;
        }
        self.shutdown().await;
        info!(session = self.session_id, "Session closed");
    }

    /// Handle one inbound frame.
    pub async fn handle_frame(&mut self, frame: &str) {
        match ClientCommand::parse(frame) {
            Err(e) => {
                warn!(session = self.session_id, "Rejected inbound frame: {}", e);
                self.emit(ServerEvent::error(&e));
            }
            Ok(ClientCommand::Abort) => {
                info!(session = self.session_id, "Aborting query");
                self.cancel_current().await;
                self.emit(ServerEvent::aborted());
            }
            Ok(ClientCommand::Query { content }) => {
                self.cancel_current().await;
                self.start(content);
            }
        }
    }

    /// Cancel and await the running task, if any.
    pub async fn shutdown(&mut self) {
        self.cancel_current().await;
    }

    async fn cancel_current(&mut self) {
        if let Some(task) = self.current.take() {
            if task.is_running() {
                warn!(session = self.session_id, "Cancelling running query");
            }
            task.cancel().await;
        }
    }

    fn start(&mut self, prompt: String) {
        let cancel = CancellationToken::new();
        let span = info_span!("query", session = self.session_id);
        let handle = tokio::spawn(
            run_query(
                self.orchestrator.clone(),
                self.retrieval.clone(),
                prompt,
                cancel.clone(),
                self.deadline,
                self.outbound.clone(),
            )
            .instrument(span),
        );
        self.current = Some(QueryTask { cancel, handle });
    }

    fn emit(&self, event: ServerEvent) {
        if self.outbound.send(event).is_err() {
            debug!(session = self.session_id, "Outbound channel closed");
        }
    }
}

/// Body of one query task.
async fn run_query(
    orchestrator: Arc<Mutex<SessionOrchestrator>>,
    retrieval: Retrieval,
    prompt: String,
    cancel: CancellationToken,
    deadline: Duration,
    outbound: EventSender,
) {
    let mut session = orchestrator.lock().await;
    let fragments = outbound.clone();

    let work = async {
        // an empty prompt is rejected by the orchestrator before any backend call
        if !prompt.trim().is_empty() {
            let context = retrieval.context_for(&prompt, &cancel).await?;
            session.set_context(context);
        }
        session
            .query(&prompt, &cancel, |fragment| {
                let _ = fragments.send(ServerEvent::Message(fragment));
            })
            .await
    };

    let event = match tokio::time::timeout(deadline, work).await {
        Ok(Ok(reply)) => {
            info!(chars = reply.len(), "Query completed");
            ServerEvent::done()
        }
        Ok(Err(e)) if e.is_cancelled() => {
            info!("Query task cancelled");
            return;
        }
        Ok(Err(e)) => {
            error!("Error during query: {}", e);
            ServerEvent::error(&e)
        }
        Err(_) => {
            warn!(deadline_secs = deadline.as_secs_f64(), "Query deadline elapsed");
            ServerEvent::Aborted(format!(
                "Query aborted: no result within {} seconds",
                deadline.as_secs_f64()
            ))
        }
    };

    if cancel.is_cancelled() && !matches!(event, ServerEvent::Done(_)) {
        return;
    }
    let _ = outbound.send(event);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::HashedEmbeddings;
    use crate::generation::{Script, ScriptedGeneration};
    use crate::protocol::DONE_MESSAGE;
    use crate::template::PromptTemplate;
    use async_openai::types::Role;

    const DIMENSION: usize = 512;

    struct Harness {
        dispatcher: QueryDispatcher,
        events: mpsc::UnboundedReceiver<ServerEvent>,
        generator: Arc<ScriptedGeneration>,
        embedder: Arc<HashedEmbeddings>,
        store: Arc<RwLock<VectorStore>>,
    }

    fn harness(fallback: Script) -> Harness {
        harness_with(fallback, HashedEmbeddings::new(DIMENSION))
    }

    fn harness_with(fallback: Script, embedder: HashedEmbeddings) -> Harness {
        let _ = tracing_subscriber::fmt::try_init();
        let generator = Arc::new(ScriptedGeneration::new(fallback));
        let embedder = Arc::new(embedder);
        let store = Arc::new(RwLock::new(VectorStore::new()));
        let (tx, events) = mpsc::unbounded_channel();
        let orchestrator = SessionOrchestrator::new(
            "gemma3:4b",
            generator.clone(),
            Arc::new(PromptTemplate::default()),
        );
        let retrieval = Retrieval::new(embedder.clone(), store.clone());
        Harness {
            dispatcher: QueryDispatcher::new(1, orchestrator, retrieval, tx),
            events,
            generator,
            embedder,
            store,
        }
    }

    impl Harness {
        /// Collect events up to and including the next terminal one.
        async fn until_terminal(&mut self) -> Vec<ServerEvent> {
            let mut seen = Vec::new();
            loop {
                let event = tokio::time::timeout(Duration::from_secs(5), self.events.recv())
                    .await
                    .expect("timed out waiting for an event")
                    .expect("event channel closed");
                let terminal = event.is_terminal();
                seen.push(event);
                if terminal {
                    return seen;
                }
            }
        }

        async fn wait_for_calls(&self, calls: usize) {
            for _ in 0..500 {
                if self.generator.calls() >= calls {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            panic!("generator never reached {calls} calls");
        }
    }

    #[tokio::test]
    async fn test_query_streams_then_done() {
        let mut h = harness(Script::reply(["Hello", ", world"]));
        h.dispatcher.handle_frame(r#"{"content": "hi"}"#).await;

        assert_eq!(
            h.until_terminal().await,
            vec![
                ServerEvent::Message("Hello".into()),
                ServerEvent::Message(", world".into()),
                ServerEvent::Done(DONE_MESSAGE.into()),
            ]
        );
        // empty store: no embedding call
        assert_eq!(h.embedder.calls(), 0);
    }

    #[tokio::test]
    async fn test_malformed_frame_keeps_session_alive() {
        let mut h = harness(Script::reply(["ok"]));
        h.dispatcher.handle_frame("{not json").await;
        assert!(matches!(h.until_terminal().await.as_slice(), [ServerEvent::Error(_)]));
        assert_eq!(h.dispatcher.state(), DispatcherState::Idle);

        h.dispatcher.handle_frame(r#"{"content": "still here?"}"#).await;
        assert_eq!(
            h.until_terminal().await.last(),
            Some(&ServerEvent::done())
        );
    }

    #[tokio::test]
    async fn test_newer_query_supersedes_running_one() {
        let mut h = harness(Script::reply(["second answer"]));
        h.generator.push(Script::stalled());

        h.dispatcher.handle_frame(r#"{"content": "first"}"#).await;
        h.wait_for_calls(1).await;
        assert_eq!(h.dispatcher.state(), DispatcherState::Active);

        h.dispatcher.handle_frame(r#"{"content": "second"}"#).await;
        assert_eq!(
            h.until_terminal().await,
            vec![
                ServerEvent::Message("second answer".into()),
                ServerEvent::done(),
            ]
        );

        h.dispatcher.shutdown().await;
        assert!(h.events.try_recv().is_err());

        // the superseded exchange never reached history
        let orchestrator = h.dispatcher.orchestrator();
        let session = orchestrator.lock().await;
        let contents: Vec<&str> = session
            .history()
            .messages()
            .iter()
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(contents, vec!["second", "second answer"]);
    }

    #[tokio::test]
    async fn test_abort_cancels_and_session_continues() {
        let mut h = harness(Script::reply(["after abort"]));
        h.generator.push(Script::stalled());

        h.dispatcher.handle_frame(r#"{"content": "long question"}"#).await;
        h.wait_for_calls(1).await;
        h.dispatcher.handle_frame(r#"{"type": "abort"}"#).await;

        assert_eq!(h.until_terminal().await, vec![ServerEvent::aborted()]);
        assert_eq!(h.dispatcher.state(), DispatcherState::Idle);

        h.dispatcher.handle_frame(r#"{"content": "again"}"#).await;
        assert_eq!(
            h.until_terminal().await,
            vec![ServerEvent::Message("after abort".into()), ServerEvent::done()]
        );
    }

    #[tokio::test]
    async fn test_abort_while_idle_still_acknowledged() {
        let mut h = harness(Script::reply(["unused"]));
        h.dispatcher.handle_frame(r#"{"type": "abort"}"#).await;
        assert_eq!(h.until_terminal().await, vec![ServerEvent::aborted()]);
        assert_eq!(h.generator.calls(), 0);
    }

    #[tokio::test]
    async fn test_backend_failure_becomes_error_event() {
        let mut h = harness(Script::reply(["recovered"]));
        h.generator.push(Script::refused(RagError::Connection(
            "chat completion stream: connection refused".into(),
        )));

        h.dispatcher.handle_frame(r#"{"content": "hi"}"#).await;
        assert_eq!(
            h.until_terminal().await,
            vec![ServerEvent::Error(
                "connection error: chat completion stream: connection refused".into()
            )]
        );

        h.dispatcher.handle_frame(r#"{"content": "hi again"}"#).await;
        assert_eq!(h.until_terminal().await.last(), Some(&ServerEvent::done()));
    }

    #[tokio::test]
    async fn test_empty_prompt_makes_no_backend_calls() {
        let mut h = harness(Script::reply(["unused"]));
        h.store
            .write()
            .await
            .add_vectors([("some chunk".to_string(), vec![1.0; DIMENSION])])
            .unwrap();

        h.dispatcher.handle_frame(r#"{"content": "   "}"#).await;
        assert_eq!(
            h.until_terminal().await,
            vec![ServerEvent::Error("invalid input: prompt is empty".into())]
        );
        assert_eq!(h.embedder.calls(), 0);
        assert_eq!(h.generator.calls(), 0);
    }

    #[tokio::test]
    async fn test_retrieval_sets_and_clears_context() {
        let mut h = harness(Script::reply(["answer"]));
        let chunks = vec![
            "Ferris is the unofficial Rust mascot".to_string(),
            "Bananas are rich in potassium".to_string(),
        ];
        let vectors = h.embedder.embed_many(&chunks).await.unwrap();
        h.store.write().await.add_vectors(vectors).unwrap();

        h.dispatcher
            .handle_frame(r#"{"content": "who is the Rust mascot"}"#)
            .await;
        h.until_terminal().await;

        h.dispatcher.handle_frame(r#"{"content": "zzz qqq"}"#).await;
        h.until_terminal().await;

        let requests = h.generator.requests();
        assert_eq!(requests[0][0].role, Role::System);
        assert!(requests[0][0].content.contains("Ferris is the unofficial Rust mascot"));
        assert!(!requests[0][0].content.contains("Bananas"));
        // no hit: context cleared, no system message
        assert_eq!(requests[1][0].role, Role::User);
    }

    #[tokio::test]
    async fn test_embedding_failure_becomes_error_event() {
        let mut h = harness_with(
            Script::reply(["still fine"]),
            HashedEmbeddings::new(8).failing_on("boom"),
        );
        h.store
            .write()
            .await
            .add_vectors([("stored chunk".to_string(), vec![1.0; 8])])
            .unwrap();

        h.dispatcher.handle_frame(r#"{"content": "boom goes the backend"}"#).await;
        let events = h.until_terminal().await;
        assert!(
            matches!(events.as_slice(), [ServerEvent::Error(msg)] if msg.contains("embedding request")),
            "got {events:?}"
        );
        assert_eq!(h.generator.calls(), 0);
        assert_eq!(h.dispatcher.state(), DispatcherState::Idle);

        h.dispatcher.handle_frame(r#"{"content": "quiet question"}"#).await;
        assert_eq!(
            h.until_terminal().await,
            vec![ServerEvent::Message("still fine".into()), ServerEvent::done()]
        );
    }

    #[tokio::test]
    async fn test_store_width_change_becomes_error_event() {
        let mut h = harness(Script::reply(["after reload"]));
        h.store
            .write()
            .await
            .add_vectors([("narrow chunk".to_string(), vec![1.0; 4])])
            .unwrap();

        h.dispatcher.handle_frame(r#"{"content": "anything"}"#).await;
        let events = h.until_terminal().await;
        assert!(
            matches!(events.as_slice(), [ServerEvent::Error(msg)] if msg.contains("dimension mismatch")),
            "got {events:?}"
        );
        assert_eq!(h.generator.calls(), 0);

        // a store of the embedder's width makes the session usable again
        let mut fresh = VectorStore::new();
        fresh
            .add_vectors([("wide chunk".to_string(), vec![1.0; DIMENSION])])
            .unwrap();
        *h.store.write().await = fresh;

        h.dispatcher.handle_frame(r#"{"content": "anything"}"#).await;
        assert_eq!(h.until_terminal().await.last(), Some(&ServerEvent::done()));
    }

    #[tokio::test]
    async fn test_deadline_expiry_reports_aborted() {
        let mut h = harness(Script::stalled());
        h.dispatcher = h.dispatcher.with_deadline(Duration::from_millis(100));

        h.dispatcher.handle_frame(r#"{"content": "slow"}"#).await;
        let events = h.until_terminal().await;
        assert!(matches!(events.as_slice(), [ServerEvent::Aborted(msg)] if msg.contains("seconds")));

        let orchestrator = h.dispatcher.orchestrator();
        assert!(orchestrator.lock().await.history().is_empty());
    }
}
