//! # HTTP and WebSocket transport
//!
//! axum router exposing the query protocol and the ingestion endpoints:
//!
//! | route | purpose |
//! |---|---|
//! | `GET /ws/prompt` | WebSocket upgrade; one [`QueryDispatcher`] per connection |
//! | `POST /api/upload` | replace the store content with a text document (raw `text/*` body or multipart `file` field) |
//! | `GET /api/clear-store` | empty the store |
//! | `GET /health` | liveness and store size |
//!
//! All handlers share one [`AppState`]. The vector store lives in it behind a
//! `tokio` [`RwLock`]: searches hold a read lock for the scan only, and an upload
//! embeds outside the lock before swapping the whole content under one write lock.

use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::{
    Json, Router,
    extract::{
        FromRequest, Multipart, Request, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, HeaderValue, StatusCode, header::CONTENT_TYPE},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures::{SinkExt, StreamExt, future};
use serde_json::json;
use tokio::sync::{RwLock, mpsc};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::RagConfig;
use crate::dispatcher::{EventSender, QueryDispatcher, Retrieval};
use crate::document::split_document;
use crate::embeddings::{EmbeddingProvider, OpenAiEmbeddings};
use crate::error::RagError;
use crate::generation::{GenerationProvider, OpenAiGeneration, create_client};
use crate::orchestrator::SessionOrchestrator;
use crate::protocol::ServerEvent;
use crate::template::{PromptTemplate, load_template};
use crate::vector_store::VectorStore;

/// State shared by every connection and request.
pub struct AppState {
    pub store: Arc<RwLock<VectorStore>>,
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub generator: Arc<dyn GenerationProvider>,
    pub template: Arc<PromptTemplate>,
    pub config: RagConfig,
    next_session: AtomicU64,
}

impl AppState {
    pub fn new(
        config: RagConfig,
        embedder: Arc<dyn EmbeddingProvider>,
        generator: Arc<dyn GenerationProvider>,
        template: PromptTemplate,
    ) -> Self {
        Self {
            store: Arc::new(RwLock::new(VectorStore::new())),
            embedder,
            generator,
            template: Arc::new(template),
            config,
            next_session: AtomicU64::new(1),
        }
    }

    /// Build live backend clients and load the configured prompt template.
    pub async fn from_config(config: RagConfig) -> Result<Self, Box<dyn Error>> {
        let client = create_client(&config.api_base, &config.api_key)?;
        let embedder = Arc::new(OpenAiEmbeddings::new(
            client.clone(),
            config.embedding_model.clone(),
        ));
        let generator = Arc::new(OpenAiGeneration::new(client));
        let template = match &config.template {
            Some(name) => load_template(name).await?,
            None => PromptTemplate::default(),
        };
        Ok(Self::new(config, embedder, generator, template))
    }

    /// A dispatcher for a new session, wired to this state's backends and store.
    pub fn open_session(&self, outbound: EventSender) -> QueryDispatcher {
        let session_id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let orchestrator = SessionOrchestrator::new(
            self.config.model.clone(),
            self.generator.clone(),
            self.template.clone(),
        )
        .with_streaming(self.config.stream)
        .with_history_window(self.config.history_window);
        let retrieval = Retrieval::new(self.embedder.clone(), self.store.clone())
            .with_top_k(self.config.top_k)
            .with_threshold(self.config.similarity_threshold);

        QueryDispatcher::new(session_id, orchestrator, retrieval, outbound)
            .with_deadline(self.config.task_deadline())
    }
}

/// Router with every route, request tracing and the CORS layer.
///
/// # Errors
/// [`RagError::InvalidInput`] if the configured CORS origin is not a valid header value.
pub fn build_router(state: Arc<AppState>) -> Result<Router, RagError> {
    let cors = cors_layer(state.config.cors_origin.as_deref())?;
    Ok(Router::new()
        .route("/ws/prompt", get(websocket_handler))
        .route("/api/upload", post(upload_handler))
        .route("/api/clear-store", get(clear_store_handler))
        .route("/health", get(health_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state))
}

fn cors_layer(origin: Option<&str>) -> Result<CorsLayer, RagError> {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    match origin {
        None => Ok(layer.allow_origin(Any)),
        Some(origin) => {
            let origin = origin.parse::<HeaderValue>().map_err(|e| {
                RagError::InvalidInput(format!("invalid CORS origin {origin:?}: {e}"))
            })?;
            Ok(layer.allow_origin(origin))
        }
    }
}

/// Bind, serve until Ctrl-C, then drain open connections.
pub async fn serve(config: RagConfig) -> Result<(), Box<dyn Error>> {
    let addr: SocketAddr = config.bind_address.parse()?;
    let state = Arc::new(AppState::from_config(config).await?);
    let app = build_router(state.clone())?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(
        model = %state.config.model,
        embedding_model = %state.config.embedding_model,
        "Listening on {}",
        listener.local_addr()?
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        future::pending::<()>().await;
    }
}

async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Drive one connection: inbound text frames feed the dispatcher, a writer task
/// drains its events onto the socket.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, receiver) = socket.split();
    let (outbound, mut events) = mpsc::unbounded_channel::<ServerEvent>();
    let dispatcher = state.open_session(outbound);

    let writer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if sender.send(Message::Text(event.to_frame())).await.is_err() {
                warn!("Client went away while sending an event");
                break;
            }
        }
        let _ = sender.close().await;
    });

    // pings are answered by axum; a close frame or transport error ends the session
    let inbound = receiver
        .take_while(|frame| future::ready(matches!(frame, Ok(m) if !matches!(m, Message::Close(_)))))
        .filter_map(|frame| {
            future::ready(match frame {
                Ok(Message::Text(text)) => Some(text),
                _ => None,
            })
        })
        .boxed();

    // `run` owns the last event sender, so the writer ends once it returns
    dispatcher.run(inbound).await;
    if let Err(e) = writer.await {
        error!("WebSocket writer failed: {}", e);
    }
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({"type": "error", "message": message.into()})),
    )
        .into_response()
}

fn status_for(err: &RagError) -> StatusCode {
    match err {
        RagError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        RagError::Connection(_) | RagError::Backend(_) => StatusCode::BAD_GATEWAY,
        RagError::VectorStore(_) => StatusCode::UNPROCESSABLE_ENTITY,
        RagError::Cancelled | RagError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn content_type(headers: &HeaderMap) -> String {
    headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_ascii_lowercase())
        .unwrap_or_default()
}

/// Document text from a raw `text/*` body or from the `file` part of a
/// `multipart/form-data` upload.
async fn read_document(request: Request, state: &Arc<AppState>) -> Result<String, Response> {
    let content_type = content_type(request.headers());
    if content_type.starts_with("multipart/form-data") {
        let multipart = Multipart::from_request(request, state)
            .await
            .map_err(|e| error_response(e.status(), e.body_text()))?;
        return read_file_field(multipart).await;
    }
    if !content_type.starts_with("text/") {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "Only text documents are accepted (Content-Type: text/* or a .txt file)",
        ));
    }
    String::from_request(request, state)
        .await
        .map_err(|e| error_response(e.status(), e.body_text()))
}

async fn read_file_field(mut multipart: Multipart) -> Result<String, Response> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| error_response(e.status(), e.body_text()))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let txt_name = field
            .file_name()
            .is_some_and(|name| name.to_ascii_lowercase().ends_with(".txt"));
        let text_type = field
            .content_type()
            .is_some_and(|kind| kind.to_ascii_lowercase().starts_with("text/"));
        if !txt_name && !text_type {
            return Err(error_response(
                StatusCode::BAD_REQUEST,
                "Only .txt files are accepted",
            ));
        }
        return field
            .text()
            .await
            .map_err(|e| error_response(e.status(), e.body_text()));
    }
    Err(error_response(
        StatusCode::BAD_REQUEST,
        "No file provided (expected a multipart field named \"file\")",
    ))
}

async fn upload_handler(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let body = match read_document(request, &state).await {
        Ok(body) => body,
        Err(rejection) => return rejection,
    };
    if body.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "The uploaded document is empty");
    }

    match ingest(&state, &body).await {
        Ok(chunks) => Json(json!({
            "type": "info",
            "message": format!("Document ingested: {chunks} chunks stored"),
            "chunks": chunks,
        }))
        .into_response(),
        Err(e) => {
            error!("Document ingestion failed: {}", e);
            error_response(status_for(&e), e.to_string())
        }
    }
}

/// Split, embed and swap the store content. Returns the number of stored chunks.
async fn ingest(state: &AppState, text: &str) -> Result<usize, RagError> {
    let chunks = split_document(text)?;
    let vectors = state.embedder.embed_many(&chunks).await?;
    if vectors.len() < chunks.len() {
        warn!(
            dropped = chunks.len() - vectors.len(),
            "Some chunks could not be embedded"
        );
    }
    if vectors.is_empty() {
        return Err(RagError::Backend(
            "embedding request: no chunk could be embedded".into(),
        ));
    }

    let mut fresh = VectorStore::new();
    fresh.add_vectors(vectors)?;
    let stored = fresh.len();
    *state.store.write().await = fresh;

    info!(chunks = stored, "Vector store replaced");
    Ok(stored)
}

async fn clear_store_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    state.store.write().await.clear();
    info!("Vector store cleared");
    Json(json!({"type": "info", "message": "Vector store cleared"}))
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let vectors = state.store.read().await.len();
    Json(json!({"status": "ok", "vectors": vectors}))
}
