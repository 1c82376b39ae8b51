//! # avs_rag (library root)
//!
//! Retrieval-augmented chat over WebSocket, backed by OpenAI-compatible model
//! servers (e.g. Ollama) for both generation and embeddings.
//!
//! - In-memory semantic store with thresholded top-k cosine search (`vector_store`).
//! - Embedding and generation backends behind traits, with deterministic doubles
//!   for tests (`embeddings`, `generation`).
//! - Per-session conversation state and prompt composition (`orchestrator`,
//!   `brain`, `session_messages`, `template`).
//! - Single-flight, cancellable query tasks per connection (`dispatcher`,
//!   `protocol`).
//! - axum transport, document ingestion, configuration and CLI (`server`,
//!   `document`, `config`, `commands`).
//!
//! ## Query flow
//! ```text
//! client frame ─▶ QueryDispatcher ─▶ embed prompt ─▶ VectorStore::search
//!                       │                                   │
//!                       ▼                                   ▼
//!             SessionOrchestrator::query ◀──── context (hits joined by '\n')
//!                       │
//!                       ▼
//!        message* ─▶ done | error | aborted
//! ```

use directories::ProjectDirs;
use std::error::Error;
use std::path::PathBuf;

pub mod brain;
pub mod commands;
pub mod config;
pub mod dispatcher;
pub mod document;
pub mod embeddings;
pub mod error;
pub mod generation;
pub mod orchestrator;
pub mod protocol;
pub mod server;
pub mod session_messages;
pub mod template;
pub mod vector_store;

/// Return the per-platform configuration directory.
///
/// This uses [`directories::ProjectDirs`] with the application triple
/// `("com", "avs", "avsrag")`, e.g. `~/.config/avsrag` on Linux.
///
/// The directory is **not** created by this function.
///
/// # Errors
/// Returns an error if the platform configuration directory cannot be determined.
pub fn config_dir() -> Result<PathBuf, Box<dyn Error>> {
    let proj_dirs = ProjectDirs::from("com", "avs", "avsrag")
        .ok_or("Unable to determine config directory")?;
    Ok(proj_dirs.config_dir().to_path_buf())
}
