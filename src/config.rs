//! This module provides functionality for loading and handling the service configuration.
//!
//! It defines the [`RagConfig`] struct, which holds the backend endpoint, the model
//! identifiers, the server bind address and the retrieval knobs, and a
//! [`load_config`] function to load it from a YAML file.
//!
//! # Examples
//!
//! ```no_run
//! use avs_rag::config::{RagConfig, load_config};
//!
//! let config: RagConfig = load_config("/path/to/config.yaml").unwrap();
//! println!("{:?}", config);
//! ```

use serde::{Deserialize, Serialize};
use std::{error::Error, fs, path::Path, time::Duration};

use crate::brain::DEFAULT_HISTORY_WINDOW;
use crate::dispatcher::DEFAULT_TASK_DEADLINE;
use crate::vector_store::{DEFAULT_THRESHOLD, DEFAULT_TOP_K};

/// Represents the service configuration.
///
/// Only the backend identity (`api_base`, `api_key`, `model`) is required; every
/// other field falls back to its default when missing from the file.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct RagConfig {
    /// Base URL of the OpenAI-compatible API, e.g. `http://localhost:11434/v1`.
    pub api_base: String,

    /// The API key sent with each backend request.
    pub api_key: String,

    /// Generation model identifier.
    pub model: String,

    /// Embedding model identifier.
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,

    /// Address the HTTP/WebSocket server listens on.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Stream replies fragment by fragment.
    #[serde(default = "default_stream")]
    pub stream: bool,

    /// Number of recent history messages included in each prompt.
    #[serde(default = "default_history_window")]
    pub history_window: usize,

    // Retrieval
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,

    /// Upper bound on a single query task, in seconds.
    #[serde(default = "default_task_deadline_secs")]
    pub task_deadline_secs: u64,

    /// Allowed CORS origin; any origin when unset.
    #[serde(default)]
    pub cors_origin: Option<String>,

    /// Prompt template name under `<config_dir>/templates/`.
    #[serde(default)]
    pub template: Option<String>,
}

fn default_embedding_model() -> String {
    "nomic-embed-text".to_string()
}

fn default_bind_address() -> String {
    "127.0.0.1:5000".to_string()
}

fn default_stream() -> bool {
    true
}

fn default_history_window() -> usize {
    DEFAULT_HISTORY_WINDOW
}

fn default_top_k() -> usize {
    DEFAULT_TOP_K
}

fn default_similarity_threshold() -> f32 {
    DEFAULT_THRESHOLD
}

fn default_task_deadline_secs() -> u64 {
    DEFAULT_TASK_DEADLINE.as_secs()
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            api_base: "http://localhost:11434/v1".to_string(),
            api_key: "ollama".to_string(),
            model: "gemma3:4b".to_string(),
            embedding_model: default_embedding_model(),
            bind_address: default_bind_address(),
            stream: default_stream(),
            history_window: default_history_window(),
            top_k: default_top_k(),
            similarity_threshold: default_similarity_threshold(),
            task_deadline_secs: default_task_deadline_secs(),
            cors_origin: None,
            template: None,
        }
    }
}

impl RagConfig {
    pub fn task_deadline(&self) -> Duration {
        Duration::from_secs(self.task_deadline_secs)
    }
}

/// Loads the service configuration from a YAML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or its YAML does not describe a
/// [`RagConfig`].
pub fn load_config(file: impl AsRef<Path>) -> Result<RagConfig, Box<dyn Error>> {
    let file = file.as_ref();
    tracing::info!("Loading config: {}", file.display());
    let content = fs::read_to_string(file)?;
    let config: RagConfig = serde_yaml::from_str(&content)?;
    Ok(config)
}
