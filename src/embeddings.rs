//! # Embedding providers
//!
//! Text → vector, behind the [`EmbeddingProvider`] capability.
//!
//! Two implementations ship with the crate:
//! - [`OpenAiEmbeddings`]: calls the `/embeddings` endpoint of an OpenAI-compatible
//!   server (Ollama, llama.cpp server, OpenAI itself).
//! - [`HashedEmbeddings`]: a deterministic bag-of-words hasher for tests and
//!   offline runs. Texts that share words get similar vectors.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_openai::{Client, config::OpenAIConfig, types::CreateEmbeddingRequestArgs};
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::RagError;

/// Something that can embed text.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text.
    async fn embed_one(&self, text: &str) -> Result<Vec<f32>, RagError>;

    /// Embed a batch of texts.
    ///
    /// Returns `(text, vector)` pairs in input order. Texts whose embedding failed
    /// are omitted; callers compare lengths to find out how many were dropped.
    async fn embed_many(&self, texts: &[String]) -> Result<Vec<(String, Vec<f32>)>, RagError>;
}

/// Embeddings from an OpenAI-compatible `/embeddings` endpoint.
pub struct OpenAiEmbeddings {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiEmbeddings {
    pub fn new(client: Client<OpenAIConfig>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddings {
    async fn embed_one(&self, text: &str) -> Result<Vec<f32>, RagError> {
        let request = CreateEmbeddingRequestArgs::default()
            .model(self.model.clone())
            .input(text)
            .build()
            .map_err(|e| RagError::from_backend("embedding request", e))?;

        let response = self
            .client
            .embeddings()
            .create(request)
            .await
            .map_err(|e| RagError::from_backend("embedding request", e))?;

        response
            .data
            .into_iter()
            .next()
            .map(|embedding| embedding.embedding)
            .filter(|vector| !vector.is_empty())
            .ok_or_else(|| RagError::Backend("embedding request: no embedding returned".into()))
    }

    async fn embed_many(&self, texts: &[String]) -> Result<Vec<(String, Vec<f32>)>, RagError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let request = CreateEmbeddingRequestArgs::default()
            .model(self.model.clone())
            .input(texts.to_vec())
            .build()
            .map_err(|e| RagError::from_backend("batch embedding request", e))?;

        let response = self
            .client
            .embeddings()
            .create(request)
            .await
            .map_err(|e| RagError::from_backend("batch embedding request", e))?;

        debug!(
            requested = texts.len(),
            returned = response.data.len(),
            "Batch embedding response"
        );

        let mut slots: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        for embedding in response.data {
            let index = embedding.index as usize;
            match slots.get_mut(index) {
                Some(slot) if !embedding.embedding.is_empty() => *slot = Some(embedding.embedding),
                _ => warn!(index, "Discarding unusable embedding"),
            }
        }

        Ok(texts
            .iter()
            .zip(slots)
            .filter_map(|(text, vector)| vector.map(|v| (text.clone(), v)))
            .collect())
    }
}

/// Deterministic bag-of-words embedder.
///
/// Each lowercase alphanumeric word is hashed into one of `dimension` buckets.
/// Texts containing any of the configured failure markers fail to embed, which
/// lets tests exercise partial batches and backend errors.
pub struct HashedEmbeddings {
    dimension: usize,
    fail_markers: Vec<String>,
    calls: AtomicUsize,
}

impl HashedEmbeddings {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
            fail_markers: Vec::new(),
            calls: AtomicUsize::new(0),
        }
    }

    /// Fail to embed any text containing `marker`.
    pub fn failing_on(mut self, marker: impl Into<String>) -> Self {
        self.fail_markers.push(marker.into());
        self
    }

    /// How many times either embed method has been called.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn vectorize(&self, text: &str) -> Option<Vec<f32>> {
        if self.fail_markers.iter().any(|m| text.contains(m.as_str())) {
            return None;
        }
        let mut vector = vec![0.0f32; self.dimension];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let mut hasher = DefaultHasher::new();
            word.to_lowercase().hash(&mut hasher);
            vector[(hasher.finish() % self.dimension as u64) as usize] += 1.0;
        }
        Some(vector)
    }
}

#[async_trait]
impl EmbeddingProvider for HashedEmbeddings {
    async fn embed_one(&self, text: &str) -> Result<Vec<f32>, RagError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.vectorize(text)
            .ok_or_else(|| RagError::Backend(format!("embedding request: cannot embed {text:?}")))
    }

    async fn embed_many(&self, texts: &[String]) -> Result<Vec<(String, Vec<f32>)>, RagError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts
            .iter()
            .filter_map(|t| self.vectorize(t).map(|v| (t.clone(), v)))
            .collect())
    }
}
