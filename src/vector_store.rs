//! # VectorStore
//!
//! In-memory embedding table used for retrieval.
//!
//! The store maps a key (in practice a chunk of the ingested document) to its
//! embedding and answers nearest-neighbor queries by scanning **every** entry and
//! scoring it with cosine similarity. There is no index structure and nothing is
//! written to disk; a search costs `O(N·D)` for `N` entries of width `D`.
//!
//! ## Invariants
//! - Every stored vector has the same dimension. The first insert into an empty
//!   store fixes it; [`VectorStore::clear`] releases it again.
//! - Zero-length vectors are rejected.
//! - Keys are unique. Re-adding a key overwrites its vector in place.
//!
//! ## Ordering
//! Entries are kept in insertion order and results are sorted with a stable sort,
//! so entries with equal similarity come back in the order they were first added.
//!
//! ## Quick Example
//! ```rust
//! use avs_rag::vector_store::VectorStore;
//!
//! let mut store = VectorStore::new();
//! store
//!     .add_vectors([
//!         ("a".to_string(), vec![1.0, 0.0]),
//!         ("b".to_string(), vec![0.0, 1.0]),
//!         ("c".to_string(), vec![1.0, 1.0]),
//!     ])
//!     .unwrap();
//! let hits = store.search(&[1.0, 0.0], 2, 0.5).unwrap();
//! assert_eq!(hits, vec!["a".to_string(), "c".to_string()]);
//! ```

use std::collections::HashMap;

use crate::error::VectorStoreError;

/// Number of keys returned by a search when the caller has no preference.
pub const DEFAULT_TOP_K: usize = 5;

/// Minimum similarity a key must reach to be returned when the caller has no preference.
pub const DEFAULT_THRESHOLD: f32 = 0.5;

/// One stored key and its embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorRecord {
    pub key: String,
    pub vector: Vec<f32>,
}

/// Brute-force cosine-similarity store.
#[derive(Debug, Default)]
pub struct VectorStore {
    /// Records in first-insertion order.
    records: Vec<VectorRecord>,
    /// Key → position in `records`.
    positions: HashMap<String, usize>,
    /// Dimension shared by all records; `None` while empty.
    dimension: Option<usize>,
}

impl VectorStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Dimension of the stored vectors, if any are stored.
    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    /// Look up the vector stored under `key`.
    pub fn get_vector(&self, key: &str) -> Option<&[f32]> {
        self.positions
            .get(key)
            .map(|&i| self.records[i].vector.as_slice())
    }

    /// Merge `vectors` into the store, overwriting existing keys.
    ///
    /// The batch is validated before anything is written: if any vector is empty
    /// or disagrees with the store's dimension (or with the rest of the batch when
    /// the store is empty), the call fails and the store is left unchanged.
    ///
    /// # Errors
    /// - [`VectorStoreError::EmptyVector`] for a zero-length vector.
    /// - [`VectorStoreError::DimensionMismatch`] for a vector of the wrong width.
    pub fn add_vectors<I>(&mut self, vectors: I) -> Result<(), VectorStoreError>
    where
        I: IntoIterator<Item = (String, Vec<f32>)>,
    {
        let batch: Vec<(String, Vec<f32>)> = vectors.into_iter().collect();

        let mut dimension = self.dimension;
        for (key, vector) in &batch {
            if vector.is_empty() {
                return Err(VectorStoreError::EmptyVector { key: key.clone() });
            }
            match dimension {
                Some(expected) if expected != vector.len() => {
                    return Err(VectorStoreError::DimensionMismatch {
                        expected,
                        actual: vector.len(),
                    });
                }
                Some(_) => {}
                None => dimension = Some(vector.len()),
            }
        }

        for (key, vector) in batch {
            match self.positions.get(&key) {
                Some(&i) => self.records[i].vector = vector,
                None => {
                    self.positions.insert(key.clone(), self.records.len());
                    self.records.push(VectorRecord { key, vector });
                }
            }
        }
        self.dimension = dimension;

        Ok(())
    }

    /// Remove every record. Prior search results no longer refer to stored data.
    pub fn clear(&mut self) {
        self.records.clear();
        self.positions.clear();
        self.dimension = None;
    }

    /// Return up to `top_k` keys whose similarity to `query` is at least `threshold`,
    /// best first.
    ///
    /// An empty store yields an empty result for any query.
    ///
    /// # Errors
    /// [`VectorStoreError::DimensionMismatch`] if the store is non-empty and `query`
    /// has a different width than the stored vectors.
    pub fn search(
        &self,
        query: &[f32],
        top_k: usize,
        threshold: f32,
    ) -> Result<Vec<String>, VectorStoreError> {
        Ok(self
            .scored_search(query, top_k, threshold)?
            .into_iter()
            .map(|(key, _)| key)
            .collect())
    }

    /// Like [`search`](Self::search) but keeps the similarity next to each key.
    pub fn scored_search(
        &self,
        query: &[f32],
        top_k: usize,
        threshold: f32,
    ) -> Result<Vec<(String, f32)>, VectorStoreError> {
        let Some(dimension) = self.dimension else {
            return Ok(Vec::new());
        };
        if query.len() != dimension {
            return Err(VectorStoreError::DimensionMismatch {
                expected: dimension,
                actual: query.len(),
            });
        }

        let mut scored = Vec::with_capacity(self.records.len());
        for record in &self.records {
            let similarity = cosine_similarity(query, &record.vector)?;
            if similarity >= threshold {
                scored.push((record, similarity));
            }
        }

        // stable: equal scores stay in insertion order
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.truncate(top_k);

        Ok(scored
            .into_iter()
            .map(|(record, similarity)| (record.key.clone(), similarity))
            .collect())
    }
}

/// Cosine similarity: `a·b / (|a|·|b|)`.
///
/// Returns `0.0` when either vector has zero norm.
///
/// # Errors
/// [`VectorStoreError::DimensionMismatch`] if `a` and `b` differ in length.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f32, VectorStoreError> {
    if a.len() != b.len() {
        return Err(VectorStoreError::DimensionMismatch {
            expected: a.len(),
            actual: b.len(),
        });
    }

    let (mut dot, mut norm_a, mut norm_b) = (0.0f32, 0.0f32, 0.0f32);
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return Ok(0.0);
    }
    Ok(dot / (norm_a.sqrt() * norm_b.sqrt()))
}
