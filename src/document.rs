//! Document splitting for ingestion.
//!
//! Uploaded text is cut into sentence-sized chunks; each chunk becomes one key in
//! the [`VectorStore`](crate::vector_store::VectorStore).

use crate::error::RagError;

/// Split `text` into chunks: by line, then by `". "`, trimmed, empties dropped.
///
/// # Errors
/// [`RagError::InvalidInput`] if no non-empty chunk remains.
///
/// # Examples
/// ```rust
/// use avs_rag::document::split_document;
///
/// let chunks = split_document("Rust is fast. It is safe.\n\nFerris is a crab").unwrap();
/// assert_eq!(chunks, vec!["Rust is fast", "It is safe.", "Ferris is a crab"]);
/// ```
pub fn split_document(text: &str) -> Result<Vec<String>, RagError> {
    let chunks: Vec<String> = text
        .split('\n')
        .flat_map(|paragraph| paragraph.split(". "))
        .map(str::trim)
        .filter(|sentence| !sentence.is_empty())
        .map(String::from)
        .collect();

    if chunks.is_empty() {
        return Err(RagError::InvalidInput(
            "no valid sentences found in the document".into(),
        ));
    }
    tracing::info!(chunks = chunks.len(), "Processed document");
    Ok(chunks)
}
