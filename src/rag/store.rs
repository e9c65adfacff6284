//! Outbound interfaces to the knowledge store.
//!
//! The engine only reads from the store. Indexing is owned by whatever
//! ingestion pipeline populates it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::types::RetrievedFragment;

/// One hit from a single sub-search, before fusion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub fragment: RetrievedFragment,
    /// Backend similarity. Cosine for semantic hits, term coverage for
    /// lexical hits.
    pub raw_score: f32,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store returned unusable data: {0}")]
    Corrupt(String),
    #[error("unsupported search: {0}")]
    Unsupported(String),
}

impl StoreError {
    pub fn unavailable<E: std::fmt::Display>(err: E) -> Self {
        StoreError::Unavailable(err.to_string())
    }

    /// Worth another attempt after backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

#[async_trait]
pub trait EmbeddingStore: Send + Sync {
    fn name(&self) -> &str;

    /// Nearest fragments to `embedding` within `scope_id`, best first.
    async fn semantic_search(
        &self,
        embedding: &[f32],
        scope_id: &str,
        limit: usize,
    ) -> Result<Vec<Candidate>, StoreError>;

    /// Keyword matches for `text` within `scope_id`, best first.
    async fn lexical_search(
        &self,
        text: &str,
        scope_id: &str,
        limit: usize,
    ) -> Result<Vec<Candidate>, StoreError>;
}

/// Turns query text into a vector comparable with stored embeddings.
#[async_trait]
pub trait QueryEmbedder: Send + Sync {
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, StoreError>;
}
