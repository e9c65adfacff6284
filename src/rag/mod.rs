//! Retrieval: store clients, hybrid fusion and the `Retriever` that ties
//! them together.

pub mod embedder;
pub mod fusion;
pub mod memory;
pub mod retriever;
pub mod scoring;
pub mod sqlite;
pub mod store;
pub mod types;

pub use embedder::HttpQueryEmbedder;
pub use memory::MemoryFragmentStore;
pub use retriever::Retriever;
pub use sqlite::SqliteFragmentStore;
pub use store::{Candidate, EmbeddingStore, QueryEmbedder, StoreError};
pub use types::{
    KnowledgeFragment, MatchedBy, RetrievalQuery, RetrievalResult, RetrievalStrategy,
    RetrievedFragment, ScoredFragment, SourceMetadata,
};
