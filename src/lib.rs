//! Retrieval-augmented generation engine.
//!
//! A query flows through [`rag::Retriever`] (hybrid semantic and lexical
//! search), [`context::PromptBuilder`] (templated prompt under a token
//! budget), [`llm::GenerationOrchestrator`] (provider retries and fallback),
//! [`citation::extract_citations`] and finally [`metrics::MetricsRecorder`].
//! [`engine::RagEngine`] wires the stages together.

pub mod citation;
pub mod context;
pub mod core;
pub mod engine;
pub mod llm;
pub mod metrics;
pub mod rag;
pub mod server;
pub mod state;

pub use engine::{QueryEvent, QueryRequest, QueryResponse, RagEngine};
