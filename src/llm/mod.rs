//! Generation: provider adapters, the provider registry and the
//! orchestrator that drives retries and fallback.

pub mod anthropic;
pub mod openai;
pub mod orchestrator;
pub mod provider;
pub mod registry;
pub mod sse;
pub mod types;

pub use orchestrator::{GenerationOrchestrator, RequestState};
pub use provider::{GenerationProvider, ProviderError};
pub use registry::{ProviderEntry, ProviderRegistry};
pub use types::{
    ChatMessage, GenerationChunk, GenerationParams, GenerationRequest, GenerationResponse,
    GenerationStatus, ProviderAttempt, TokenUsage,
};
