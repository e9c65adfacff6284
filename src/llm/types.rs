use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::context::AugmentedPrompt;
use crate::core::errors::ErrorKind;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationParams {
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub stream: bool,
}

/// What an adapter needs for one call.
#[derive(Debug, Clone)]
pub struct ProviderCall {
    pub model: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: Arc<AugmentedPrompt>,
    pub provider: String,
    /// Overrides the provider's configured model for the primary provider only.
    pub model: Option<String>,
    pub params: GenerationParams,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl TokenUsage {
    pub fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStatus {
    Completed,
    Truncated,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FinishReason {
    #[default]
    Stop,
    /// Output hit the token limit.
    Length,
}

impl FinishReason {
    pub fn status(&self) -> GenerationStatus {
        match self {
            FinishReason::Stop => GenerationStatus::Completed,
            FinishReason::Length => GenerationStatus::Truncated,
        }
    }
}

/// A finished non-streaming call as reported by an adapter.
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub usage: TokenUsage,
    pub finish: FinishReason,
}

/// Items an adapter pushes through its stream channel.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Delta(String),
    Done {
        usage: Option<TokenUsage>,
        finish: FinishReason,
    },
}

/// Attempt accounting for one provider within one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderAttempt {
    pub provider: String,
    pub attempts: u32,
    pub retries: u32,
    pub succeeded: bool,
    pub last_error: Option<String>,
}

impl ProviderAttempt {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            attempts: 0,
            retries: 0,
            succeeded: false,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationResponse {
    pub text: String,
    pub provider: String,
    pub model: String,
    pub usage: TokenUsage,
    pub status: GenerationStatus,
    pub attempts: Vec<ProviderAttempt>,
}

/// One element of a streamed generation.
///
/// A stream is finite and ordered: zero or more `Delta`s followed by exactly
/// one `Completed` or `Error`. Receiving `Error` means the request failed,
/// whatever was delivered before it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GenerationChunk {
    Delta {
        index: u32,
        text: String,
    },
    Completed {
        provider: String,
        model: String,
        usage: TokenUsage,
        status: GenerationStatus,
        attempts: Vec<ProviderAttempt>,
    },
    Error {
        kind: ErrorKind,
        message: String,
        attempts: Vec<ProviderAttempt>,
    },
}

impl GenerationChunk {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, GenerationChunk::Delta { .. })
    }
}
