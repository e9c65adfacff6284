//! Typed engine configuration.
//!
//! Every section has a complete `Default`; a deployment only has to declare
//! its generation providers.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::retry::RetryPolicy;
use crate::rag::types::RetrievalStrategy;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub server: ServerSettings,
    pub store: StoreSettings,
    pub embedding: EmbeddingSettings,
    pub retrieval: RetrievalSettings,
    pub prompt: PromptSettings,
    pub generation: GenerationSettings,
    pub providers: BTreeMap<String, ProviderSettings>,
    pub templates: BTreeMap<String, TemplateSettings>,
    pub citations: CitationSettings,
    pub metrics: MetricsSettings,
}

impl EngineConfig {
    /// Input budget handed to the prompt builder: the context window minus
    /// the reserved output budget.
    pub fn prompt_token_budget(&self) -> usize {
        self.prompt
            .context_window
            .saturating_sub(self.generation.max_output_tokens as usize)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub allowed_origins: Vec<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8787,
            allowed_origins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub backend: StoreBackend,
    /// SQLite file; defaults to `<data dir>/fragments.db`.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingSettings {
    pub enabled: bool,
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub api_key_env: Option<String>,
    pub timeout_ms: u64,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: "http://localhost:1234".to_string(),
            model: "text-embedding-3-small".to_string(),
            api_key: None,
            api_key_env: None,
            timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalSettings {
    pub strategy: RetrievalStrategy,
    pub top_k: usize,
    pub min_score: f32,
    /// Each sub-search asks for `top_k * candidate_multiplier` candidates.
    pub candidate_multiplier: usize,
    pub semantic_weight: f32,
    pub lexical_weight: f32,
    /// Scale applied to candidates found by only one sub-search.
    pub single_signal_penalty: f32,
    pub timeout_ms: u64,
    pub retry: RetryPolicy,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            strategy: RetrievalStrategy::Hybrid,
            top_k: 5,
            min_score: 0.3,
            candidate_multiplier: 3,
            semantic_weight: 0.6,
            lexical_weight: 0.4,
            single_signal_penalty: 0.85,
            timeout_ms: 5_000,
            retry: RetryPolicy {
                max_retries: 1,
                initial_backoff_ms: 100,
                max_backoff_ms: 1_000,
                multiplier: 2.0,
                jitter: true,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptSettings {
    pub context_window: usize,
    /// Most recent conversation turns considered for the prompt.
    pub history_turns: usize,
    pub chars_per_token: usize,
}

impl Default for PromptSettings {
    fn default() -> Self {
        Self {
            context_window: 8_192,
            history_turns: 6,
            chars_per_token: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationSettings {
    pub default_provider: String,
    /// Tried in order once the selected provider exhausts its retries.
    pub fallback: Vec<String>,
    pub temperature: f32,
    pub max_output_tokens: u32,
    /// Hard wall-clock deadline for a non-streaming generation, retries included.
    /// Streams use it as the longest allowed gap between chunks.
    pub timeout_ms: u64,
    /// Deadline for a single non-streaming provider call.
    pub attempt_timeout_ms: u64,
    /// Per-attempt deadline for the first streamed chunk.
    pub first_chunk_timeout_ms: u64,
    pub retry: RetryPolicy,
}

impl GenerationSettings {
    /// Longest time one provider can spend on a request before the chain
    /// moves to the next one: every attempt timing out plus the longest
    /// backoff between them.
    pub fn provider_budget(&self) -> Duration {
        let attempts = self.retry.max_retries.saturating_add(1);
        Duration::from_millis(self.attempt_timeout_ms).saturating_mul(attempts)
            + self.retry.worst_case_backoff()
    }
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            default_provider: "openai".to_string(),
            fallback: Vec::new(),
            temperature: 0.7,
            max_output_tokens: 1_024,
            timeout_ms: 30_000,
            attempt_timeout_ms: 8_000,
            first_chunk_timeout_ms: 5_000,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Any `/v1/chat/completions` compatible server (OpenAI, LM Studio, vLLM, Ollama).
    Openai,
    Anthropic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    pub kind: ProviderKind,
    #[serde(default)]
    pub base_url: Option<String>,
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Environment variable consulted when `api_key` is absent.
    #[serde(default)]
    pub api_key_env: Option<String>,
}

impl ProviderSettings {
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .or_else(|| {
                self.api_key_env
                    .as_deref()
                    .and_then(|var| std::env::var(var).ok())
            })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateSettings {
    pub persona: String,
    pub tone: String,
    pub instructions: String,
    pub expertise: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CitationSettings {
    /// Word n-gram size used for overlap scoring.
    pub ngram: usize,
    pub min_overlap: f32,
    pub excerpt_chars: usize,
}

impl Default for CitationSettings {
    fn default() -> Self {
        Self {
            ngram: 3,
            min_overlap: 0.2,
            excerpt_chars: 200,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricsSinkKind {
    #[default]
    Log,
    Jsonl,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsSettings {
    pub queue_capacity: usize,
    pub sink: MetricsSinkKind,
    /// JSONL file; defaults to `<data dir>/query_metrics.jsonl`.
    pub path: Option<PathBuf>,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 1_024,
            sink: MetricsSinkKind::Log,
            path: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config: EngineConfig = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(config.retrieval.top_k, 5);
        assert!((config.retrieval.min_score - 0.3).abs() < f32::EPSILON);
        assert_eq!(config.generation.retry.max_retries, 2);
        assert_eq!(config.retrieval.retry.max_retries, 1);
        assert_eq!(config.store.backend, StoreBackend::Memory);
    }

    #[test]
    fn budget_reserves_output_tokens() {
        let mut config = EngineConfig::default();
        config.prompt.context_window = 4_096;
        config.generation.max_output_tokens = 512;
        assert_eq!(config.prompt_token_budget(), 3_584);
    }

    #[test]
    fn default_provider_budget_fits_generation_deadline() {
        let generation = GenerationSettings::default();
        assert!(generation.provider_budget() < Duration::from_millis(generation.timeout_ms));
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let config: EngineConfig = serde_json::from_value(serde_json::json!({
            "retrieval": { "top_k": 8, "strategy": "semantic-only" },
            "providers": {
                "local": { "kind": "openai", "model": "qwen2.5", "base_url": "http://localhost:1234" }
            }
        }))
        .unwrap();
        assert_eq!(config.retrieval.top_k, 8);
        assert_eq!(config.retrieval.strategy, RetrievalStrategy::SemanticOnly);
        assert!((config.retrieval.semantic_weight - 0.6).abs() < f32::EPSILON);
        assert_eq!(config.providers["local"].kind, ProviderKind::Openai);
    }

    #[test]
    fn api_key_falls_back_to_environment() {
        std::env::set_var("TEPORA_RAG_TEST_KEY", "sk-from-env");
        let settings = ProviderSettings {
            kind: ProviderKind::Anthropic,
            base_url: None,
            model: "claude".into(),
            api_key: Some("  ".into()),
            api_key_env: Some("TEPORA_RAG_TEST_KEY".into()),
        };
        assert_eq!(settings.resolve_api_key().as_deref(), Some("sk-from-env"));
    }
}
