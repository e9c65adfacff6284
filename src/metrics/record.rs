use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::context::AugmentedPrompt;
use crate::core::errors::ErrorKind;
use crate::llm::types::{ProviderAttempt, TokenUsage};
use crate::rag::types::RetrievalResult;

/// Audit record for one end-to-end query. Built by `MetricsTimer`, never
/// modified once finished.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryMetrics {
    pub query_id: Uuid,
    /// SHA-256 of the query text; the text itself is not kept.
    pub query_hash: String,
    pub scope_id: String,
    pub template: String,
    pub streamed: bool,
    pub retrieval_latency_ms: u64,
    pub generation_latency_ms: u64,
    pub total_latency_ms: u64,
    pub fragments_retrieved: usize,
    pub fragments_used: usize,
    /// Mean relevance of the fragments that made it into the prompt.
    pub average_relevance: Option<f32>,
    pub context_used: bool,
    pub usage: TokenUsage,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub attempts: Vec<ProviderAttempt>,
    pub success: bool,
    pub error_kind: Option<ErrorKind>,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl QueryMetrics {
    /// Retries across every provider the request touched.
    pub fn total_retries(&self) -> u32 {
        self.attempts.iter().map(|a| a.retries).sum()
    }

    pub fn retries_for(&self, provider: &str) -> u32 {
        self.attempts
            .iter()
            .filter(|a| a.provider == provider)
            .map(|a| a.retries)
            .sum()
    }
}

pub fn hash_query(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}

/// Accumulates one query's measurements as it moves through the stages.
#[derive(Debug)]
pub struct MetricsTimer {
    query_id: Uuid,
    query_hash: String,
    scope_id: String,
    template: String,
    streamed: bool,
    started: Instant,
    started_at: DateTime<Utc>,
    stage_started: Option<Instant>,
    retrieval_latency_ms: u64,
    generation_latency_ms: u64,
    fragments_retrieved: usize,
    fragments_used: usize,
    average_relevance: Option<f32>,
    context_used: bool,
    estimated_input_tokens: u32,
    usage: TokenUsage,
    provider: Option<String>,
    model: Option<String>,
    attempts: Vec<ProviderAttempt>,
}

impl MetricsTimer {
    pub fn start(query_text: &str, scope_id: &str, template: &str, streamed: bool) -> Self {
        let now = Instant::now();
        Self {
            query_id: Uuid::new_v4(),
            query_hash: hash_query(query_text),
            scope_id: scope_id.to_string(),
            template: template.to_string(),
            streamed,
            started: now,
            started_at: Utc::now(),
            stage_started: Some(now),
            retrieval_latency_ms: 0,
            generation_latency_ms: 0,
            fragments_retrieved: 0,
            fragments_used: 0,
            average_relevance: None,
            context_used: false,
            estimated_input_tokens: 0,
            usage: TokenUsage::default(),
            provider: None,
            model: None,
            attempts: Vec::new(),
        }
    }

    pub fn query_id(&self) -> Uuid {
        self.query_id
    }

    pub fn retrieval_finished(&mut self, result: Option<&RetrievalResult>) {
        if let Some(started) = self.stage_started.take() {
            self.retrieval_latency_ms = elapsed_ms(started);
        }
        self.fragments_retrieved = result.map(RetrievalResult::len).unwrap_or(0);
    }

    pub fn prompt_built(&mut self, prompt: &AugmentedPrompt) {
        self.fragments_used = prompt.context.len();
        self.average_relevance = prompt.context.average_score();
        self.context_used = prompt.context_used();
        self.estimated_input_tokens = prompt.estimated_tokens as u32;
    }

    pub fn generation_started(&mut self, provider: &str, model: Option<String>) {
        self.stage_started = Some(Instant::now());
        self.provider = Some(provider.to_string());
        self.model = model;
    }

    /// Close the generation stage. Missing provider usage falls back to the
    /// prompt estimate for input tokens.
    pub fn generation_finished(
        &mut self,
        provider: Option<&str>,
        model: Option<&str>,
        usage: Option<TokenUsage>,
        attempts: Vec<ProviderAttempt>,
    ) {
        if let Some(started) = self.stage_started.take() {
            self.generation_latency_ms = elapsed_ms(started);
        }
        if let Some(provider) = provider {
            self.provider = Some(provider.to_string());
        }
        if let Some(model) = model {
            self.model = Some(model.to_string());
        }
        let mut usage = usage.unwrap_or_default();
        if usage.input_tokens == 0 {
            usage.input_tokens = self.estimated_input_tokens;
        }
        self.usage = usage;
        self.attempts = attempts;
    }

    pub fn succeed(self) -> QueryMetrics {
        self.finish(None)
    }

    pub fn fail(self, kind: ErrorKind) -> QueryMetrics {
        self.finish(Some(kind))
    }

    fn finish(self, error_kind: Option<ErrorKind>) -> QueryMetrics {
        QueryMetrics {
            query_id: self.query_id,
            query_hash: self.query_hash,
            scope_id: self.scope_id,
            template: self.template,
            streamed: self.streamed,
            retrieval_latency_ms: self.retrieval_latency_ms,
            generation_latency_ms: self.generation_latency_ms,
            total_latency_ms: elapsed_ms(self.started),
            fragments_retrieved: self.fragments_retrieved,
            fragments_used: self.fragments_used,
            average_relevance: self.average_relevance,
            context_used: self.context_used,
            usage: self.usage,
            provider: self.provider,
            model: self.model,
            attempts: self.attempts,
            success: error_kind.is_none(),
            cancelled: error_kind == Some(ErrorKind::Cancelled),
            error_kind,
            started_at: self.started_at,
            finished_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_text_is_hashed() {
        let hash = hash_query("How do I start a podcast?");
        assert_eq!(hash.len(), 64);
        assert_ne!(hash, "How do I start a podcast?");
        assert_eq!(hash, hash_query("How do I start a podcast?"));
    }

    #[test]
    fn failed_record_marks_cancellation() {
        let timer = MetricsTimer::start("q", "tenant-a", "assistant", false);
        let record = timer.fail(ErrorKind::Cancelled);
        assert!(!record.success);
        assert!(record.cancelled);
        assert_eq!(record.error_kind, Some(ErrorKind::Cancelled));
        assert!(record.finished_at >= record.started_at);
    }

    #[test]
    fn generation_usage_falls_back_to_estimate() {
        let mut timer = MetricsTimer::start("q", "tenant-a", "assistant", true);
        timer.retrieval_finished(None);
        timer.estimated_input_tokens = 120;
        timer.generation_started("openai", Some("gpt-4o-mini".into()));

        let mut attempt = ProviderAttempt::new("openai");
        attempt.attempts = 3;
        attempt.retries = 2;
        timer.generation_finished(
            Some("backup"),
            Some("backup-model"),
            Some(TokenUsage {
                input_tokens: 0,
                output_tokens: 9,
            }),
            vec![attempt, ProviderAttempt::new("backup")],
        );

        let record = timer.succeed();
        assert!(record.success);
        assert_eq!(record.provider.as_deref(), Some("backup"));
        assert_eq!(record.usage.input_tokens, 120);
        assert_eq!(record.retries_for("openai"), 2);
        assert_eq!(record.total_retries(), 2);
    }
}
