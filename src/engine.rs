//! End-to-end query flow: retrieve, augment, generate, attribute, record.
//!
//! Retrieval and augmentation failures end the query before any provider
//! is called. Every query, whatever its outcome, produces exactly one
//! `QueryMetrics` record.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::citation::{extract_citations, Citation};
use crate::context::{AugmentedPrompt, ConversationTurn, PromptBuilder, TemplateRegistry};
use crate::core::cancel::CancelSignal;
use crate::core::config::EngineConfig;
use crate::core::errors::{ErrorKind, QueryError};
use crate::llm::types::{GenerationChunk, GenerationParams, GenerationRequest, GenerationStatus};
use crate::llm::{GenerationOrchestrator, ProviderRegistry};
use crate::metrics::{MetricsRecorder, MetricsTimer, QueryMetrics};
use crate::rag::{EmbeddingStore, QueryEmbedder, Retriever};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    pub scope_id: String,
    pub query_text: String,
    pub template_name: String,
    #[serde(default)]
    pub history: Vec<ConversationTurn>,
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub min_score: Option<f32>,
    #[serde(default)]
    pub stream: bool,
    /// Provider to try first; defaults to `generation.default_provider`.
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

impl QueryRequest {
    pub fn new(
        scope_id: impl Into<String>,
        query_text: impl Into<String>,
        template_name: impl Into<String>,
    ) -> Self {
        Self {
            scope_id: scope_id.into(),
            query_text: query_text.into(),
            template_name: template_name.into(),
            history: Vec::new(),
            top_k: None,
            min_score: None,
            stream: false,
            provider: None,
            model: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponse {
    pub response_text: String,
    pub citations: Vec<Citation>,
    /// False when retrieval found nothing and the answer is ungrounded.
    pub context_used: bool,
    pub status: GenerationStatus,
    pub provider: String,
    pub model: String,
    pub metrics: QueryMetrics,
}

/// Items of a streamed query: chunks, then one `Done` or `Error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueryEvent {
    Chunk { index: u32, text: String },
    Done(Box<QueryResponse>),
    Error {
        error: QueryError,
        metrics: Box<QueryMetrics>,
    },
}

impl QueryEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, QueryEvent::Chunk { .. })
    }
}

/// Everything generation needs, produced by the retrieval and augmentation
/// stages.
struct Prepared {
    prompt: Arc<AugmentedPrompt>,
    request: GenerationRequest,
}

#[derive(Clone)]
pub struct RagEngine {
    config: Arc<EngineConfig>,
    retriever: Retriever,
    prompts: PromptBuilder,
    templates: TemplateRegistry,
    orchestrator: GenerationOrchestrator,
    recorder: Arc<MetricsRecorder>,
}

impl RagEngine {
    pub fn new(
        config: Arc<EngineConfig>,
        store: Arc<dyn EmbeddingStore>,
        embedder: Option<Arc<dyn QueryEmbedder>>,
        providers: ProviderRegistry,
        recorder: Arc<MetricsRecorder>,
    ) -> Self {
        let retriever = Retriever::new(store, embedder, config.retrieval.clone());
        let prompts = PromptBuilder::new(&config.prompt);
        let templates = TemplateRegistry::from_settings(&config.templates);
        let orchestrator = GenerationOrchestrator::new(Arc::new(providers), &config.generation);
        Self {
            config,
            retriever,
            prompts,
            templates,
            orchestrator,
            recorder,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn templates(&self) -> &TemplateRegistry {
        &self.templates
    }

    pub fn providers(&self) -> &ProviderRegistry {
        self.orchestrator.registry()
    }

    pub fn recorder(&self) -> &MetricsRecorder {
        &self.recorder
    }

    pub async fn query(
        &self,
        request: &QueryRequest,
        cancel: &CancelSignal,
    ) -> Result<QueryResponse, QueryError> {
        let mut timer = MetricsTimer::start(
            &request.query_text,
            &request.scope_id,
            &request.template_name,
            false,
        );

        let prepared = match self.prepare(request, cancel, &mut timer).await {
            Ok(prepared) => prepared,
            Err(err) => return Err(self.fail(timer, err)),
        };

        let (outcome, attempts) = self
            .orchestrator
            .generate_tracked(&prepared.request, cancel)
            .await;

        match outcome {
            Ok(response) => {
                timer.generation_finished(
                    Some(&response.provider),
                    Some(&response.model),
                    Some(response.usage),
                    response.attempts.clone(),
                );
                let citations = extract_citations(
                    &response.text,
                    &prepared.prompt.context,
                    &self.config.citations,
                );
                let metrics = timer.succeed();
                self.recorder.record(metrics.clone());

                Ok(QueryResponse {
                    response_text: response.text,
                    citations,
                    context_used: prepared.prompt.context_used(),
                    status: response.status,
                    provider: response.provider,
                    model: response.model,
                    metrics,
                })
            }
            Err(err) => {
                timer.generation_finished(None, None, None, attempts);
                Err(self.fail(timer, err.into()))
            }
        }
    }

    /// Streamed variant of `query`.
    ///
    /// Retrieval and augmentation run before this returns, so their errors
    /// come back directly. Once the stream is open, failures arrive as a
    /// terminal `QueryEvent::Error`. Dropping the receiver cancels the query.
    pub async fn query_stream(
        &self,
        request: &QueryRequest,
        cancel: CancelSignal,
    ) -> Result<mpsc::Receiver<QueryEvent>, QueryError> {
        let mut timer = MetricsTimer::start(
            &request.query_text,
            &request.scope_id,
            &request.template_name,
            true,
        );

        let mut prepared = match self.prepare(request, &cancel, &mut timer).await {
            Ok(prepared) => prepared,
            Err(err) => return Err(self.fail(timer, err)),
        };
        prepared.request.params.stream = true;

        let mut chunks = self
            .orchestrator
            .generate_stream(prepared.request, cancel.clone());
        let (tx, rx) = mpsc::channel(32);
        let engine = self.clone();
        let prompt = prepared.prompt;

        tokio::spawn(async move {
            let mut text = String::new();
            let mut consumer_gone = false;

            let terminal = loop {
                let next = if consumer_gone {
                    chunks.recv().await
                } else {
                    tokio::select! {
                        chunk = chunks.recv() => chunk,
                        _ = tx.closed() => {
                            tracing::debug!("Query stream consumer went away; cancelling");
                            consumer_gone = true;
                            cancel.cancel();
                            continue;
                        }
                    }
                };
                let Some(chunk) = next else {
                    break None;
                };
                match chunk {
                    GenerationChunk::Delta { index, text: delta } => {
                        text.push_str(&delta);
                        if !consumer_gone
                            && tx.send(QueryEvent::Chunk { index, text: delta }).await.is_err()
                        {
                            tracing::debug!("Query stream consumer went away; cancelling");
                            consumer_gone = true;
                            cancel.cancel();
                        }
                    }
                    terminal => break Some(terminal),
                }
            };

            let event = match terminal {
                Some(GenerationChunk::Completed {
                    provider,
                    model,
                    usage,
                    status,
                    attempts,
                }) => {
                    timer.generation_finished(Some(&provider), Some(&model), Some(usage), attempts);
                    let citations = extract_citations(&text, &prompt.context, &engine.config.citations);
                    let metrics = timer.succeed();
                    engine.recorder.record(metrics.clone());
                    QueryEvent::Done(Box::new(QueryResponse {
                        response_text: text,
                        citations,
                        context_used: prompt.context_used(),
                        status,
                        provider,
                        model,
                        metrics,
                    }))
                }
                Some(GenerationChunk::Error {
                    kind,
                    message,
                    attempts,
                }) => {
                    timer.generation_finished(None, None, None, attempts);
                    let metrics = timer.fail(kind);
                    engine.recorder.record(metrics.clone());
                    QueryEvent::Error {
                        error: QueryError::new(kind, message),
                        metrics: Box::new(metrics),
                    }
                }
                _ => {
                    timer.generation_finished(None, None, None, Vec::new());
                    let metrics = timer.fail(ErrorKind::GenerationFailed);
                    engine.recorder.record(metrics.clone());
                    QueryEvent::Error {
                        error: QueryError::new(
                            ErrorKind::GenerationFailed,
                            "generation ended without a result",
                        ),
                        metrics: Box::new(metrics),
                    }
                }
            };

            if !consumer_gone {
                let _ = tx.send(event).await;
            }
        });

        Ok(rx)
    }

    async fn prepare(
        &self,
        request: &QueryRequest,
        cancel: &CancelSignal,
        timer: &mut MetricsTimer,
    ) -> Result<Prepared, QueryError> {
        if request.query_text.trim().is_empty() {
            return Err(QueryError::invalid("query text must not be empty"));
        }
        if request.scope_id.trim().is_empty() {
            return Err(QueryError::invalid("scope id must not be empty"));
        }
        let template = self.templates.get(&request.template_name).ok_or_else(|| {
            QueryError::invalid(format!("unknown template '{}'", request.template_name))
        })?;
        let provider = request
            .provider
            .clone()
            .unwrap_or_else(|| self.config.generation.default_provider.clone());
        if !self.orchestrator.registry().contains(&provider) {
            return Err(QueryError::invalid(format!("unknown provider '{}'", provider)));
        }

        let query = self.retriever.query_for(
            &request.query_text,
            &request.scope_id,
            request.top_k,
            request.min_score,
        );
        let retrieval = self.retriever.retrieve(&query, cancel).await;
        timer.retrieval_finished(retrieval.as_ref().ok());
        let retrieval = retrieval?;

        if cancel.is_cancelled() {
            return Err(QueryError::cancelled());
        }

        let prompt = self.prompts.augment(
            &request.query_text,
            &request.history,
            &retrieval,
            template,
            self.config.prompt_token_budget(),
        )?;
        timer.prompt_built(&prompt);
        if !prompt.context_used() {
            tracing::info!(
                "No context above {:.2} for scope '{}'; answering without context",
                query.min_score,
                request.scope_id
            );
        }

        let prompt = Arc::new(prompt);
        let generation = GenerationRequest {
            prompt: prompt.clone(),
            provider,
            model: request.model.clone(),
            params: GenerationParams {
                temperature: self.config.generation.temperature,
                max_output_tokens: self.config.generation.max_output_tokens,
                stream: request.stream,
            },
        };
        timer.generation_started(&generation.provider, self.orchestrator.model_for(&generation));

        Ok(Prepared {
            prompt,
            request: generation,
        })
    }

    fn fail(&self, timer: MetricsTimer, err: QueryError) -> QueryError {
        tracing::warn!("Query {} failed: {}", timer.query_id(), err);
        self.recorder.record(timer.fail(err.kind));
        err
    }
}
