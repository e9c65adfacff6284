//! Generation orchestration.
//!
//! A request walks `Pending -> Dispatched -> (Streaming | Completed | Failed)`.
//! Each provider in the chain (the requested one, then the configured
//! fallbacks) gets `1 + max_retries` attempts for retryable errors. A
//! non-retryable error ends the request immediately. Non-streaming requests
//! run under one hard deadline covering every attempt; streaming requests
//! bound each attempt's time to first chunk and never retry once a chunk has
//! been forwarded.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use super::provider::{GenerationProvider, ProviderError};
use super::registry::{ProviderEntry, ProviderRegistry};
use super::types::{
    ChatMessage, GenerationChunk, GenerationRequest, GenerationResponse, GenerationStatus,
    ProviderAttempt, ProviderCall, StreamEvent, TokenUsage,
};
use crate::core::cancel::CancelSignal;
use crate::core::config::settings::GenerationSettings;
use crate::core::errors::{GenerationError, QueryError};
use crate::core::retry::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Pending,
    Dispatched,
    Streaming,
    Completed,
    Failed,
}

impl RequestState {
    fn can_advance(self, next: RequestState) -> bool {
        use RequestState::*;
        matches!(
            (self, next),
            (Pending, Dispatched)
                | (Pending, Failed)
                | (Dispatched, Dispatched)
                | (Dispatched, Streaming)
                | (Dispatched, Completed)
                | (Dispatched, Failed)
                | (Streaming, Completed)
                | (Streaming, Failed)
        )
    }
}

#[derive(Debug)]
struct RequestTracker {
    state: RequestState,
}

impl RequestTracker {
    fn new() -> Self {
        Self {
            state: RequestState::Pending,
        }
    }

    fn advance(&mut self, next: RequestState) {
        if !self.state.can_advance(next) {
            tracing::warn!("Unexpected generation state change {:?} -> {:?}", self.state, next);
        }
        tracing::trace!("Generation state {:?} -> {:?}", self.state, next);
        self.state = next;
    }
}

/// Terminal data of a completed stream.
struct StreamSummary {
    provider: String,
    model: String,
    usage: TokenUsage,
    status: GenerationStatus,
}

#[derive(Clone)]
pub struct GenerationOrchestrator {
    registry: Arc<ProviderRegistry>,
    fallback: Vec<String>,
    retry: RetryPolicy,
    timeout: Duration,
    attempt_timeout: Duration,
    first_chunk_timeout: Duration,
}

impl GenerationOrchestrator {
    pub fn new(registry: Arc<ProviderRegistry>, settings: &GenerationSettings) -> Self {
        Self {
            registry,
            fallback: settings.fallback.clone(),
            retry: settings.retry.clone(),
            timeout: Duration::from_millis(settings.timeout_ms),
            attempt_timeout: Duration::from_millis(settings.attempt_timeout_ms),
            first_chunk_timeout: Duration::from_millis(settings.first_chunk_timeout_ms),
        }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Model a request will use on its primary provider.
    pub fn model_for(&self, request: &GenerationRequest) -> Option<String> {
        request.model.clone().or_else(|| {
            self.registry
                .get(&request.provider)
                .map(|entry| entry.model.clone())
        })
    }

    fn chain(&self, primary: &str) -> Vec<String> {
        let mut chain = vec![primary.to_string()];
        for name in &self.fallback {
            if !chain.contains(name) {
                chain.push(name.clone());
            }
        }
        chain
    }

    fn call_for(&self, entry: &ProviderEntry, request: &GenerationRequest, primary: bool) -> ProviderCall {
        let model = if primary {
            request.model.clone().unwrap_or_else(|| entry.model.clone())
        } else {
            entry.model.clone()
        };
        ProviderCall {
            model,
            temperature: request.params.temperature,
            max_output_tokens: request.params.max_output_tokens,
        }
    }

    fn backoff(&self, retry: u32, err: &ProviderError) -> Duration {
        match err {
            ProviderError::RateLimited {
                retry_after: Some(suggested),
            } => self.retry.clamp(*suggested),
            _ => self.retry.delay_for(retry),
        }
    }

    pub async fn generate(
        &self,
        request: &GenerationRequest,
        cancel: &CancelSignal,
    ) -> Result<GenerationResponse, GenerationError> {
        self.generate_tracked(request, cancel).await.0
    }

    /// `generate`, also returning the attempt log when the request fails.
    pub async fn generate_tracked(
        &self,
        request: &GenerationRequest,
        cancel: &CancelSignal,
    ) -> (Result<GenerationResponse, GenerationError>, Vec<ProviderAttempt>) {
        let mut tracker = RequestTracker::new();
        let mut attempts = Vec::new();

        if !self.registry.contains(&request.provider) {
            tracker.advance(RequestState::Failed);
            return (
                Err(GenerationError::UnknownProvider(request.provider.clone())),
                attempts,
            );
        }
        if cancel.is_cancelled() {
            tracker.advance(RequestState::Failed);
            return (Err(GenerationError::Cancelled), attempts);
        }

        let timeout_ms = self.timeout.as_millis() as u64;
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(GenerationError::Cancelled),
            result = tokio::time::timeout(
                self.timeout,
                self.run_chain(request, &mut attempts, &mut tracker),
            ) => result.unwrap_or(Err(GenerationError::Timeout(timeout_ms))),
        };
        if let Err(err) = &outcome {
            mark_interrupted(&mut attempts, err);
        }

        match &outcome {
            Ok(response) => {
                tracker.advance(RequestState::Completed);
                tracing::info!(
                    "Generation completed by '{}' ({} output tokens)",
                    response.provider,
                    response.usage.output_tokens
                );
            }
            Err(err) => {
                tracker.advance(RequestState::Failed);
                tracing::warn!("Generation failed: {}", err);
            }
        }
        (outcome, attempts)
    }

    async fn run_chain(
        &self,
        request: &GenerationRequest,
        attempts: &mut Vec<ProviderAttempt>,
        tracker: &mut RequestTracker,
    ) -> Result<GenerationResponse, GenerationError> {
        let messages = request.prompt.messages();
        let mut previous: Option<String> = None;

        for (position, name) in self.chain(&request.provider).into_iter().enumerate() {
            let Some(entry) = self.registry.get(&name) else {
                tracing::warn!("Fallback provider '{}' is not registered; skipping", name);
                continue;
            };
            if let Some(prev) = &previous {
                tracing::warn!("Substituting provider '{}' for '{}'", name, prev);
            }
            previous = Some(name.clone());

            let call = self.call_for(entry, request, position == 0);
            attempts.push(ProviderAttempt::new(&name));
            let idx = attempts.len() - 1;
            let mut retry = 0;

            loop {
                attempts[idx].attempts += 1;
                tracker.advance(RequestState::Dispatched);

                let result = tokio::time::timeout(
                    self.attempt_timeout,
                    entry.provider.complete(&messages, &call),
                )
                .await
                .unwrap_or(Err(ProviderError::Timeout));

                match result {
                    Ok(completion) => {
                        attempts[idx].succeeded = true;
                        return Ok(GenerationResponse {
                            text: completion.text,
                            provider: name,
                            model: call.model,
                            usage: completion.usage,
                            status: completion.finish.status(),
                            attempts: attempts.clone(),
                        });
                    }
                    Err(err) if !err.is_retryable() => {
                        attempts[idx].last_error = Some(err.public_reason().to_string());
                        tracing::error!("Provider '{}' failed permanently: {}", name, err);
                        return Err(GenerationError::Fatal {
                            provider: name,
                            source: err,
                        });
                    }
                    Err(err) => {
                        attempts[idx].last_error = Some(err.public_reason().to_string());
                        if retry >= self.retry.max_retries {
                            tracing::warn!(
                                "Provider '{}' exhausted {} retries: {}",
                                name,
                                retry,
                                err
                            );
                            break;
                        }
                        retry += 1;
                        attempts[idx].retries = retry;
                        let delay = self.backoff(retry, &err);
                        tracing::warn!(
                            "Provider '{}' failed ({}); retry {}/{} in {:?}",
                            name,
                            err,
                            retry,
                            self.retry.max_retries,
                            delay
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        Err(GenerationError::Exhausted {
            attempts: attempts.clone(),
        })
    }

    /// Start a streamed generation.
    ///
    /// The receiver yields `Delta` chunks and then exactly one terminal
    /// `Completed` or `Error` chunk. Dropping the receiver aborts the request.
    pub fn generate_stream(
        &self,
        request: GenerationRequest,
        cancel: CancelSignal,
    ) -> mpsc::Receiver<GenerationChunk> {
        let (tx, rx) = mpsc::channel(32);
        let this = self.clone();

        tokio::spawn(async move {
            let mut tracker = RequestTracker::new();
            let mut attempts = Vec::new();

            let outcome = this
                .stream_chain(&request, &cancel, &tx, &mut attempts, &mut tracker)
                .await;

            let terminal = match outcome {
                Ok(summary) => {
                    tracker.advance(RequestState::Completed);
                    GenerationChunk::Completed {
                        provider: summary.provider,
                        model: summary.model,
                        usage: summary.usage,
                        status: summary.status,
                        attempts,
                    }
                }
                Err(err) => {
                    tracker.advance(RequestState::Failed);
                    tracing::warn!("Streamed generation failed: {}", err);
                    mark_interrupted(&mut attempts, &err);
                    let public: QueryError = err.into();
                    GenerationChunk::Error {
                        kind: public.kind,
                        message: public.message,
                        attempts,
                    }
                }
            };
            let _ = tx.send(terminal).await;
        });

        rx
    }

    async fn stream_chain(
        &self,
        request: &GenerationRequest,
        cancel: &CancelSignal,
        tx: &mpsc::Sender<GenerationChunk>,
        attempts: &mut Vec<ProviderAttempt>,
        tracker: &mut RequestTracker,
    ) -> Result<StreamSummary, GenerationError> {
        if !self.registry.contains(&request.provider) {
            return Err(GenerationError::UnknownProvider(request.provider.clone()));
        }

        let messages = request.prompt.messages();
        let mut previous: Option<String> = None;

        for (position, name) in self.chain(&request.provider).into_iter().enumerate() {
            let Some(entry) = self.registry.get(&name) else {
                tracing::warn!("Fallback provider '{}' is not registered; skipping", name);
                continue;
            };
            if let Some(prev) = &previous {
                tracing::warn!("Substituting provider '{}' for '{}'", name, prev);
            }
            previous = Some(name.clone());

            let call = self.call_for(entry, request, position == 0);
            attempts.push(ProviderAttempt::new(&name));
            let idx = attempts.len() - 1;
            let mut retry = 0;

            loop {
                if cancel.is_cancelled() {
                    return Err(GenerationError::Cancelled);
                }
                attempts[idx].attempts += 1;
                tracker.advance(RequestState::Dispatched);

                let opened = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(GenerationError::Cancelled),
                    opened = tokio::time::timeout(
                        self.first_chunk_timeout,
                        open_stream(entry.provider.as_ref(), &messages, &call),
                    ) => opened.unwrap_or(Err(ProviderError::Timeout)),
                };

                match opened {
                    Ok((rx, first)) => {
                        tracker.advance(RequestState::Streaming);
                        return self
                            .forward(&name, call.model, rx, first, cancel, tx, &mut attempts[idx])
                            .await;
                    }
                    Err(err) if !err.is_retryable() => {
                        attempts[idx].last_error = Some(err.public_reason().to_string());
                        return Err(GenerationError::Fatal {
                            provider: name,
                            source: err,
                        });
                    }
                    Err(err) => {
                        attempts[idx].last_error = Some(err.public_reason().to_string());
                        if retry >= self.retry.max_retries {
                            tracing::warn!("Provider '{}' exhausted {} retries: {}", name, retry, err);
                            break;
                        }
                        retry += 1;
                        attempts[idx].retries = retry;
                        let delay = self.backoff(retry, &err);
                        tracing::warn!(
                            "Stream from '{}' failed before first chunk ({}); retry {}/{} in {:?}",
                            name,
                            err,
                            retry,
                            self.retry.max_retries,
                            delay
                        );
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => return Err(GenerationError::Cancelled),
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        }

        Err(GenerationError::Exhausted {
            attempts: attempts.clone(),
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn forward(
        &self,
        provider: &str,
        model: String,
        mut rx: mpsc::Receiver<Result<StreamEvent, ProviderError>>,
        first: StreamEvent,
        cancel: &CancelSignal,
        tx: &mpsc::Sender<GenerationChunk>,
        attempt: &mut ProviderAttempt,
    ) -> Result<StreamSummary, GenerationError> {
        let idle_ms = self.timeout.as_millis() as u64;
        let mut pending = Some(Ok(first));
        let mut index = 0u32;

        loop {
            let event = match pending.take() {
                Some(event) => Some(event),
                None => tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(GenerationError::Cancelled),
                    next = tokio::time::timeout(self.timeout, rx.recv()) => match next {
                        Ok(event) => event,
                        Err(_) => {
                            attempt.last_error = Some(ProviderError::Timeout.public_reason().to_string());
                            return Err(GenerationError::Timeout(idle_ms));
                        }
                    },
                },
            };

            match event {
                Some(Ok(StreamEvent::Delta(text))) => {
                    if tx.send(GenerationChunk::Delta { index, text }).await.is_err() {
                        tracing::debug!("Stream consumer went away; aborting '{}'", provider);
                        return Err(GenerationError::Cancelled);
                    }
                    index += 1;
                }
                Some(Ok(StreamEvent::Done { usage, finish })) => {
                    attempt.succeeded = true;
                    return Ok(StreamSummary {
                        provider: provider.to_string(),
                        model,
                        usage: usage.unwrap_or_default(),
                        status: finish.status(),
                    });
                }
                Some(Err(err)) => {
                    attempt.last_error = Some(err.public_reason().to_string());
                    return Err(GenerationError::Fatal {
                        provider: provider.to_string(),
                        source: err,
                    });
                }
                None => {
                    let err = ProviderError::ProviderUnavailable("stream closed without completion".into());
                    attempt.last_error = Some(err.public_reason().to_string());
                    return Err(GenerationError::Fatal {
                        provider: provider.to_string(),
                        source: err,
                    });
                }
            }
        }
    }
}

/// Stamp the in-flight attempt when the request was cut short from outside
/// the provider call.
fn mark_interrupted(attempts: &mut [ProviderAttempt], err: &GenerationError) {
    let reason = match err {
        GenerationError::Timeout(_) => ProviderError::Timeout.public_reason(),
        GenerationError::Cancelled => "cancelled",
        _ => return,
    };
    if let Some(current) = attempts.last_mut().filter(|attempt| !attempt.succeeded) {
        current.last_error = Some(reason.to_string());
    }
}

async fn open_stream(
    provider: &dyn GenerationProvider,
    messages: &[ChatMessage],
    call: &ProviderCall,
) -> Result<(mpsc::Receiver<Result<StreamEvent, ProviderError>>, StreamEvent), ProviderError> {
    let mut rx = provider.stream(messages, call).await?;
    match rx.recv().await {
        Some(Ok(event)) => Ok((rx, event)),
        Some(Err(err)) => Err(err),
        None => Err(ProviderError::ProviderUnavailable(
            "stream closed before the first chunk".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::context::AugmentedPrompt;
    use crate::core::errors::ErrorKind;
    use crate::llm::types::{Completion, FinishReason, GenerationParams};
    use crate::rag::types::RetrievalResult;

    #[derive(Clone)]
    enum Step {
        Reply(&'static str),
        Fail(ProviderError),
        Hang,
        Stream(Vec<&'static str>),
        StreamThenFail(Vec<&'static str>, ProviderError),
    }

    struct ScriptedProvider {
        steps: Mutex<VecDeque<Step>>,
        calls: AtomicUsize,
        seen: Mutex<Vec<Vec<ChatMessage>>>,
    }

    impl ScriptedProvider {
        fn new(steps: Vec<Step>) -> Arc<Self> {
            Arc::new(Self {
                steps: Mutex::new(steps.into()),
                calls: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        /// Pops the next step; the last one repeats forever.
        fn next_step(&self, messages: &[ChatMessage]) -> Step {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(messages.to_vec());
            let mut steps = self.steps.lock().unwrap();
            if steps.len() > 1 {
                steps.pop_front().unwrap()
            } else {
                steps.front().cloned().unwrap()
            }
        }
    }

    #[async_trait]
    impl GenerationProvider for ScriptedProvider {
        fn kind(&self) -> &str {
            "scripted"
        }

        async fn complete(
            &self,
            messages: &[ChatMessage],
            _call: &ProviderCall,
        ) -> Result<Completion, ProviderError> {
            match self.next_step(messages) {
                Step::Reply(text) => Ok(Completion {
                    text: text.to_string(),
                    usage: TokenUsage {
                        input_tokens: 40,
                        output_tokens: 8,
                    },
                    finish: FinishReason::Stop,
                }),
                Step::Fail(err) => Err(err),
                Step::Hang => std::future::pending().await,
                Step::Stream(_) | Step::StreamThenFail(..) => {
                    Err(ProviderError::InvalidRequest("scripted for streaming".into()))
                }
            }
        }

        async fn stream(
            &self,
            messages: &[ChatMessage],
            _call: &ProviderCall,
        ) -> Result<mpsc::Receiver<Result<StreamEvent, ProviderError>>, ProviderError> {
            let (tx, rx) = mpsc::channel(8);
            match self.next_step(messages) {
                Step::Fail(err) => return Err(err),
                Step::Hang => {
                    tokio::spawn(async move {
                        let _tx = tx;
                        std::future::pending::<()>().await;
                    });
                }
                Step::Reply(text) => {
                    tokio::spawn(async move {
                        let _ = tx.send(Ok(StreamEvent::Delta(text.to_string()))).await;
                        let _ = tx
                            .send(Ok(StreamEvent::Done {
                                usage: None,
                                finish: FinishReason::Stop,
                            }))
                            .await;
                    });
                }
                Step::Stream(parts) => {
                    tokio::spawn(async move {
                        for part in parts {
                            let _ = tx.send(Ok(StreamEvent::Delta(part.to_string()))).await;
                        }
                        let _ = tx
                            .send(Ok(StreamEvent::Done {
                                usage: Some(TokenUsage {
                                    input_tokens: 30,
                                    output_tokens: 2,
                                }),
                                finish: FinishReason::Stop,
                            }))
                            .await;
                    });
                }
                Step::StreamThenFail(parts, err) => {
                    tokio::spawn(async move {
                        for part in parts {
                            let _ = tx.send(Ok(StreamEvent::Delta(part.to_string()))).await;
                        }
                        let _ = tx.send(Err(err)).await;
                    });
                }
            }
            Ok(rx)
        }
    }

    fn settings(fallback: &[&str]) -> GenerationSettings {
        GenerationSettings {
            default_provider: "a".into(),
            fallback: fallback.iter().map(|s| s.to_string()).collect(),
            attempt_timeout_ms: 1_000,
            retry: RetryPolicy::immediate(2),
            ..GenerationSettings::default()
        }
    }

    fn orchestrator(
        providers: Vec<(&str, Arc<ScriptedProvider>)>,
        settings: &GenerationSettings,
    ) -> GenerationOrchestrator {
        let mut registry = ProviderRegistry::new();
        for (name, provider) in providers {
            registry.register(name, format!("{}-model", name), provider);
        }
        GenerationOrchestrator::new(Arc::new(registry), settings)
    }

    fn request(stream: bool) -> GenerationRequest {
        GenerationRequest {
            prompt: Arc::new(AugmentedPrompt {
                system: "You are a podcast coach.".into(),
                history: Vec::new(),
                query: "How do I start a podcast?".into(),
                context: RetrievalResult::empty(),
                dropped_fragments: 0,
                estimated_tokens: 20,
            }),
            provider: "a".into(),
            model: None,
            params: GenerationParams {
                temperature: 0.7,
                max_output_tokens: 256,
                stream,
            },
        }
    }

    async fn collect(mut rx: mpsc::Receiver<GenerationChunk>) -> Vec<GenerationChunk> {
        let mut chunks = Vec::new();
        while let Some(chunk) = rx.recv().await {
            chunks.push(chunk);
        }
        chunks
    }

    #[tokio::test]
    async fn retryable_primary_falls_back_with_identical_prompt() {
        let a = ScriptedProvider::new(vec![Step::Fail(ProviderError::ProviderUnavailable("503".into()))]);
        let b = ScriptedProvider::new(vec![Step::Reply("Start with a plan.")]);
        let orch = orchestrator(vec![("a", a.clone()), ("b", b.clone())], &settings(&["b"]));

        let response = orch.generate(&request(false), &CancelSignal::new()).await.unwrap();

        assert_eq!(response.provider, "b");
        assert_eq!(response.model, "b-model");
        assert_eq!(a.calls(), 3);
        assert_eq!(b.calls(), 1);
        assert_eq!(a.seen.lock().unwrap()[0], b.seen.lock().unwrap()[0]);
        assert_eq!(response.attempts[0].retries, 2);
        assert!(!response.attempts[0].succeeded);
        assert!(response.attempts[1].succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_on_primary_are_retried_then_substituted() {
        let a = ScriptedProvider::new(vec![Step::Hang]);
        let b = ScriptedProvider::new(vec![Step::Reply("ok")]);
        let orch = orchestrator(vec![("a", a.clone()), ("b", b.clone())], &settings(&["b"]));

        let response = orch.generate(&request(false), &CancelSignal::new()).await.unwrap();

        assert_eq!(response.provider, "b");
        let primary = &response.attempts[0];
        assert_eq!(primary.provider, "a");
        assert_eq!(primary.retries, 2);
        assert_eq!(primary.last_error.as_deref(), Some("timed out"));
    }

    #[tokio::test]
    async fn fatal_error_skips_retries_and_fallback() {
        let a = ScriptedProvider::new(vec![Step::Fail(ProviderError::AuthFailed("401".into()))]);
        let b = ScriptedProvider::new(vec![Step::Reply("never")]);
        let orch = orchestrator(vec![("a", a.clone()), ("b", b.clone())], &settings(&["b"]));

        let err = orch.generate(&request(false), &CancelSignal::new()).await.unwrap_err();

        assert!(matches!(err, GenerationError::Fatal { .. }));
        assert_eq!(a.calls(), 1);
        assert_eq!(b.calls(), 0);
    }

    #[tokio::test]
    async fn recovers_on_same_provider_after_transient_error() {
        let a = ScriptedProvider::new(vec![
            Step::Fail(ProviderError::RateLimited { retry_after: None }),
            Step::Reply("second time lucky"),
        ]);
        let orch = orchestrator(vec![("a", a.clone())], &settings(&[]));

        let response = orch.generate(&request(false), &CancelSignal::new()).await.unwrap();
        assert_eq!(response.provider, "a");
        assert_eq!(response.attempts.len(), 1);
        assert_eq!(response.attempts[0].attempts, 2);
        assert_eq!(response.status, GenerationStatus::Completed);
    }

    #[tokio::test]
    async fn exhausted_chain_reports_every_provider() {
        let a = ScriptedProvider::new(vec![Step::Fail(ProviderError::Timeout)]);
        let b = ScriptedProvider::new(vec![Step::Fail(ProviderError::Timeout)]);
        let orch = orchestrator(vec![("a", a), ("b", b)], &settings(&["b"]));

        match orch.generate(&request(false), &CancelSignal::new()).await {
            Err(GenerationError::Exhausted { attempts }) => {
                assert_eq!(attempts.len(), 2);
                assert!(attempts.iter().all(|a| a.attempts == 3));
            }
            other => panic!("expected exhaustion, got {:?}", other.map(|r| r.provider)),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hard_deadline_applies_regardless_of_retry_budget() {
        let a = ScriptedProvider::new(vec![Step::Hang]);
        let mut settings = settings(&[]);
        settings.attempt_timeout_ms = 20_000;
        let orch = orchestrator(vec![("a", a.clone())], &settings);

        let (result, attempts) = orch
            .generate_tracked(&request(false), &CancelSignal::new())
            .await;

        assert!(matches!(result, Err(GenerationError::Timeout(30_000))));
        assert_eq!(attempts[0].attempts, 2);
        assert_eq!(attempts[0].last_error.as_deref(), Some("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn first_attempt_cut_by_deadline_still_records_timeout() {
        let a = ScriptedProvider::new(vec![Step::Hang]);
        let mut settings = settings(&[]);
        settings.attempt_timeout_ms = 60_000;
        let orch = orchestrator(vec![("a", a)], &settings);

        let (result, attempts) = orch
            .generate_tracked(&request(false), &CancelSignal::new())
            .await;

        assert!(matches!(result, Err(GenerationError::Timeout(_))));
        assert_eq!(attempts[0].attempts, 1);
        assert_eq!(attempts[0].last_error.as_deref(), Some("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn default_timeouts_leave_room_for_fallback_after_hanging_primary() {
        let a = ScriptedProvider::new(vec![Step::Hang]);
        let b = ScriptedProvider::new(vec![Step::Reply("Record a pilot episode.")]);
        let settings = GenerationSettings {
            default_provider: "a".into(),
            fallback: vec!["b".into()],
            ..GenerationSettings::default()
        };
        let orch = orchestrator(vec![("a", a.clone()), ("b", b.clone())], &settings);

        let response = orch.generate(&request(false), &CancelSignal::new()).await.unwrap();

        assert_eq!(response.provider, "b");
        assert_eq!(a.calls(), 3);
        assert_eq!(b.calls(), 1);
        assert_eq!(response.attempts[0].retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_aborts_in_flight_call() {
        let a = ScriptedProvider::new(vec![Step::Hang]);
        let orch = orchestrator(vec![("a", a.clone())], &settings(&[]));
        let cancel = CancelSignal::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let (result, attempts) = orch.generate_tracked(&request(false), &cancel).await;
        assert!(matches!(result, Err(GenerationError::Cancelled)));
        assert_eq!(a.calls(), 1);
        assert_eq!(attempts[0].last_error.as_deref(), Some("cancelled"));
    }

    #[tokio::test]
    async fn unknown_provider_is_rejected() {
        let orch = orchestrator(Vec::new(), &settings(&[]));
        let err = orch.generate(&request(false), &CancelSignal::new()).await.unwrap_err();
        assert!(matches!(err, GenerationError::UnknownProvider(name) if name == "a"));
    }

    #[tokio::test]
    async fn stream_delivers_ordered_chunks_then_completion() {
        let a = ScriptedProvider::new(vec![Step::Stream(vec!["Start ", "small."])]);
        let orch = orchestrator(vec![("a", a)], &settings(&[]));

        let chunks = collect(orch.generate_stream(request(true), CancelSignal::new())).await;

        assert_eq!(chunks.len(), 3);
        assert!(matches!(&chunks[0], GenerationChunk::Delta { index: 0, text } if text == "Start "));
        assert!(matches!(&chunks[1], GenerationChunk::Delta { index: 1, text } if text == "small."));
        match &chunks[2] {
            GenerationChunk::Completed { provider, usage, .. } => {
                assert_eq!(provider, "a");
                assert_eq!(usage.output_tokens, 2);
            }
            other => panic!("expected completion, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn first_chunk_timeout_moves_to_fallback() {
        let a = ScriptedProvider::new(vec![Step::Hang]);
        let b = ScriptedProvider::new(vec![Step::Stream(vec!["hi"])]);
        let orch = orchestrator(vec![("a", a.clone()), ("b", b)], &settings(&["b"]));

        let chunks = collect(orch.generate_stream(request(true), CancelSignal::new())).await;

        assert_eq!(a.calls(), 3);
        match chunks.last().unwrap() {
            GenerationChunk::Completed { provider, attempts, .. } => {
                assert_eq!(provider, "b");
                assert_eq!(attempts[0].retries, 2);
            }
            other => panic!("expected completion, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn mid_stream_failure_ends_with_error_marker_without_retry() {
        let a = ScriptedProvider::new(vec![Step::StreamThenFail(
            vec!["partial"],
            ProviderError::ProviderUnavailable("reset".into()),
        )]);
        let b = ScriptedProvider::new(vec![Step::Stream(vec!["unused"])]);
        let orch = orchestrator(vec![("a", a.clone()), ("b", b.clone())], &settings(&["b"]));

        let chunks = collect(orch.generate_stream(request(true), CancelSignal::new())).await;

        assert_eq!(chunks.len(), 2);
        assert!(matches!(&chunks[0], GenerationChunk::Delta { text, .. } if text == "partial"));
        assert!(matches!(
            &chunks[1],
            GenerationChunk::Error { kind: ErrorKind::GenerationFailed, .. }
        ));
        assert_eq!(a.calls(), 1);
        assert_eq!(b.calls(), 0);
    }

    #[tokio::test]
    async fn cancelled_stream_ends_with_cancelled_marker() {
        let a = ScriptedProvider::new(vec![Step::Stream(vec!["never"])]);
        let orch = orchestrator(vec![("a", a.clone())], &settings(&[]));
        let cancel = CancelSignal::new();
        cancel.cancel();

        let chunks = collect(orch.generate_stream(request(true), cancel)).await;

        assert_eq!(chunks.len(), 1);
        assert!(matches!(
            &chunks[0],
            GenerationChunk::Error { kind: ErrorKind::Cancelled, .. }
        ));
        assert_eq!(a.calls(), 0);
    }

    #[test]
    fn state_machine_rejects_leaving_terminal_states() {
        assert!(RequestState::Pending.can_advance(RequestState::Dispatched));
        assert!(RequestState::Dispatched.can_advance(RequestState::Streaming));
        assert!(!RequestState::Completed.can_advance(RequestState::Dispatched));
        assert!(!RequestState::Pending.can_advance(RequestState::Streaming));
    }
}
