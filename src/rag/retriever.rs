use std::sync::Arc;
use std::time::Duration;

use super::fusion::{fuse, FusionWeights};
use super::store::{Candidate, EmbeddingStore, QueryEmbedder, StoreError};
use super::types::{RetrievalQuery, RetrievalResult, RetrievalStrategy};
use crate::core::cancel::CancelSignal;
use crate::core::config::settings::RetrievalSettings;
use crate::core::errors::RetrievalError;

/// Runs the semantic and lexical sub-searches and fuses them into one
/// ranked result.
#[derive(Clone)]
pub struct Retriever {
    store: Arc<dyn EmbeddingStore>,
    embedder: Option<Arc<dyn QueryEmbedder>>,
    settings: RetrievalSettings,
}

impl Retriever {
    pub fn new(
        store: Arc<dyn EmbeddingStore>,
        embedder: Option<Arc<dyn QueryEmbedder>>,
        settings: RetrievalSettings,
    ) -> Self {
        if embedder.is_none() {
            tracing::info!(
                "No query embedder configured; store '{}' will be searched lexically only",
                store.name()
            );
        }
        Self {
            store,
            embedder,
            settings,
        }
    }

    pub fn settings(&self) -> &RetrievalSettings {
        &self.settings
    }

    /// Build a query from configured defaults and optional per-request overrides.
    pub fn query_for(
        &self,
        text: &str,
        scope_id: &str,
        top_k: Option<usize>,
        min_score: Option<f32>,
    ) -> RetrievalQuery {
        RetrievalQuery {
            text: text.to_string(),
            scope_id: scope_id.to_string(),
            top_k: top_k.unwrap_or(self.settings.top_k),
            min_score: min_score.unwrap_or(self.settings.min_score),
            strategy: self.settings.strategy,
        }
    }

    pub async fn retrieve(
        &self,
        query: &RetrievalQuery,
        cancel: &CancelSignal,
    ) -> Result<RetrievalResult, RetrievalError> {
        validate_query(query)?;
        if cancel.is_cancelled() {
            return Err(RetrievalError::Cancelled);
        }

        let timeout_ms = self.settings.timeout_ms;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RetrievalError::Cancelled),
            outcome = tokio::time::timeout(
                Duration::from_millis(timeout_ms),
                self.retrieve_with_retry(query),
            ) => match outcome {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!("Retrieval for scope '{}' timed out after {} ms", query.scope_id, timeout_ms);
                    Err(RetrievalError::Timeout(timeout_ms))
                }
            },
        }
    }

    async fn retrieve_with_retry(
        &self,
        query: &RetrievalQuery,
    ) -> Result<RetrievalResult, RetrievalError> {
        let policy = &self.settings.retry;
        let mut retry = 0;

        loop {
            match self.search_once(query).await {
                Ok((semantic, lexical)) => {
                    let result = self.fuse(query, semantic, lexical);
                    tracing::debug!(
                        "Retrieved {} fragments for scope '{}' (retries: {})",
                        result.len(),
                        query.scope_id,
                        retry
                    );
                    return Ok(result);
                }
                Err(err) if err.is_transient() && retry < policy.max_retries => {
                    retry += 1;
                    let delay = policy.delay_for(retry);
                    tracing::warn!(
                        "Store '{}' failed ({}); retry {}/{} in {:?}",
                        self.store.name(),
                        err,
                        retry,
                        policy.max_retries,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    tracing::error!("Store '{}' unavailable: {}", self.store.name(), err);
                    return Err(RetrievalError::BackendUnavailable(err));
                }
            }
        }
    }

    async fn search_once(
        &self,
        query: &RetrievalQuery,
    ) -> Result<(Vec<Candidate>, Vec<Candidate>), StoreError> {
        let limit = query
            .top_k
            .saturating_mul(self.settings.candidate_multiplier)
            .max(1);

        match (query.strategy, &self.embedder) {
            (RetrievalStrategy::SemanticOnly, None) => Err(StoreError::Unsupported(
                "semantic-only retrieval needs a query embedder".to_string(),
            )),
            (RetrievalStrategy::SemanticOnly, Some(embedder)) => {
                let semantic = self.semantic_search(embedder.as_ref(), query, limit).await?;
                Ok((semantic, Vec::new()))
            }
            (RetrievalStrategy::Hybrid, Some(embedder)) => {
                tokio::try_join!(
                    self.semantic_search(embedder.as_ref(), query, limit),
                    self.store.lexical_search(&query.text, &query.scope_id, limit),
                )
            }
            (RetrievalStrategy::Hybrid, None) => {
                let lexical = self
                    .store
                    .lexical_search(&query.text, &query.scope_id, limit)
                    .await?;
                Ok((Vec::new(), lexical))
            }
        }
    }

    async fn semantic_search(
        &self,
        embedder: &dyn QueryEmbedder,
        query: &RetrievalQuery,
        limit: usize,
    ) -> Result<Vec<Candidate>, StoreError> {
        let embedding = embedder.embed_query(&query.text).await?;
        self.store
            .semantic_search(&embedding, &query.scope_id, limit)
            .await
    }

    fn fuse(
        &self,
        query: &RetrievalQuery,
        semantic: Vec<Candidate>,
        lexical: Vec<Candidate>,
    ) -> RetrievalResult {
        let semantic = in_scope(semantic, &query.scope_id);
        let lexical = in_scope(lexical, &query.scope_id);

        let weights = match query.strategy {
            RetrievalStrategy::SemanticOnly => FusionWeights::semantic_only(),
            RetrievalStrategy::Hybrid => FusionWeights::from(&self.settings),
        };
        fuse(semantic, lexical, &weights, query.min_score, query.top_k)
    }
}

fn in_scope(candidates: Vec<Candidate>, scope_id: &str) -> Vec<Candidate> {
    let total = candidates.len();
    let kept: Vec<Candidate> = candidates
        .into_iter()
        .filter(|c| c.fragment.scope_id == scope_id)
        .collect();
    if kept.len() < total {
        tracing::warn!(
            "Discarded {} candidates outside scope '{}'",
            total - kept.len(),
            scope_id
        );
    }
    kept
}

fn validate_query(query: &RetrievalQuery) -> Result<(), RetrievalError> {
    if query.text.trim().is_empty() {
        return Err(RetrievalError::InvalidQuery("query text is empty".to_string()));
    }
    if query.scope_id.trim().is_empty() {
        return Err(RetrievalError::InvalidQuery("scope id is required".to_string()));
    }
    if query.top_k == 0 {
        return Err(RetrievalError::InvalidQuery("top_k must be at least 1".to_string()));
    }
    if !(0.0..=1.0).contains(&query.min_score) {
        return Err(RetrievalError::InvalidQuery(
            "min_score must be between 0 and 1".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::core::retry::RetryPolicy;
    use crate::rag::memory::MemoryFragmentStore;
    use crate::rag::types::fixtures::source;
    use crate::rag::types::{KnowledgeFragment, MatchedBy};

    struct FixedEmbedder(Vec<f32>);

    #[async_trait]
    impl QueryEmbedder for FixedEmbedder {
        async fn embed_query(&self, _text: &str) -> Result<Vec<f32>, StoreError> {
            Ok(self.0.clone())
        }
    }

    /// Fails the first `failures` calls of each search, then delegates.
    struct FlakyStore {
        inner: MemoryFragmentStore,
        failures: usize,
        calls: AtomicUsize,
        delay: Duration,
    }

    impl FlakyStore {
        fn new(inner: MemoryFragmentStore, failures: usize) -> Self {
            Self {
                inner,
                failures,
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl EmbeddingStore for FlakyStore {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn semantic_search(
            &self,
            embedding: &[f32],
            scope_id: &str,
            limit: usize,
        ) -> Result<Vec<Candidate>, StoreError> {
            tokio::time::sleep(self.delay).await;
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(StoreError::Unavailable("connection refused".into()));
            }
            self.inner.semantic_search(embedding, scope_id, limit).await
        }

        async fn lexical_search(
            &self,
            text: &str,
            scope_id: &str,
            limit: usize,
        ) -> Result<Vec<Candidate>, StoreError> {
            self.inner.lexical_search(text, scope_id, limit).await
        }
    }

    fn fragment(id: &str, text: &str, embedding: Vec<f32>) -> KnowledgeFragment {
        KnowledgeFragment {
            id: id.to_string(),
            text: text.to_string(),
            embedding,
            source: source(id, 2),
            labels: Vec::new(),
            scope_id: "tenant-a".to_string(),
        }
    }

    fn podcast_store() -> MemoryFragmentStore {
        MemoryFragmentStore::with_fragments(vec![
            fragment("mic", "Start a podcast with a decent USB microphone", vec![1.0, 0.0]),
            fragment("edit", "Editing software for audio", vec![0.8, 0.6]),
            fragment("cook", "Slow cooker recipes", vec![0.0, 1.0]),
        ])
    }

    fn settings() -> RetrievalSettings {
        RetrievalSettings {
            retry: RetryPolicy::immediate(1),
            ..RetrievalSettings::default()
        }
    }

    fn retriever(store: Arc<dyn EmbeddingStore>) -> Retriever {
        Retriever::new(
            store,
            Some(Arc::new(FixedEmbedder(vec![1.0, 0.0]))),
            settings(),
        )
    }

    #[tokio::test]
    async fn hybrid_retrieval_fuses_both_signals() {
        let retriever = retriever(Arc::new(podcast_store()));
        let query = retriever.query_for("start podcast", "tenant-a", None, None);

        let result = retriever.retrieve(&query, &CancelSignal::new()).await.unwrap();

        let top = &result.entries()[0];
        assert_eq!(top.fragment.id, "mic");
        assert_eq!(top.matched_by, MatchedBy::Both);
        assert!(result.get("cook").is_none());
        assert!(result.iter().all(|e| e.relevance_score >= 0.3));
    }

    #[tokio::test]
    async fn empty_query_is_invalid() {
        let retriever = retriever(Arc::new(podcast_store()));
        let query = retriever.query_for("   ", "tenant-a", None, None);

        let err = retriever.retrieve(&query, &CancelSignal::new()).await.unwrap_err();
        assert!(matches!(err, RetrievalError::InvalidQuery(_)));
    }

    #[tokio::test]
    async fn nothing_above_threshold_is_empty_success() {
        let retriever = retriever(Arc::new(podcast_store()));
        let query = retriever.query_for(
            "podcast microphone audio editing",
            "tenant-a",
            None,
            Some(0.9),
        );

        let result = retriever.retrieve(&query, &CancelSignal::new()).await.unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn transient_failure_is_retried_once() {
        let store = Arc::new(FlakyStore::new(podcast_store(), 1));
        let retriever = retriever(store.clone());
        let query = retriever.query_for("start podcast", "tenant-a", None, None);

        let result = retriever.retrieve(&query, &CancelSignal::new()).await.unwrap();
        assert!(!result.is_empty());
        assert_eq!(store.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn persistent_failure_surfaces_backend_unavailable() {
        let store = Arc::new(FlakyStore::new(podcast_store(), usize::MAX));
        let retriever = retriever(store.clone());
        let query = retriever.query_for("start podcast", "tenant-a", None, None);

        let err = retriever.retrieve(&query, &CancelSignal::new()).await.unwrap_err();
        assert!(matches!(err, RetrievalError::BackendUnavailable(_)));
        assert_eq!(store.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn semantic_only_without_embedder_is_unavailable() {
        let mut settings = settings();
        settings.strategy = RetrievalStrategy::SemanticOnly;
        let retriever = Retriever::new(Arc::new(podcast_store()), None, settings);
        let query = retriever.query_for("podcast", "tenant-a", None, None);

        let err = retriever.retrieve(&query, &CancelSignal::new()).await.unwrap_err();
        assert!(matches!(
            err,
            RetrievalError::BackendUnavailable(StoreError::Unsupported(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_store_times_out() {
        let mut store = FlakyStore::new(podcast_store(), 0);
        store.delay = Duration::from_secs(60);
        let retriever = retriever(Arc::new(store));
        let query = retriever.query_for("podcast", "tenant-a", None, None);

        let err = retriever.retrieve(&query, &CancelSignal::new()).await.unwrap_err();
        assert!(matches!(err, RetrievalError::Timeout(5_000)));
    }

    #[tokio::test]
    async fn cancelled_signal_short_circuits() {
        let retriever = retriever(Arc::new(podcast_store()));
        let query = retriever.query_for("podcast", "tenant-a", None, None);
        let cancel = CancelSignal::new();
        cancel.cancel();

        let err = retriever.retrieve(&query, &cancel).await.unwrap_err();
        assert!(matches!(err, RetrievalError::Cancelled));
    }
}
