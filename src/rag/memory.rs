//! In-process fragment store for tests and small knowledge bases.

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::scoring::{cosine_similarity, keyword_score, query_terms};
use super::store::{Candidate, EmbeddingStore, StoreError};
use super::types::KnowledgeFragment;

#[derive(Default)]
pub struct MemoryFragmentStore {
    fragments: RwLock<Vec<KnowledgeFragment>>,
}

impl MemoryFragmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fragments(fragments: Vec<KnowledgeFragment>) -> Self {
        Self {
            fragments: RwLock::new(fragments),
        }
    }

    /// Add a fragment, replacing any previous fragment with the same id.
    pub async fn insert(&self, fragment: KnowledgeFragment) {
        let mut fragments = self.fragments.write().await;
        fragments.retain(|f| f.id != fragment.id);
        fragments.push(fragment);
    }

    pub async fn len(&self) -> usize {
        self.fragments.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.fragments.read().await.is_empty()
    }
}

fn best_first(mut candidates: Vec<Candidate>, limit: usize) -> Vec<Candidate> {
    candidates.sort_by(|a, b| {
        b.raw_score
            .total_cmp(&a.raw_score)
            .then_with(|| a.fragment.id.cmp(&b.fragment.id))
    });
    candidates.truncate(limit);
    candidates
}

#[async_trait]
impl EmbeddingStore for MemoryFragmentStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn semantic_search(
        &self,
        embedding: &[f32],
        scope_id: &str,
        limit: usize,
    ) -> Result<Vec<Candidate>, StoreError> {
        let fragments = self.fragments.read().await;
        let candidates = fragments
            .iter()
            .filter(|f| f.scope_id == scope_id && !f.embedding.is_empty())
            .map(|f| Candidate {
                raw_score: cosine_similarity(embedding, &f.embedding),
                fragment: f.retrieved(),
            })
            .filter(|c| c.raw_score > 0.0)
            .collect();
        Ok(best_first(candidates, limit))
    }

    async fn lexical_search(
        &self,
        text: &str,
        scope_id: &str,
        limit: usize,
    ) -> Result<Vec<Candidate>, StoreError> {
        let terms = query_terms(text);
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let fragments = self.fragments.read().await;
        let candidates = fragments
            .iter()
            .filter(|f| f.scope_id == scope_id)
            .map(|f| Candidate {
                raw_score: keyword_score(&terms, &f.text),
                fragment: f.retrieved(),
            })
            .filter(|c| c.raw_score > 0.0)
            .collect();
        Ok(best_first(candidates, limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rag::types::fixtures::source;

    fn fragment(id: &str, scope: &str, text: &str, embedding: Vec<f32>) -> KnowledgeFragment {
        KnowledgeFragment {
            id: id.to_string(),
            text: text.to_string(),
            embedding,
            source: source(id, 1),
            labels: vec!["podcasting".to_string()],
            scope_id: scope.to_string(),
        }
    }

    #[tokio::test]
    async fn searches_are_scoped_and_ranked() {
        let store = MemoryFragmentStore::with_fragments(vec![
            fragment("f1", "tenant-a", "Choose a podcast microphone", vec![1.0, 0.0]),
            fragment("f2", "tenant-a", "Edit podcast audio", vec![0.6, 0.8]),
            fragment("f3", "tenant-b", "Podcast microphone for tenant b", vec![1.0, 0.0]),
        ]);

        let semantic = store.semantic_search(&[1.0, 0.0], "tenant-a", 10).await.unwrap();
        let ids: Vec<&str> = semantic.iter().map(|c| c.fragment.id.as_str()).collect();
        assert_eq!(ids, vec!["f1", "f2"]);

        let lexical = store
            .lexical_search("podcast microphone", "tenant-a", 10)
            .await
            .unwrap();
        assert_eq!(lexical[0].fragment.id, "f1");
        assert!((lexical[0].raw_score - 1.0).abs() < f32::EPSILON);
        assert!(lexical.iter().all(|c| c.fragment.scope_id == "tenant-a"));
    }

    #[tokio::test]
    async fn insert_replaces_same_id() {
        let store = MemoryFragmentStore::new();
        store.insert(fragment("f1", "s", "old text", vec![1.0])).await;
        store.insert(fragment("f1", "s", "new text", vec![1.0])).await;
        assert_eq!(store.len().await, 1);

        let hits = store.lexical_search("new", "s", 5).await.unwrap();
        assert_eq!(hits.len(), 1);
    }
}
