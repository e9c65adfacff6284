use std::cmp::Ordering;
use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a fragment came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceMetadata {
    pub document_id: String,
    pub title: String,
    #[serde(default)]
    pub url: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// A unit of retrievable knowledge, as ingested into the store.
///
/// Fragments are immutable. Re-ingestion replaces a fragment under the same
/// id instead of editing it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeFragment {
    pub id: String,
    pub text: String,
    pub embedding: Vec<f32>,
    pub source: SourceMetadata,
    #[serde(default)]
    pub labels: Vec<String>,
    pub scope_id: String,
}

impl KnowledgeFragment {
    pub fn retrieved(&self) -> RetrievedFragment {
        RetrievedFragment {
            id: self.id.clone(),
            text: self.text.clone(),
            source: self.source.clone(),
            labels: self.labels.clone(),
            scope_id: self.scope_id.clone(),
        }
    }
}

/// A fragment as returned by a search: everything but the embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedFragment {
    pub id: String,
    pub text: String,
    pub source: SourceMetadata,
    #[serde(default)]
    pub labels: Vec<String>,
    pub scope_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RetrievalStrategy {
    SemanticOnly,
    #[default]
    Hybrid,
}

#[derive(Debug, Clone)]
pub struct RetrievalQuery {
    pub text: String,
    pub scope_id: String,
    pub top_k: usize,
    pub min_score: f32,
    pub strategy: RetrievalStrategy,
}

impl RetrievalQuery {
    pub fn new(text: impl Into<String>, scope_id: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            scope_id: scope_id.into(),
            top_k: 5,
            min_score: 0.3,
            strategy: RetrievalStrategy::Hybrid,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchedBy {
    Semantic,
    Lexical,
    Both,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredFragment {
    pub fragment: RetrievedFragment,
    pub relevance_score: f32,
    pub matched_by: MatchedBy,
}

impl ScoredFragment {
    /// Result order: score descending, then newer source, then fragment id.
    pub fn rank_cmp(a: &ScoredFragment, b: &ScoredFragment) -> Ordering {
        b.relevance_score
            .total_cmp(&a.relevance_score)
            .then_with(|| {
                b.fragment
                    .source
                    .updated_at
                    .cmp(&a.fragment.source.updated_at)
            })
            .then_with(|| a.fragment.id.cmp(&b.fragment.id))
    }
}

/// Ranked retrieval output.
///
/// Entries are ordered by `ScoredFragment::rank_cmp`, ids are unique and
/// every score lies in `[0, 1]`. The constructor enforces all three.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrievalResult {
    entries: Vec<ScoredFragment>,
}

impl RetrievalResult {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Rank arbitrary entries. Out-of-range scores are clamped and for
    /// duplicate ids only the best-ranked entry is kept.
    pub fn from_entries(mut entries: Vec<ScoredFragment>) -> Self {
        for entry in &mut entries {
            entry.relevance_score = clamp_score(entry.relevance_score);
        }
        entries.sort_by(ScoredFragment::rank_cmp);

        let mut seen = HashSet::new();
        entries.retain(|entry| seen.insert(entry.fragment.id.clone()));

        Self { entries }
    }

    pub fn entries(&self) -> &[ScoredFragment] {
        &self.entries
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ScoredFragment> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, fragment_id: &str) -> Option<&ScoredFragment> {
        self.entries.iter().find(|e| e.fragment.id == fragment_id)
    }

    /// Keep only the first `len` entries.
    pub fn truncate(&mut self, len: usize) {
        self.entries.truncate(len);
    }

    pub fn average_score(&self) -> Option<f32> {
        if self.entries.is_empty() {
            return None;
        }
        let total: f32 = self.entries.iter().map(|e| e.relevance_score).sum();
        Some(total / self.entries.len() as f32)
    }
}

impl<'a> IntoIterator for &'a RetrievalResult {
    type Item = &'a ScoredFragment;
    type IntoIter = std::slice::Iter<'a, ScoredFragment>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

/// NaN collapses to 0.
pub fn clamp_score(score: f32) -> f32 {
    if score.is_nan() {
        0.0
    } else {
        score.clamp(0.0, 1.0)
    }
}
