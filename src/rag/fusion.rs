//! Hybrid score fusion.
//!
//! Candidates from the semantic and lexical sub-searches are merged by
//! fragment id. A fragment found by both gets the weighted sum of its two
//! raw scores; a fragment found by only one keeps that raw score scaled by
//! `single_signal_penalty`. Fusion is a pure function of its inputs, so
//! re-running it on the same candidate sets yields the same ordering.

use std::collections::HashMap;

use super::store::Candidate;
use super::types::{clamp_score, MatchedBy, RetrievalResult, RetrievedFragment, ScoredFragment};
use crate::core::config::settings::RetrievalSettings;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusionWeights {
    pub semantic: f32,
    pub lexical: f32,
    pub single_signal_penalty: f32,
}

impl FusionWeights {
    /// Semantic-only retrieval has no second signal to penalise against.
    pub fn semantic_only() -> Self {
        Self {
            semantic: 1.0,
            lexical: 0.0,
            single_signal_penalty: 1.0,
        }
    }
}

impl Default for FusionWeights {
    fn default() -> Self {
        Self {
            semantic: 0.6,
            lexical: 0.4,
            single_signal_penalty: 0.85,
        }
    }
}

impl From<&RetrievalSettings> for FusionWeights {
    fn from(settings: &RetrievalSettings) -> Self {
        Self {
            semantic: settings.semantic_weight,
            lexical: settings.lexical_weight,
            single_signal_penalty: settings.single_signal_penalty,
        }
    }
}

struct Slot {
    fragment: RetrievedFragment,
    semantic: Option<f32>,
    lexical: Option<f32>,
}

fn keep_best(slot: &mut Option<f32>, score: f32) {
    let score = clamp_score(score);
    *slot = Some(slot.map_or(score, |existing| existing.max(score)));
}

/// Fuse, filter below `min_score` and keep the best `top_k`.
pub fn fuse(
    semantic: Vec<Candidate>,
    lexical: Vec<Candidate>,
    weights: &FusionWeights,
    min_score: f32,
    top_k: usize,
) -> RetrievalResult {
    let mut slots: HashMap<String, Slot> = HashMap::new();

    for candidate in semantic {
        let slot = slots
            .entry(candidate.fragment.id.clone())
            .or_insert_with(|| Slot {
                fragment: candidate.fragment,
                semantic: None,
                lexical: None,
            });
        keep_best(&mut slot.semantic, candidate.raw_score);
    }

    for candidate in lexical {
        let slot = slots
            .entry(candidate.fragment.id.clone())
            .or_insert_with(|| Slot {
                fragment: candidate.fragment,
                semantic: None,
                lexical: None,
            });
        keep_best(&mut slot.lexical, candidate.raw_score);
    }

    let entries: Vec<ScoredFragment> = slots
        .into_values()
        .map(|slot| {
            let (score, matched_by) = match (slot.semantic, slot.lexical) {
                (Some(sem), Some(lex)) => (
                    weights.semantic * sem + weights.lexical * lex,
                    MatchedBy::Both,
                ),
                (Some(sem), None) => (sem * weights.single_signal_penalty, MatchedBy::Semantic),
                (None, Some(lex)) => (lex * weights.single_signal_penalty, MatchedBy::Lexical),
                (None, None) => (0.0, MatchedBy::Semantic),
            };
            ScoredFragment {
                fragment: slot.fragment,
                relevance_score: clamp_score(score),
                matched_by,
            }
        })
        .filter(|entry| entry.relevance_score >= min_score)
        .collect();

    let mut result = RetrievalResult::from_entries(entries);
    result.truncate(top_k);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rag::types::fixtures::{fragment, source};

    fn candidate(id: &str, score: f32) -> Candidate {
        Candidate {
            fragment: fragment(id, "text"),
            raw_score: score,
        }
    }

    fn ids(result: &RetrievalResult) -> Vec<String> {
        result.iter().map(|e| e.fragment.id.clone()).collect()
    }

    #[test]
    fn both_signals_use_weighted_sum() {
        let result = fuse(
            vec![candidate("a", 0.9)],
            vec![candidate("a", 0.5)],
            &FusionWeights::default(),
            0.0,
            5,
        );
        let entry = &result.entries()[0];
        assert_eq!(entry.matched_by, MatchedBy::Both);
        assert!((entry.relevance_score - (0.6 * 0.9 + 0.4 * 0.5)).abs() < 1e-6);
    }

    #[test]
    fn single_signal_is_penalised() {
        let result = fuse(
            vec![candidate("sem", 0.8)],
            vec![candidate("lex", 0.6)],
            &FusionWeights::default(),
            0.0,
            5,
        );
        let sem = result.get("sem").unwrap();
        let lex = result.get("lex").unwrap();
        assert_eq!(sem.matched_by, MatchedBy::Semantic);
        assert!((sem.relevance_score - 0.68).abs() < 1e-6);
        assert_eq!(lex.matched_by, MatchedBy::Lexical);
        assert!((lex.relevance_score - 0.51).abs() < 1e-6);
    }

    #[test]
    fn top_k_keeps_best_fused_scores() {
        let semantic: Vec<Candidate> = (0..10)
            .map(|i| candidate(&format!("f{}", i), 0.9 - i as f32 * 0.09))
            .collect();
        let lexical: Vec<Candidate> = (0..10)
            .map(|i| candidate(&format!("f{}", i), 0.9 - i as f32 * 0.09))
            .collect();

        let result = fuse(semantic, lexical, &FusionWeights::default(), 0.0, 3);
        assert_eq!(ids(&result), vec!["f0", "f1", "f2"]);
    }

    #[test]
    fn min_score_filters_and_empty_is_not_error() {
        let result = fuse(
            vec![candidate("a", 0.2), candidate("b", 0.1)],
            Vec::new(),
            &FusionWeights::default(),
            0.3,
            5,
        );
        assert!(result.is_empty());
    }

    #[test]
    fn semantic_only_keeps_raw_scores() {
        let scores = [0.82, 0.76, 0.68, 0.54, 0.48];
        let semantic = scores
            .iter()
            .enumerate()
            .map(|(i, s)| candidate(&format!("f{}", i), *s))
            .collect();

        let result = fuse(semantic, Vec::new(), &FusionWeights::semantic_only(), 0.3, 5);
        assert_eq!(result.len(), 5);
        assert!((result.average_score().unwrap() - 0.656).abs() < 1e-4);
    }

    #[test]
    fn fusion_is_deterministic_and_ordered() {
        let mut newer = candidate("tie-new", 0.5);
        newer.fragment.source = source("tie-new", 15);
        let semantic = vec![
            candidate("x", 0.7),
            candidate("tie-old", 0.5),
            newer,
            candidate("y", 0.95),
            candidate("x", 0.2),
        ];
        let lexical = vec![candidate("y", 0.4), candidate("z", 0.9)];

        let first = fuse(semantic.clone(), lexical.clone(), &FusionWeights::default(), 0.0, 10);
        let second = fuse(semantic, lexical, &FusionWeights::default(), 0.0, 10);
        assert_eq!(ids(&first), ids(&second));

        let scores: Vec<f32> = first.iter().map(|e| e.relevance_score).collect();
        assert!(scores.windows(2).all(|w| w[0] >= w[1]));
        let position = |id: &str| ids(&first).iter().position(|x| x == id).unwrap();
        assert!(position("tie-new") < position("tie-old"));
        assert_eq!(ids(&first).len(), 5);
    }
}
