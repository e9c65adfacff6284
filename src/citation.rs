//! Citation extraction.
//!
//! Attribution is approximate. A context entry is cited when the response
//! names it explicitly (`[Source N]`) or when enough of its word n-grams
//! reappear in the response. Citations are ordered by where the response
//! first refers to them, ties falling back to relevance order.

use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::config::settings::CitationSettings;
use crate::rag::types::RetrievalResult;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub fragment_id: String,
    /// 1-based marker number the fragment carried in the prompt.
    pub source_index: usize,
    pub source_title: String,
    pub source_url: Option<String>,
    pub excerpt: String,
}

fn marker_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\[\s*source\s+(\d+)\s*\]").ok())
        .as_ref()
}

/// Lowercased words with their byte offset in `text`.
fn words(text: &str) -> Vec<(usize, String)> {
    let mut out = Vec::new();
    let mut start: Option<usize> = None;
    for (idx, ch) in text.char_indices() {
        if ch.is_alphanumeric() {
            start.get_or_insert(idx);
        } else if let Some(s) = start.take() {
            out.push((s, text[s..idx].to_lowercase()));
        }
    }
    if let Some(s) = start {
        out.push((s, text[s..].to_lowercase()));
    }
    out
}

fn ngrams(words: &[(usize, String)], n: usize) -> Vec<(usize, String)> {
    if n == 0 || words.len() < n {
        return Vec::new();
    }
    words
        .windows(n)
        .map(|w| {
            let joined = w.iter().map(|(_, word)| word.as_str()).collect::<Vec<_>>().join(" ");
            (w[0].0, joined)
        })
        .collect()
}

/// First byte offset of every explicit `[Source N]` marker, keyed by N.
fn explicit_markers(response: &str) -> HashMap<usize, usize> {
    let mut first = HashMap::new();
    let Some(re) = marker_regex() else {
        return first;
    };
    for caps in re.captures_iter(response) {
        let (Some(whole), Some(number)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        if let Ok(n) = number.as_str().parse::<usize>() {
            first.entry(n).or_insert(whole.start());
        }
    }
    first
}

fn excerpt(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    let cut = match cut.rfind(char::is_whitespace) {
        Some(pos) if pos > 0 => &cut[..pos],
        _ => cut.as_str(),
    };
    format!("{}...", cut.trim_end())
}

/// Share of the fragment's n-grams that also occur in the response, plus the
/// response offset of the first shared n-gram.
fn overlap(
    fragment: &str,
    response_words: &[(usize, String)],
    ngram: usize,
) -> Option<(f32, usize)> {
    let fragment_words = words(fragment);
    // Very short fragments are compared on whatever length they have.
    let n = ngram.min(fragment_words.len());
    if n == 0 || response_words.len() < n {
        return None;
    }

    let fragment_grams: HashSet<String> =
        ngrams(&fragment_words, n).into_iter().map(|(_, g)| g).collect();
    let response_grams = ngrams(response_words, n);
    let response_set: HashSet<&str> = response_grams.iter().map(|(_, g)| g.as_str()).collect();

    let shared = fragment_grams
        .iter()
        .filter(|g| response_set.contains(g.as_str()))
        .count();
    if shared == 0 {
        return None;
    }

    let denom = fragment_grams.len().max(1);
    let first = response_grams
        .iter()
        .find(|(_, g)| fragment_grams.contains(g))
        .map(|(pos, _)| *pos)?;
    Some((shared as f32 / denom as f32, first))
}

/// Attribute a response to the context entries that were in its prompt.
///
/// `context` must be the result the prompt was built from, in prompt order,
/// so that entry `i` is `[Source i+1]`.
pub fn extract_citations(
    response: &str,
    context: &RetrievalResult,
    settings: &CitationSettings,
) -> Vec<Citation> {
    if context.is_empty() || response.trim().is_empty() {
        return Vec::new();
    }

    let markers = explicit_markers(response);
    for n in markers.keys() {
        if *n == 0 || *n > context.len() {
            tracing::debug!("Ignoring citation marker [Source {}] with no matching entry", n);
        }
    }

    let response_words = words(response);
    let mut found: Vec<(usize, usize, Citation)> = Vec::new();

    for (rank, entry) in context.iter().enumerate() {
        let source_index = rank + 1;
        let explicit = markers.get(&source_index).copied();
        let implicit = overlap(&entry.fragment.text, &response_words, settings.ngram)
            .filter(|(ratio, _)| *ratio >= settings.min_overlap)
            .map(|(_, pos)| pos);

        let position = match (explicit, implicit) {
            (Some(a), Some(b)) => a.min(b),
            (Some(a), None) | (None, Some(a)) => a,
            (None, None) => continue,
        };

        let fragment = &entry.fragment;
        found.push((
            position,
            rank,
            Citation {
                fragment_id: fragment.id.clone(),
                source_index,
                source_title: fragment.source.title.clone(),
                source_url: fragment.source.url.clone(),
                excerpt: excerpt(&fragment.text, settings.excerpt_chars),
            },
        ));
    }

    found.sort_by_key(|(position, rank, _)| (*position, *rank));
    found.into_iter().map(|(_, _, citation)| citation).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rag::types::fixtures::scored;

    fn context() -> RetrievalResult {
        RetrievalResult::from_entries(vec![
            scored(
                "mic",
                "A dynamic USB microphone rejects room noise and suits a first podcast setup.",
                0.82,
            ),
            scored(
                "edit",
                "Edit each episode in a free editor such as Audacity before publishing.",
                0.76,
            ),
            scored(
                "host",
                "Choose a podcast host that generates an RSS feed for directories.",
                0.68,
            ),
        ])
    }

    #[test]
    fn explicit_markers_are_cited_in_order_of_appearance() {
        let response = "Pick a host first [Source 3]. Then buy gear [Source 1].";
        let citations = extract_citations(response, &context(), &CitationSettings::default());

        let ids: Vec<&str> = citations.iter().map(|c| c.fragment_id.as_str()).collect();
        assert_eq!(ids, vec!["host", "mic"]);
        assert_eq!(citations[0].source_index, 3);
        assert_eq!(citations[1].source_title, "mic guide");
        assert_eq!(citations[1].source_url.as_deref(), Some("https://kb.example.com/mic"));
    }

    #[test]
    fn overlapping_text_is_cited_without_markers() {
        let response = "Start with a dynamic USB microphone rejects room noise well. \
                        Later, edit each episode in a free editor.";
        let citations = extract_citations(response, &context(), &CitationSettings::default());

        let ids: Vec<&str> = citations.iter().map(|c| c.fragment_id.as_str()).collect();
        assert_eq!(ids, vec!["mic", "edit"]);
    }

    #[test]
    fn unrelated_response_cites_nothing() {
        let response = "Consistency matters more than equipment when you begin.";
        assert!(extract_citations(response, &context(), &CitationSettings::default()).is_empty());
    }

    #[test]
    fn short_responses_do_not_borrow_attribution() {
        let settings = CitationSettings::default();
        for response in ["Podcast.", "Sure, a podcast host.", "Edit each episode."] {
            assert!(
                extract_citations(response, &context(), &settings).is_empty(),
                "{:?} should cite nothing",
                response
            );
        }
    }

    #[test]
    fn ratio_is_measured_against_the_fragment() {
        let settings = CitationSettings {
            min_overlap: 0.5,
            ..CitationSettings::default()
        };
        // 5 of the 11 trigrams in the mic fragment.
        let partial = "a dynamic USB microphone rejects room noise";
        assert!(extract_citations(partial, &context(), &settings).is_empty());

        let full = "Honestly, a dynamic USB microphone rejects room noise and suits a first podcast setup.";
        let ids: Vec<String> = extract_citations(full, &context(), &settings)
            .into_iter()
            .map(|c| c.fragment_id)
            .collect();
        assert_eq!(ids, vec!["mic".to_string()]);
    }

    #[test]
    fn out_of_range_markers_are_ignored() {
        let response = "See [Source 9] and [source 0].";
        assert!(extract_citations(response, &context(), &CitationSettings::default()).is_empty());
    }

    #[test]
    fn excerpts_are_bounded() {
        let settings = CitationSettings {
            excerpt_chars: 20,
            ..CitationSettings::default()
        };
        let citations = extract_citations("[Source 1]", &context(), &settings);
        assert_eq!(citations.len(), 1);
        assert!(citations[0].excerpt.ends_with("..."));
        assert!(citations[0].excerpt.chars().count() <= 23);
    }

    #[test]
    fn empty_context_yields_no_citations() {
        let citations = extract_citations(
            "Anything [Source 1]",
            &RetrievalResult::empty(),
            &CitationSettings::default(),
        );
        assert!(citations.is_empty());
    }
}
