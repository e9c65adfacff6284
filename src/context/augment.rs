//! Prompt augmentation.
//!
//! The system message is assembled in a fixed order: persona and tone,
//! expertise, the numbered context block, citation rules. History and the
//! user query follow as separate messages. Everything is accounted against
//! the caller's token budget before it is rendered.

use serde::Serialize;

use super::template::PromptTemplate;
use super::window::{fit_turns, recent_turns, ConversationTurn, TokenEstimator};
use crate::core::config::settings::PromptSettings;
use crate::core::errors::AugmentationError;
use crate::llm::types::ChatMessage;
use crate::rag::types::{RetrievalResult, ScoredFragment};

const SECTION_SEPARATOR: &str = "\n\n";

const CONTEXT_HEADER: &str = "Context (most relevant first):";

const CITATION_RULES: &str = "Citation rules:\n\
- When a sentence uses information from a context entry, cite it inline with that entry's marker, for example [Source 1].\n\
- Cite several entries as [Source 1][Source 3].\n\
- Only cite entries you actually used and never invent a source number.";

const NO_CONTEXT_NOTE: &str = "No reference context was found for this question. \
Answer from general knowledge and say so when you are unsure.";

/// Fully rendered generation input.
#[derive(Debug, Clone, Serialize)]
pub struct AugmentedPrompt {
    pub system: String,
    pub history: Vec<ConversationTurn>,
    pub query: String,
    /// Fragments that made it into the prompt; entry `i` is `[Source i+1]`.
    pub context: RetrievalResult,
    /// Lower-relevance fragments left out to respect the budget.
    pub dropped_fragments: usize,
    pub estimated_tokens: usize,
}

impl AugmentedPrompt {
    pub fn context_used(&self) -> bool {
        !self.context.is_empty()
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(self.history.len() + 2);
        messages.push(ChatMessage::system(self.system.clone()));
        messages.extend(
            self.history
                .iter()
                .map(|turn| ChatMessage::new(turn.role.as_str(), turn.content.clone())),
        );
        messages.push(ChatMessage::user(self.query.clone()));
        messages
    }
}

#[derive(Debug, Clone)]
pub struct PromptBuilder {
    estimator: TokenEstimator,
    history_turns: usize,
}

impl PromptBuilder {
    pub fn new(settings: &PromptSettings) -> Self {
        Self {
            estimator: TokenEstimator::new(settings.chars_per_token),
            history_turns: settings.history_turns,
        }
    }

    pub fn estimator(&self) -> &TokenEstimator {
        &self.estimator
    }

    pub fn augment(
        &self,
        query: &str,
        history: &[ConversationTurn],
        retrieval: &RetrievalResult,
        template: &PromptTemplate,
        token_budget: usize,
    ) -> Result<AugmentedPrompt, AugmentationError> {
        let preamble = render_preamble(template);
        let expertise = render_expertise(template);

        let mut used = self.section_tokens(&preamble) + self.estimator.estimate(query);
        if let Some(block) = &expertise {
            used += self.section_tokens(block);
        }
        if retrieval.is_empty() {
            used += self.section_tokens(NO_CONTEXT_NOTE);
        }
        if used > token_budget {
            return Err(AugmentationError::BudgetExceeded {
                required: used,
                budget: token_budget,
            });
        }

        let mut included: Vec<ScoredFragment> = Vec::new();
        let mut rendered_entries: Vec<String> = Vec::new();
        let mut dropped = 0;

        if !retrieval.is_empty() {
            let mut running =
                used + self.section_tokens(CONTEXT_HEADER) + self.section_tokens(CITATION_RULES);

            for (idx, entry) in retrieval.iter().enumerate() {
                let rendered = render_entry(idx + 1, entry);
                let tokens = self.section_tokens(&rendered);
                if running + tokens > token_budget {
                    if included.is_empty() {
                        return Err(AugmentationError::BudgetExceeded {
                            required: running + tokens,
                            budget: token_budget,
                        });
                    }
                    dropped = retrieval.len() - idx;
                    break;
                }
                running += tokens;
                included.push(entry.clone());
                rendered_entries.push(rendered);
            }

            if dropped > 0 {
                tracing::info!(
                    "Dropped {} of {} context fragments to fit a {} token budget",
                    dropped,
                    retrieval.len(),
                    token_budget
                );
            }
            used = running;
        }

        let window = recent_turns(history, self.history_turns);
        let (turns, _) = fit_turns(window, token_budget - used, &self.estimator);
        if turns.len() < window.len() {
            tracing::debug!(
                "Trimmed {} history turns to fit the prompt budget",
                window.len() - turns.len()
            );
        }

        let mut sections = vec![preamble];
        sections.extend(expertise);
        if rendered_entries.is_empty() {
            sections.push(NO_CONTEXT_NOTE.to_string());
        } else {
            sections.push(CONTEXT_HEADER.to_string());
            sections.extend(rendered_entries);
            sections.push(CITATION_RULES.to_string());
        }
        let system = sections.join(SECTION_SEPARATOR);

        let estimated_tokens = self.estimator.estimate(&system)
            + turns
                .iter()
                .map(|t| self.estimator.estimate(&t.content))
                .sum::<usize>()
            + self.estimator.estimate(query);

        if estimated_tokens > token_budget {
            return Err(AugmentationError::BudgetExceeded {
                required: estimated_tokens,
                budget: token_budget,
            });
        }

        Ok(AugmentedPrompt {
            system,
            history: turns,
            query: query.to_string(),
            context: RetrievalResult::from_entries(included),
            dropped_fragments: dropped,
            estimated_tokens,
        })
    }

    /// A system-message section together with the separator that follows it.
    fn section_tokens(&self, section: &str) -> usize {
        self.estimator.estimate(section) + self.estimator.estimate(SECTION_SEPARATOR)
    }
}

fn render_preamble(template: &PromptTemplate) -> String {
    let mut preamble = format!("You are {}.", template.persona);
    if !template.tone.is_empty() {
        preamble.push_str(&format!(" Keep your tone {}.", template.tone));
    }
    if !template.instructions.is_empty() {
        preamble.push('\n');
        preamble.push_str(&template.instructions);
    }
    preamble
}

fn render_expertise(template: &PromptTemplate) -> Option<String> {
    if template.expertise.is_empty() {
        return None;
    }
    let lines: Vec<String> = template
        .expertise
        .iter()
        .map(|area| format!("- {}", area))
        .collect();
    Some(format!("Areas of expertise:\n{}", lines.join("\n")))
}

fn render_entry(number: usize, entry: &ScoredFragment) -> String {
    let source = &entry.fragment.source;
    let location = source
        .url
        .as_deref()
        .map(|url| format!(" <{}>", url))
        .unwrap_or_default();
    format!(
        "[Source {}] {}{} (relevance {:.0}%)\n{}",
        number,
        source.title,
        location,
        entry.relevance_score * 100.0,
        entry.fragment.text.trim()
    )
}
