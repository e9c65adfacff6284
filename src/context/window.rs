//! Token estimation and conversation windowing.
//!
//! Token counts are approximations derived from character counts. The
//! estimate rounds up, so the sum of per-piece estimates never undercounts
//! the estimate of the concatenated text.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
}

impl TurnRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnRole::User => "user",
            TurnRole::Assistant => "assistant",
        }
    }
}

/// One prior message of the conversation, oldest first in any history slice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: TurnRole,
    pub content: String,
}

impl ConversationTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenEstimator {
    chars_per_token: usize,
}

impl TokenEstimator {
    pub fn new(chars_per_token: usize) -> Self {
        Self {
            chars_per_token: chars_per_token.max(1),
        }
    }

    pub fn estimate(&self, text: &str) -> usize {
        let chars = text.chars().count();
        chars.div_ceil(self.chars_per_token)
    }
}

impl Default for TokenEstimator {
    fn default() -> Self {
        Self::new(4)
    }
}

/// The most recent `max_turns` turns, oldest first.
pub fn recent_turns(history: &[ConversationTurn], max_turns: usize) -> &[ConversationTurn] {
    let start = history.len().saturating_sub(max_turns);
    &history[start..]
}

/// Fit already-windowed turns into `budget` tokens.
///
/// Newer turns win: turns are admitted newest first and the walk stops at
/// the first turn that does not fit, so the kept slice stays contiguous.
pub fn fit_turns(
    turns: &[ConversationTurn],
    budget: usize,
    estimator: &TokenEstimator,
) -> (Vec<ConversationTurn>, usize) {
    let mut used = 0;
    let mut kept = Vec::new();

    for turn in turns.iter().rev() {
        let tokens = estimator.estimate(&turn.content);
        if used + tokens > budget {
            break;
        }
        used += tokens;
        kept.push(turn.clone());
    }

    kept.reverse();
    (kept, used)
}
