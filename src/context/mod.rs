//! Prompt construction: templates, token windowing and augmentation.

pub mod augment;
pub mod template;
pub mod window;

pub use augment::{AugmentedPrompt, PromptBuilder};
pub use template::{PromptTemplate, TemplateRegistry};
pub use window::{ConversationTurn, TokenEstimator, TurnRole};
