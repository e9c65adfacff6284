use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::config::settings::TemplateSettings;

/// Persona and tone definition a prompt is rendered from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptTemplate {
    pub name: String,
    pub persona: String,
    pub tone: String,
    pub instructions: String,
    pub expertise: Vec<String>,
}

impl PromptTemplate {
    fn from_settings(name: &str, settings: &TemplateSettings) -> Self {
        Self {
            name: name.to_string(),
            persona: settings.persona.trim().to_string(),
            tone: settings.tone.trim().to_string(),
            instructions: settings.instructions.trim().to_string(),
            expertise: settings
                .expertise
                .iter()
                .map(|e| e.trim().to_string())
                .filter(|e| !e.is_empty())
                .collect(),
        }
    }
}

/// Read-only template lookup, populated once at startup.
#[derive(Debug, Clone, Default)]
pub struct TemplateRegistry {
    templates: Arc<BTreeMap<String, PromptTemplate>>,
}

impl TemplateRegistry {
    pub fn from_settings(settings: &BTreeMap<String, TemplateSettings>) -> Self {
        let templates = settings
            .iter()
            .map(|(name, s)| (name.clone(), PromptTemplate::from_settings(name, s)))
            .collect();
        Self {
            templates: Arc::new(templates),
        }
    }

    pub fn get(&self, name: &str) -> Option<&PromptTemplate> {
        self.templates.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.templates.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}
