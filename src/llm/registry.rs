use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::anthropic::AnthropicProvider;
use super::openai::OpenAiCompatProvider;
use super::provider::GenerationProvider;
use crate::core::config::settings::{ProviderKind, ProviderSettings};

/// A configured provider: adapter plus the model it serves.
#[derive(Clone)]
pub struct ProviderEntry {
    pub name: String,
    pub model: String,
    pub provider: Arc<dyn GenerationProvider>,
}

/// Provider lookup by configured name. Built once at startup.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    entries: HashMap<String, ProviderEntry>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_settings(settings: &BTreeMap<String, ProviderSettings>) -> Self {
        let mut registry = Self::new();
        for (name, provider) in settings {
            let api_key = provider.resolve_api_key();
            let adapter: Arc<dyn GenerationProvider> = match provider.kind {
                ProviderKind::Openai => {
                    Arc::new(OpenAiCompatProvider::new(provider.base_url.clone(), api_key))
                }
                ProviderKind::Anthropic => {
                    Arc::new(AnthropicProvider::new(provider.base_url.clone(), api_key))
                }
            };
            tracing::info!(
                "Registered provider '{}' ({}, model {})",
                name,
                adapter.kind(),
                provider.model
            );
            registry.register(name, provider.model.clone(), adapter);
        }
        registry
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        model: impl Into<String>,
        provider: Arc<dyn GenerationProvider>,
    ) {
        let name = name.into();
        self.entries.insert(
            name.clone(),
            ProviderEntry {
                name,
                model: model.into(),
                provider,
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<&ProviderEntry> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
