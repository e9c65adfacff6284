use super::service::ConfigError;
use super::settings::EngineConfig;

pub fn validate_config(config: &EngineConfig) -> Result<(), ConfigError> {
    let retrieval = &config.retrieval;
    validate_unit_interval("retrieval.semantic_weight", retrieval.semantic_weight)?;
    validate_unit_interval("retrieval.lexical_weight", retrieval.lexical_weight)?;
    validate_unit_interval("retrieval.min_score", retrieval.min_score)?;
    if !(retrieval.single_signal_penalty > 0.0 && retrieval.single_signal_penalty <= 1.0) {
        return Err(ConfigError::invalid(
            "retrieval.single_signal_penalty",
            "must be in (0, 1]",
        ));
    }
    validate_positive("retrieval.top_k", retrieval.top_k as u64)?;
    validate_positive("retrieval.candidate_multiplier", retrieval.candidate_multiplier as u64)?;
    validate_positive("retrieval.timeout_ms", retrieval.timeout_ms)?;

    let prompt = &config.prompt;
    validate_positive("prompt.chars_per_token", prompt.chars_per_token as u64)?;
    if prompt.context_window <= config.generation.max_output_tokens as usize {
        return Err(ConfigError::invalid(
            "prompt.context_window",
            format!(
                "must exceed generation.max_output_tokens ({})",
                config.generation.max_output_tokens
            ),
        ));
    }

    let generation = &config.generation;
    validate_positive("generation.timeout_ms", generation.timeout_ms)?;
    validate_positive("generation.attempt_timeout_ms", generation.attempt_timeout_ms)?;
    validate_positive("generation.first_chunk_timeout_ms", generation.first_chunk_timeout_ms)?;
    if !(0.0..=2.0).contains(&generation.temperature) {
        return Err(ConfigError::invalid("generation.temperature", "must be in [0, 2]"));
    }

    if !generation.fallback.is_empty() {
        let budget = generation.provider_budget();
        if budget.as_millis() >= u128::from(generation.timeout_ms) {
            return Err(ConfigError::invalid(
                "generation.attempt_timeout_ms",
                format!(
                    "retries on one provider can take {} ms, leaving no time for fallback \
                     within generation.timeout_ms ({})",
                    budget.as_millis(),
                    generation.timeout_ms
                ),
            ));
        }
    }

    if config.providers.is_empty() {
        return Err(ConfigError::invalid("providers", "at least one provider is required"));
    }
    validate_declared_provider(config, "generation.default_provider", &generation.default_provider)?;
    for (idx, name) in generation.fallback.iter().enumerate() {
        validate_declared_provider(config, &format!("generation.fallback[{}]", idx), name)?;
    }
    for (name, provider) in &config.providers {
        if provider.model.trim().is_empty() {
            return Err(ConfigError::invalid(
                format!("providers.{}.model", name),
                "must not be empty",
            ));
        }
    }

    if config.templates.is_empty() {
        return Err(ConfigError::invalid("templates", "at least one template is required"));
    }
    for (name, template) in &config.templates {
        if template.persona.trim().is_empty() {
            return Err(ConfigError::invalid(
                format!("templates.{}.persona", name),
                "must not be empty",
            ));
        }
    }

    validate_positive("citations.ngram", config.citations.ngram as u64)?;
    validate_unit_interval("citations.min_overlap", config.citations.min_overlap)?;
    validate_positive("metrics.queue_capacity", config.metrics.queue_capacity as u64)?;

    Ok(())
}

fn validate_unit_interval(path: &str, value: f32) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&value) {
        return Err(ConfigError::invalid(path, "must be in [0, 1]"));
    }
    Ok(())
}

fn validate_positive(path: &str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::invalid(path, "must be greater than zero"));
    }
    Ok(())
}

fn validate_declared_provider(
    config: &EngineConfig,
    path: &str,
    name: &str,
) -> Result<(), ConfigError> {
    if !config.providers.contains_key(name) {
        return Err(ConfigError::invalid(
            path,
            format!("provider '{}' is not declared under providers", name),
        ));
    }
    Ok(())
}
