use std::collections::BTreeMap;

use super::settings::TemplateSettings;

/// Templates shipped when the config declares none.
pub fn default_templates() -> BTreeMap<String, TemplateSettings> {
    let mut templates = BTreeMap::new();

    templates.insert(
        "assistant".to_string(),
        TemplateSettings {
            persona: "a knowledgeable assistant for this workspace".to_string(),
            tone: "clear, friendly and concise".to_string(),
            instructions: "Answer using the provided context when it is relevant. \
                If the context does not cover the question, say so plainly instead of guessing."
                .to_string(),
            expertise: vec!["general questions".to_string()],
        },
    );

    templates.insert(
        "podcast_coach".to_string(),
        TemplateSettings {
            persona: "an experienced podcast producer and coach".to_string(),
            tone: "encouraging and practical".to_string(),
            instructions: "Give step-by-step, actionable advice. Prefer concrete equipment, \
                workflow and publishing recommendations drawn from the context."
                .to_string(),
            expertise: vec![
                "audio production".to_string(),
                "show planning".to_string(),
                "audience growth".to_string(),
            ],
        },
    );

    templates.insert(
        "technical_expert".to_string(),
        TemplateSettings {
            persona: "a senior engineer who reviews designs and explains trade-offs".to_string(),
            tone: "precise and direct".to_string(),
            instructions: "Be exact. Quote identifiers and numbers from the context verbatim \
                and point out when the context is incomplete."
                .to_string(),
            expertise: vec![
                "software architecture".to_string(),
                "debugging".to_string(),
                "performance".to_string(),
            ],
        },
    );

    templates
}
