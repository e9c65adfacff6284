use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use super::store::{QueryEmbedder, StoreError};
use crate::core::config::settings::EmbeddingSettings;

/// Query embedder for any OpenAI-compatible `/v1/embeddings` endpoint.
#[derive(Clone)]
pub struct HttpQueryEmbedder {
    base_url: String,
    model: String,
    api_key: Option<String>,
    client: Client,
}

impl HttpQueryEmbedder {
    pub fn new(settings: &EmbeddingSettings) -> Result<Self, StoreError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(settings.timeout_ms))
            .build()
            .map_err(StoreError::unavailable)?;

        let api_key = settings
            .api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .or_else(|| {
                settings
                    .api_key_env
                    .as_deref()
                    .and_then(|var| std::env::var(var).ok())
            });

        Ok(Self {
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            model: settings.model.clone(),
            api_key,
            client,
        })
    }
}

fn parse_embedding(payload: &Value) -> Result<Vec<f32>, StoreError> {
    let values = payload["data"][0]["embedding"]
        .as_array()
        .ok_or_else(|| StoreError::Corrupt("embedding response has no data[0].embedding".into()))?;

    let embedding: Vec<f32> = values
        .iter()
        .filter_map(|v| v.as_f64().map(|f| f as f32))
        .collect();

    if embedding.is_empty() {
        return Err(StoreError::Corrupt("embedding response was empty".into()));
    }
    Ok(embedding)
}

#[async_trait]
impl QueryEmbedder for HttpQueryEmbedder {
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, StoreError> {
        let url = format!("{}/v1/embeddings", self.base_url);

        let body = json!({
            "model": self.model,
            "input": [text],
        });

        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let res = request.send().await.map_err(StoreError::unavailable)?;

        let status = res.status();
        if !status.is_success() {
            tracing::warn!("Embedding endpoint returned {}", status);
            return Err(StoreError::Unavailable(format!("embedding endpoint returned {}", status)));
        }

        let payload: Value = res.json().await.map_err(|e| StoreError::Corrupt(e.to_string()))?;
        parse_embedding(&payload)
    }
}
