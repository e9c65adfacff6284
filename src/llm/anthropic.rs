use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use super::provider::{retry_after_header, GenerationProvider, ProviderError};
use super::sse::SseBuffer;
use super::types::{ChatMessage, Completion, FinishReason, ProviderCall, StreamEvent, TokenUsage};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

/// Adapter for the Anthropic Messages API.
#[derive(Clone)]
pub struct AnthropicProvider {
    base_url: String,
    api_key: Option<String>,
    client: Client,
}

impl AnthropicProvider {
    pub fn new(base_url: Option<String>, api_key: Option<String>) -> Self {
        let base_url = base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            client: Client::new(),
        }
    }

    /// System text goes in its own field; the rest keep their order.
    fn format_messages(messages: &[ChatMessage]) -> (Option<String>, Vec<Value>) {
        let mut system: Vec<&str> = Vec::new();
        let mut formatted = Vec::new();

        for msg in messages {
            match msg.role.as_str() {
                "system" => system.push(&msg.content),
                "assistant" => formatted.push(json!({ "role": "assistant", "content": msg.content })),
                _ => formatted.push(json!({ "role": "user", "content": msg.content })),
            }
        }

        let system = if system.is_empty() {
            None
        } else {
            Some(system.join("\n\n"))
        };
        (system, formatted)
    }

    fn body(messages: &[ChatMessage], call: &ProviderCall, stream: bool) -> Value {
        let (system, formatted) = Self::format_messages(messages);
        let mut body = json!({
            "model": call.model,
            "messages": formatted,
            "max_tokens": call.max_output_tokens,
            "temperature": call.temperature,
            "stream": stream,
        });
        if let (Some(system), Some(obj)) = (system, body.as_object_mut()) {
            obj.insert("system".to_string(), json!(system));
        }
        body
    }

    async fn post(&self, body: &Value) -> Result<reqwest::Response, ProviderError> {
        let Some(key) = &self.api_key else {
            return Err(ProviderError::AuthFailed("no API key configured".into()));
        };

        let url = format!("{}/v1/messages", self.base_url);
        let res = self
            .client
            .post(&url)
            .header("x-api-key", key)
            .header("anthropic-version", API_VERSION)
            .json(body)
            .send()
            .await
            .map_err(ProviderError::from_transport)?;

        if !res.status().is_success() {
            let status = res.status();
            let retry_after = retry_after_header(res.headers());
            let text = res.text().await.unwrap_or_default();
            // 529 is Anthropic's "overloaded"
            return Err(ProviderError::from_status(status, &text, retry_after));
        }
        Ok(res)
    }
}

fn parse_stop_reason(value: &Value) -> Option<FinishReason> {
    match value.as_str()? {
        "max_tokens" => Some(FinishReason::Length),
        _ => Some(FinishReason::Stop),
    }
}

fn parse_completion(payload: &Value) -> Result<Completion, ProviderError> {
    let blocks = payload["content"]
        .as_array()
        .ok_or_else(|| ProviderError::ProviderUnavailable("response had no content".into()))?;

    let text: String = blocks
        .iter()
        .filter(|b| b["type"] == "text")
        .filter_map(|b| b["text"].as_str())
        .collect();

    Ok(Completion {
        text,
        usage: TokenUsage {
            input_tokens: payload["usage"]["input_tokens"].as_u64().unwrap_or(0) as u32,
            output_tokens: payload["usage"]["output_tokens"].as_u64().unwrap_or(0) as u32,
        },
        finish: parse_stop_reason(&payload["stop_reason"]).unwrap_or_default(),
    })
}

/// Stream state across events: usage arrives split between
/// `message_start` and `message_delta`.
#[derive(Default)]
struct StreamState {
    usage: TokenUsage,
    finish: Option<FinishReason>,
}

enum Parsed {
    Event(StreamEvent),
    Failed(ProviderError),
    Skip,
}

fn parse_event(data: &str, state: &mut StreamState) -> Parsed {
    let Ok(v) = serde_json::from_str::<Value>(data) else {
        return Parsed::Skip;
    };

    match v["type"].as_str().unwrap_or("") {
        "message_start" => {
            state.usage.input_tokens =
                v["message"]["usage"]["input_tokens"].as_u64().unwrap_or(0) as u32;
            Parsed::Skip
        }
        "content_block_delta" if v["delta"]["type"] == "text_delta" => {
            match v["delta"]["text"].as_str() {
                Some(text) if !text.is_empty() => Parsed::Event(StreamEvent::Delta(text.to_string())),
                _ => Parsed::Skip,
            }
        }
        "message_delta" => {
            if let Some(reason) = parse_stop_reason(&v["delta"]["stop_reason"]) {
                state.finish = Some(reason);
            }
            if let Some(output) = v["usage"]["output_tokens"].as_u64() {
                state.usage.output_tokens = output as u32;
            }
            Parsed::Skip
        }
        "message_stop" => Parsed::Event(StreamEvent::Done {
            usage: Some(state.usage),
            finish: state.finish.unwrap_or_default(),
        }),
        "error" => {
            let kind = v["error"]["type"].as_str().unwrap_or("");
            let message = v["error"]["message"].as_str().unwrap_or("stream error").to_string();
            let err = match kind {
                "overloaded_error" | "api_error" => ProviderError::ProviderUnavailable(message),
                "rate_limit_error" => ProviderError::RateLimited { retry_after: None },
                "authentication_error" | "permission_error" => ProviderError::AuthFailed(message),
                _ => ProviderError::InvalidRequest(message),
            };
            Parsed::Failed(err)
        }
        _ => Parsed::Skip,
    }
}

#[async_trait]
impl GenerationProvider for AnthropicProvider {
    fn kind(&self) -> &str {
        "anthropic"
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        call: &ProviderCall,
    ) -> Result<Completion, ProviderError> {
        let res = self.post(&Self::body(messages, call, false)).await?;
        let payload: Value = res
            .json()
            .await
            .map_err(|e| ProviderError::ProviderUnavailable(e.to_string()))?;
        parse_completion(&payload)
    }

    async fn stream(
        &self,
        messages: &[ChatMessage],
        call: &ProviderCall,
    ) -> Result<mpsc::Receiver<Result<StreamEvent, ProviderError>>, ProviderError> {
        let res = self.post(&Self::body(messages, call, true)).await?;

        let (tx, rx) = mpsc::channel(32);
        let mut stream = res.bytes_stream();

        tokio::spawn(async move {
            let mut buffer = SseBuffer::new();
            let mut state = StreamState::default();

            while let Some(item) = stream.next().await {
                let bytes = match item {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let _ = tx.send(Err(ProviderError::from_transport(e))).await;
                        return;
                    }
                };

                for data in buffer.push(&bytes) {
                    match parse_event(&data, &mut state) {
                        Parsed::Event(event) => {
                            let done = matches!(event, StreamEvent::Done { .. });
                            if tx.send(Ok(event)).await.is_err() || done {
                                return;
                            }
                        }
                        Parsed::Failed(err) => {
                            let _ = tx.send(Err(err)).await;
                            return;
                        }
                        Parsed::Skip => {}
                    }
                }
            }

            let _ = tx
                .send(Err(ProviderError::ProviderUnavailable(
                    "stream ended before message_stop".into(),
                )))
                .await;
        });

        Ok(rx)
    }
}
