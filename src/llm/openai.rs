use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use super::provider::{retry_after_header, GenerationProvider, ProviderError};
use super::sse::SseBuffer;
use super::types::{ChatMessage, Completion, FinishReason, ProviderCall, StreamEvent, TokenUsage};

const DEFAULT_BASE_URL: &str = "https://api.openai.com";

/// Adapter for `/v1/chat/completions` servers: OpenAI itself, LM Studio,
/// vLLM, Ollama and friends.
#[derive(Clone)]
pub struct OpenAiCompatProvider {
    base_url: String,
    api_key: Option<String>,
    client: Client,
}

impl OpenAiCompatProvider {
    pub fn new(base_url: Option<String>, api_key: Option<String>) -> Self {
        let base_url = base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            client: Client::new(),
        }
    }

    fn body(messages: &[ChatMessage], call: &ProviderCall, stream: bool) -> Value {
        json!({
            "model": call.model,
            "messages": messages,
            "temperature": call.temperature,
            "max_tokens": call.max_output_tokens,
            "stream": stream,
        })
    }

    async fn post(&self, body: &Value) -> Result<reqwest::Response, ProviderError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let mut request = self.client.post(&url).json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let res = request.send().await.map_err(ProviderError::from_transport)?;
        if !res.status().is_success() {
            let status = res.status();
            let retry_after = retry_after_header(res.headers());
            let text = res.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, &text, retry_after));
        }
        Ok(res)
    }
}

fn parse_finish(value: &Value) -> Option<FinishReason> {
    match value.as_str()? {
        "length" => Some(FinishReason::Length),
        _ => Some(FinishReason::Stop),
    }
}

fn parse_usage(value: &Value) -> Option<TokenUsage> {
    let usage = value.as_object()?;
    Some(TokenUsage {
        input_tokens: usage.get("prompt_tokens")?.as_u64()? as u32,
        output_tokens: usage
            .get("completion_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32,
    })
}

fn parse_completion(payload: &Value) -> Result<Completion, ProviderError> {
    let choice = &payload["choices"][0];
    let text = choice["message"]["content"]
        .as_str()
        .ok_or_else(|| ProviderError::ProviderUnavailable("response had no message content".into()))?
        .to_string();

    Ok(Completion {
        text,
        usage: parse_usage(&payload["usage"]).unwrap_or_default(),
        finish: parse_finish(&choice["finish_reason"]).unwrap_or_default(),
    })
}

#[async_trait]
impl GenerationProvider for OpenAiCompatProvider {
    fn kind(&self) -> &str {
        "openai"
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
            let mut finish: Option<FinishReason> = None;
            let mut usage: Option<TokenUsage> = None;

            while let Some(item) = stream.next().await {
                let bytes = match item {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let _ = tx.send(Err(ProviderError::from_transport(e))).await;
                        return;
                    }
                };

                for data in buffer.push(&bytes) {
                    if data == "[DONE]" {
                        let done = StreamEvent::Done {
                            usage,
                            finish: finish.unwrap_or_default(),
                        };
                        let _ = tx.send(Ok(done)).await;
                        return;
                    }

                    let Ok(json) = serde_json::from_str::<Value>(&data) else {
                        continue;
                    };
                    if let Some(parsed) = parse_usage(&json["usage"]) {
                        usage = Some(parsed);
                    }
                    let choice = &json["choices"][0];
                    if let Some(reason) = parse_finish(&choice["finish_reason"]) {
                        finish = Some(reason);
                    }
                    if let Some(content) = choice["delta"]["content"].as_str() {
                        if !content.is_empty()
                            && tx.send(Ok(StreamEvent::Delta(content.to_string()))).await.is_err()
                        {
                            return;
                        }
                    }
                }
            }

            let outcome = match (buffer.finish().as_deref(), finish) {
                (Some("[DONE]"), _) | (_, Some(_)) => Ok(StreamEvent::Done {
                    usage,
                    finish: finish.unwrap_or_default(),
                }),
                _ => Err(ProviderError::ProviderUnavailable(
                    "stream ended before completion".into(),
                )),
            };
            let _ = tx.send(outcome).await;
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_completion_payload() {
        let payload = json!({
            "choices": [{
                "message": { "role": "assistant", "content": "Use a USB mic [Source 1]." },
                "finish_reason": "length"
            }],
            "usage": { "prompt_tokens": 120, "completion_tokens": 12 }
        });

        let completion = parse_completion(&payload).unwrap();
        assert_eq!(completion.text, "Use a USB mic [Source 1].");
        assert_eq!(completion.finish, FinishReason::Length);
        assert_eq!(completion.usage.total(), 132);
    }

    #[test]
    fn request_body_carries_params() {
        let call = ProviderCall {
            model: "gpt-4o-mini".into(),
            temperature: 0.2,
            max_output_tokens: 256,
        };
        let body = OpenAiCompatProvider::body(&[ChatMessage::user("hi")], &call, true);
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["max_tokens"], 256);
        assert_eq!(body["stream"], true);
        assert_eq!(body["messages"][0]["role"], "user");
    }

    #[test]
    fn missing_content_is_unavailable() {
        let err = parse_completion(&json!({ "choices": [] })).unwrap_err();
        assert!(err.is_retryable());
    }
}
