use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::mpsc;

use super::types::{ChatMessage, Completion, ProviderCall, StreamEvent};

/// Uniform failure taxonomy every adapter maps its backend errors onto.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("provider timed out")]
    Timeout,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited { .. }
                | ProviderError::Timeout
                | ProviderError::ProviderUnavailable(_)
        )
    }

    /// Short description without any provider payload.
    pub fn public_reason(&self) -> &'static str {
        match self {
            ProviderError::RateLimited { .. } => "rate limited",
            ProviderError::AuthFailed(_) => "authentication failed",
            ProviderError::Timeout => "timed out",
            ProviderError::InvalidRequest(_) => "request rejected",
            ProviderError::ProviderUnavailable(_) => "unavailable",
        }
    }

    /// Classify a non-success HTTP response.
    pub fn from_status(status: StatusCode, body: &str, retry_after: Option<Duration>) -> Self {
        let detail = format!("{}: {}", status, truncate(body, 200));
        match status.as_u16() {
            401 | 403 => ProviderError::AuthFailed(detail),
            429 => ProviderError::RateLimited { retry_after },
            408 | 504 => ProviderError::Timeout,
            500..=599 => ProviderError::ProviderUnavailable(detail),
            _ => ProviderError::InvalidRequest(detail),
        }
    }

    pub fn from_transport(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout
        } else {
            ProviderError::ProviderUnavailable(err.to_string())
        }
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(max_chars).collect();
    cut.push_str("...");
    cut
}

/// `Retry-After` in seconds, when present.
pub fn retry_after_header(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// Adapter kind, e.g. "openai" or "anthropic".
    fn kind(&self) -> &str;

    async fn complete(
        &self,
        messages: &[ChatMessage],
        call: &ProviderCall,
    ) -> Result<Completion, ProviderError>;

    /// Start a streamed call. The receiver yields deltas and ends with
    /// `StreamEvent::Done`; an `Err` item ends the stream.
    async fn stream(
        &self,
        messages: &[ChatMessage],
        call: &ProviderCall,
    ) -> Result<mpsc::Receiver<Result<StreamEvent, ProviderError>>, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_to_taxonomy() {
        assert!(matches!(
            ProviderError::from_status(StatusCode::UNAUTHORIZED, "bad key", None),
            ProviderError::AuthFailed(_)
        ));
        assert!(matches!(
            ProviderError::from_status(
                StatusCode::TOO_MANY_REQUESTS,
                "",
                Some(Duration::from_secs(2))
            ),
            ProviderError::RateLimited {
                retry_after: Some(_)
            }
        ));
        assert!(matches!(
            ProviderError::from_status(StatusCode::BAD_GATEWAY, "", None),
            ProviderError::ProviderUnavailable(_)
        ));
        assert!(matches!(
            ProviderError::from_status(StatusCode::BAD_REQUEST, "{}", None),
            ProviderError::InvalidRequest(_)
        ));
    }

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(ProviderError::Timeout.is_retryable());
        assert!(ProviderError::RateLimited { retry_after: None }.is_retryable());
        assert!(ProviderError::ProviderUnavailable("503".into()).is_retryable());
        assert!(!ProviderError::AuthFailed("401".into()).is_retryable());
        assert!(!ProviderError::InvalidRequest("400".into()).is_retryable());
    }

    #[test]
    fn long_bodies_are_truncated() {
        let body = "e".repeat(1_000);
        let err = ProviderError::from_status(StatusCode::BAD_REQUEST, &body, None);
        assert!(err.to_string().len() < 300);
    }
}
