//! Error types shared across the query pipeline.
//!
//! Each stage owns a narrow error enum. All of them collapse into a
//! `QueryError` carrying a stable `ErrorKind`, which is the only thing a
//! caller of the engine (or the HTTP surface) ever sees.

use std::fmt;

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::llm::provider::ProviderError;
use crate::llm::types::ProviderAttempt;
use crate::rag::store::StoreError;

/// Stable, user-visible failure classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    InvalidQuery,
    BackendUnavailable,
    BudgetExceeded,
    GenerationFailed,
    Timeout,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidQuery => "InvalidQuery",
            ErrorKind::BackendUnavailable => "BackendUnavailable",
            ErrorKind::BudgetExceeded => "BudgetExceeded",
            ErrorKind::GenerationFailed => "GenerationFailed",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::Cancelled => "Cancelled",
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            ErrorKind::InvalidQuery => StatusCode::BAD_REQUEST,
            ErrorKind::BackendUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::BudgetExceeded => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::GenerationFailed => StatusCode::BAD_GATEWAY,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            // nginx-style "client closed request"
            ErrorKind::Cancelled => {
                StatusCode::from_u16(499).unwrap_or(StatusCode::REQUEST_TIMEOUT)
            }
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Stage errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    #[error("embedding store unavailable: {0}")]
    BackendUnavailable(#[source] StoreError),
    #[error("retrieval timed out after {0} ms")]
    Timeout(u64),
    #[error("retrieval cancelled")]
    Cancelled,
}

impl RetrievalError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RetrievalError::InvalidQuery(_) => ErrorKind::InvalidQuery,
            RetrievalError::BackendUnavailable(_) => ErrorKind::BackendUnavailable,
            RetrievalError::Timeout(_) => ErrorKind::Timeout,
            RetrievalError::Cancelled => ErrorKind::Cancelled,
        }
    }
}

#[derive(Debug, Error)]
pub enum AugmentationError {
    #[error("prompt needs ~{required} tokens but the budget is {budget}")]
    BudgetExceeded { required: usize, budget: usize },
}

impl AugmentationError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::BudgetExceeded
    }
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("provider '{provider}' rejected the request: {source}")]
    Fatal {
        provider: String,
        #[source]
        source: ProviderError,
    },
    #[error("all providers failed ({} tried)", attempts.len())]
    Exhausted { attempts: Vec<ProviderAttempt> },
    #[error("generation exceeded its {0} ms deadline")]
    Timeout(u64),
    #[error("generation cancelled")]
    Cancelled,
    #[error("unknown provider: {0}")]
    UnknownProvider(String),
}

impl GenerationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GenerationError::Timeout(_) => ErrorKind::Timeout,
            GenerationError::Cancelled => ErrorKind::Cancelled,
            GenerationError::Fatal { .. }
            | GenerationError::Exhausted { .. }
            | GenerationError::UnknownProvider(_) => ErrorKind::GenerationFailed,
        }
    }
}

// ---------------------------------------------------------------------------
// QueryError
// ---------------------------------------------------------------------------

/// End-to-end failure of a single query.
///
/// `message` is safe to show to a caller: provider bodies and scores never
/// end up in it.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct QueryError {
    pub kind: ErrorKind,
    pub message: String,
}

impl QueryError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidQuery, message)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "query was cancelled")
    }
}

impl From<RetrievalError> for QueryError {
    fn from(err: RetrievalError) -> Self {
        let message = match &err {
            RetrievalError::InvalidQuery(reason) => reason.clone(),
            RetrievalError::BackendUnavailable(_) => "knowledge store is unavailable".to_string(),
            RetrievalError::Timeout(_) => "retrieval timed out".to_string(),
            RetrievalError::Cancelled => "query was cancelled".to_string(),
        };
        Self::new(err.kind(), message)
    }
}

impl From<AugmentationError> for QueryError {
    fn from(err: AugmentationError) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

impl From<GenerationError> for QueryError {
    fn from(err: GenerationError) -> Self {
        let message = match &err {
            GenerationError::Fatal { provider, source } => {
                format!("provider '{}' failed: {}", provider, source.public_reason())
            }
            GenerationError::Exhausted { attempts } => {
                let tried: Vec<&str> = attempts.iter().map(|a| a.provider.as_str()).collect();
                format!("no provider could answer (tried: {})", tried.join(", "))
            }
            GenerationError::Timeout(_) => "generation timed out".to_string(),
            GenerationError::Cancelled => "query was cancelled".to_string(),
            GenerationError::UnknownProvider(name) => format!("unknown provider '{}'", name),
        };
        Self::new(err.kind(), message)
    }
}

// ---------------------------------------------------------------------------
// ApiError (HTTP boundary)
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("internal error: {0}")]
    Internal(String),
    #[error(transparent)]
    Query(#[from] QueryError),
}

impl ApiError {
    pub fn internal<E: fmt::Display>(err: E) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, kind, message) = match &self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "InvalidQuery", msg.clone()),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NotFound", msg.clone()),
            ApiError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal",
                    "internal error".to_string(),
                )
            }
            ApiError::Query(err) => (err.kind.status_code(), err.kind.as_str(), err.message.clone()),
        };

        let body = Json(json!({ "error": { "kind": kind, "message": message } }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_serializes_as_stable_name() {
        let value = serde_json::to_value(ErrorKind::BudgetExceeded).unwrap();
        assert_eq!(value, json!("BudgetExceeded"));
        assert_eq!(ErrorKind::Cancelled.to_string(), "Cancelled");
    }

    #[test]
    fn retrieval_errors_map_to_kinds() {
        let err: QueryError = RetrievalError::InvalidQuery("empty query".into()).into();
        assert_eq!(err.kind, ErrorKind::InvalidQuery);
        assert_eq!(err.message, "empty query");

        let err: QueryError =
            RetrievalError::BackendUnavailable(StoreError::Unavailable("conn refused".into()))
                .into();
        assert_eq!(err.kind, ErrorKind::BackendUnavailable);
        assert!(!err.message.contains("conn refused"));
    }

    #[test]
    fn fatal_generation_error_hides_provider_body() {
        let err: QueryError = GenerationError::Fatal {
            provider: "openai".into(),
            source: ProviderError::InvalidRequest("{\"secret\":\"body\"}".into()),
        }
        .into();
        assert_eq!(err.kind, ErrorKind::GenerationFailed);
        assert!(!err.message.contains("secret"));
    }

    #[test]
    fn budget_error_maps_to_budget_kind() {
        let err: QueryError = AugmentationError::BudgetExceeded {
            required: 1030,
            budget: 1000,
        }
        .into();
        assert_eq!(err.kind, ErrorKind::BudgetExceeded);
    }
}
