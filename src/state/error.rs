use thiserror::Error;

use crate::core::config::ConfigError;
use crate::metrics::SinkError;
use crate::rag::StoreError;

#[derive(Debug, Error)]
pub enum InitializationError {
    #[error("Failed to load configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to open fragment store: {0}")]
    Store(#[source] StoreError),

    #[error("Failed to initialize query embedder: {0}")]
    Embedder(#[source] StoreError),

    #[error("Failed to open metrics sink: {0}")]
    Metrics(#[from] SinkError),
}
