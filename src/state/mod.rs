use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::core::config::settings::StoreBackend;
use crate::core::config::{AppPaths, ConfigService, EngineConfig};
use crate::engine::RagEngine;
use crate::llm::ProviderRegistry;
use crate::metrics::{sink_from_settings, MetricsRecorder};
use crate::rag::{
    EmbeddingStore, HttpQueryEmbedder, MemoryFragmentStore, QueryEmbedder, SqliteFragmentStore,
};

pub mod error;

use error::InitializationError;

/// Application state shared by every route.
#[derive(Clone)]
pub struct AppState {
    pub paths: Arc<AppPaths>,
    pub engine: RagEngine,
    pub store_name: String,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    /// Load configuration from disk and build the engine.
    pub async fn initialize(paths: Arc<AppPaths>) -> Result<Arc<Self>, InitializationError> {
        let config_service = ConfigService::new(paths.clone());
        let config = config_service.load_engine_config()?;
        tracing::info!("Loaded configuration from {}", config_service.config_path().display());
        Self::from_config(paths, config).await
    }

    /// Build the engine from an already validated configuration.
    ///
    /// The order is:
    /// 1. Open the fragment store (in-memory or SQLite)
    /// 2. Set up the query embedder when enabled
    /// 3. Register generation providers
    /// 4. Start the metrics drain task
    pub async fn from_config(
        paths: Arc<AppPaths>,
        config: EngineConfig,
    ) -> Result<Arc<Self>, InitializationError> {
        let store: Arc<dyn EmbeddingStore> = match config.store.backend {
            StoreBackend::Memory => {
                tracing::warn!("Using the in-memory fragment store; it starts empty");
                Arc::new(MemoryFragmentStore::new())
            }
            StoreBackend::Sqlite => {
                let path = config
                    .store
                    .path
                    .clone()
                    .unwrap_or_else(|| paths.store_path.clone());
                Arc::new(
                    SqliteFragmentStore::open(path)
                        .await
                        .map_err(InitializationError::Store)?,
                )
            }
        };
        let store_name = store.name().to_string();

        let embedder: Option<Arc<dyn QueryEmbedder>> = if config.embedding.enabled {
            Some(Arc::new(
                HttpQueryEmbedder::new(&config.embedding).map_err(InitializationError::Embedder)?,
            ))
        } else {
            None
        };

        let providers = ProviderRegistry::from_settings(&config.providers);

        let sink = sink_from_settings(&config.metrics, &paths).await?;
        let recorder = Arc::new(MetricsRecorder::spawn(sink, config.metrics.queue_capacity));

        let engine = RagEngine::new(Arc::new(config), store, embedder, providers, recorder);

        Ok(Arc::new(AppState {
            paths,
            engine,
            store_name,
            started_at: Utc::now(),
        }))
    }
}
