use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use super::record::QueryMetrics;
use crate::core::config::settings::{MetricsSettings, MetricsSinkKind};
use crate::core::config::AppPaths;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("metrics I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("metrics serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Append-only destination for finished query records.
#[async_trait]
pub trait MetricsSink: Send {
    async fn write(&mut self, record: &QueryMetrics) -> Result<(), SinkError>;

    async fn flush(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// `tracing` target of the events `LogSink` emits.
pub const LOG_SINK_TARGET: &str = "query_metrics";

/// Emits each record as a structured `tracing` event.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl MetricsSink for LogSink {
    async fn write(&mut self, record: &QueryMetrics) -> Result<(), SinkError> {
        tracing::info!(
            target: LOG_SINK_TARGET,
            query_id = %record.query_id,
            scope = %record.scope_id,
            template = %record.template,
            provider = record.provider.as_deref().unwrap_or("-"),
            model = record.model.as_deref().unwrap_or("-"),
            retrieval_ms = record.retrieval_latency_ms,
            generation_ms = record.generation_latency_ms,
            total_ms = record.total_latency_ms,
            fragments = record.fragments_used,
            avg_relevance = record.average_relevance.unwrap_or(0.0),
            input_tokens = record.usage.input_tokens,
            output_tokens = record.usage.output_tokens,
            retries = record.total_retries(),
            success = record.success,
            error_kind = record.error_kind.map(|k| k.as_str()).unwrap_or("-"),
            "query finished"
        );
        Ok(())
    }
}

/// One JSON object per line, appended to a file.
pub struct JsonlSink {
    path: PathBuf,
    file: tokio::fs::File,
}

impl JsonlSink {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, SinkError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl MetricsSink for JsonlSink {
    async fn write(&mut self, record: &QueryMetrics) -> Result<(), SinkError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        self.file.write_all(&line).await?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), SinkError> {
        self.file.flush().await?;
        Ok(())
    }
}

/// Keeps records in memory; handy for tests and embedding hosts that read
/// metrics back directly.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<QueryMetrics>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<QueryMetrics> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl MetricsSink for MemorySink {
    async fn write(&mut self, record: &QueryMetrics) -> Result<(), SinkError> {
        if let Ok(mut records) = self.records.lock() {
            records.push(record.clone());
        }
        Ok(())
    }
}

pub async fn sink_from_settings(
    settings: &MetricsSettings,
    paths: &AppPaths,
) -> Result<Box<dyn MetricsSink>, SinkError> {
    match settings.sink {
        MetricsSinkKind::Log => Ok(Box::new(LogSink)),
        MetricsSinkKind::Jsonl => {
            let path = settings
                .path
                .clone()
                .unwrap_or_else(|| paths.metrics_path.clone());
            let sink = JsonlSink::open(&path).await?;
            tracing::info!("Query metrics appended to {}", sink.path().display());
            Ok(Box::new(sink))
        }
    }
}
