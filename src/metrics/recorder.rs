//! Non-blocking metrics recording.
//!
//! `record` never waits: records go through a bounded queue to a single
//! drain task that owns the sink. When the queue is full the record is
//! dropped and counted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::record::QueryMetrics;
use super::sink::MetricsSink;

enum Command {
    Record(Box<QueryMetrics>),
    Flush(oneshot::Sender<()>),
    Shutdown,
}

#[derive(Debug, Default)]
struct Counters {
    written: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
}

pub struct MetricsRecorder {
    tx: mpsc::Sender<Command>,
    counters: Arc<Counters>,
    drain: Mutex<Option<JoinHandle<()>>>,
}

impl MetricsRecorder {
    /// Spawn the drain task. Must be called inside a tokio runtime.
    pub fn spawn(sink: Box<dyn MetricsSink>, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let counters = Arc::new(Counters::default());
        let handle = tokio::spawn(drain(sink, rx, counters.clone()));
        Self {
            tx,
            counters,
            drain: Mutex::new(Some(handle)),
        }
    }

    pub fn record(&self, metrics: QueryMetrics) {
        match self.tx.try_send(Command::Record(Box::new(metrics))) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!("Metrics queue full; dropped record ({} dropped so far)", dropped);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Metrics recorder is shut down; record dropped");
            }
        }
    }

    pub fn written(&self) -> u64 {
        self.counters.written.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.counters.dropped.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.counters.failed.load(Ordering::Relaxed)
    }

    /// Wait until everything queued before this call has reached the sink.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Command::Flush(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Drain pending records, flush the sink and stop the drain task.
    pub async fn shutdown(&self) {
        let handle = self.drain.lock().ok().and_then(|mut guard| guard.take());
        let Some(handle) = handle else {
            return;
        };
        let _ = self.tx.send(Command::Shutdown).await;
        if let Err(err) = handle.await {
            tracing::error!("Metrics drain task ended abnormally: {}", err);
        }
    }
}

async fn drain(
    mut sink: Box<dyn MetricsSink>,
    mut rx: mpsc::Receiver<Command>,
    counters: Arc<Counters>,
) {
    while let Some(command) = rx.recv().await {
        match command {
            Command::Record(record) => match sink.write(&record).await {
                Ok(()) => {
                    counters.written.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("Failed to write metrics for {}: {}", record.query_id, err);
                }
            },
            Command::Flush(done) => {
                if let Err(err) = sink.flush().await {
                    tracing::warn!("Failed to flush metrics sink: {}", err);
                }
                let _ = done.send(());
            }
            Command::Shutdown => break,
        }
    }

    if let Err(err) = sink.flush().await {
        tracing::warn!("Failed to flush metrics sink: {}", err);
    }
    tracing::debug!(
        "Metrics drain stopped ({} written, {} dropped)",
        counters.written.load(Ordering::Relaxed),
        counters.dropped.load(Ordering::Relaxed)
    );
}
