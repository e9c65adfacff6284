//! Query metrics: per-query audit records and the non-blocking recorder
//! that persists them.

pub mod record;
pub mod recorder;
pub mod sink;

pub use record::{hash_query, MetricsTimer, QueryMetrics};
pub use recorder::MetricsRecorder;
pub use sink::{sink_from_settings, JsonlSink, LogSink, MemorySink, MetricsSink, SinkError};
