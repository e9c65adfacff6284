use std::sync::OnceLock;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

use crate::core::config::AppPaths;
use crate::metrics::sink::LOG_SINK_TARGET;

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Install the global subscriber: stdout plus a daily `rag-engine.log`.
///
/// `RUST_LOG` overrides the default `info` filter. Per-query metrics events
/// go to the file only. Returns false when a subscriber was already set.
pub fn init(paths: &AppPaths) -> bool {
    let log_dir = &paths.log_dir;
    if let Err(err) = std::fs::create_dir_all(log_dir) {
        eprintln!("Cannot create log directory {}: {}", log_dir.display(), err);
    }

    let file_appender = tracing_appender::rolling::daily(log_dir, "rag-engine.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_filter(filter_fn(|meta| meta.target() != LOG_SINK_TARGET));
    let file_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_ansi(false)
        .with_writer(non_blocking);

    match tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
    {
        Ok(()) => {
            let _ = LOG_GUARD.set(guard);
            true
        }
        Err(err) => {
            tracing::debug!("Logging already initialized; keeping existing subscriber: {}", err);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_keeps_first_subscriber() {
        let dir = tempfile::tempdir().unwrap();
        let paths = AppPaths::with_dirs(dir.path().to_path_buf(), dir.path().join("data"));

        let first = init(&paths);
        assert!(!init(&paths));
        if first {
            assert!(LOG_GUARD.get().is_some());
        }
        assert!(paths.log_dir.is_dir());
    }
}
