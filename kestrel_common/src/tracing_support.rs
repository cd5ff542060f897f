//! Support for setting up `tracing`.

use std::{env, fs::OpenOptions, sync::Arc};

use tracing_subscriber::{fmt, EnvFilter};

/// The environment variable used to filter our logging.
const LOG_FILTER_VAR: &str = "KESTREL_LOG";

/// The environment variable naming an optional log file.
const LOG_FILE_VAR: &str = "KESTREL_LOG_FILE";

fn env_filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_env(LOG_FILTER_VAR)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default))
}

/// Initialize tracing for the coordinator CLI.
///
/// Filtering is controlled by `KESTREL_LOG` (falling back to `RUST_LOG`),
/// defaulting to `info`. If `KESTREL_LOG_FILE` is set, log lines are
/// appended there instead of being written to stderr.
pub fn initialize_tracing() {
    let builder = fmt().with_env_filter(env_filter("info"));
    match log_file() {
        Some(file) => builder.with_writer(file).with_ansi(false).init(),
        None => builder.with_writer(std::io::stderr).init(),
    }
}

/// Initialize tracing for a worker process.
///
/// A mapper's stderr is its `CONTROL` stream, so workers must never log
/// to stderr. Logs go to `KESTREL_LOG_FILE` when set and are otherwise
/// discarded.
pub fn initialize_worker_tracing() {
    let builder = fmt().with_env_filter(env_filter("info")).with_ansi(false);
    match log_file() {
        Some(file) => builder.with_writer(file).init(),
        None => builder.with_writer(std::io::sink as fn() -> std::io::Sink).init(),
    }
}

fn log_file() -> Option<Arc<std::fs::File>> {
    let path = env::var(LOG_FILE_VAR).ok()?;
    match OpenOptions::new().create(true).append(true).open(&path) {
        Ok(file) => Some(Arc::new(file)),
        Err(err) => {
            eprintln!("could not open log file {}: {}", path, err);
            None
        }
    }
}
