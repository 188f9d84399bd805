//! File logging for recap
//!
//! All binaries log to a daily-rolling file under the XDG state directory
//! (`~/.local/state/recap/recap.log.YYYY-MM-DD`). `RUST_LOG` overrides the
//! configured level. Rotated files beyond `max_files` are pruned at init.

use crate::config::{Config, LoggingConfig};
use std::path::{Path, PathBuf};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Base name of the log file; rotation appends the date.
const LOG_FILE_PREFIX: &str = "recap.log";

/// Handle that flushes buffered log writes when dropped.
///
/// Hold this for the lifetime of the process; dropping it early loses
/// whatever the non-blocking writer has not yet flushed.
pub struct LoggingGuard {
    _guard: tracing_appender::non_blocking::WorkerGuard,
}

/// Set up file logging from the given configuration.
pub fn init(config: &LoggingConfig) -> crate::error::Result<LoggingGuard> {
    let log_dir = Config::state_dir();
    std::fs::create_dir_all(&log_dir)?;

    let appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    // RUST_LOG takes precedence over the configured level
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true),
        )
        .init();

    tracing::info!(
        log_dir = %log_dir.display(),
        level = %config.level,
        max_files = config.max_files,
        "Logging initialized"
    );

    prune_rotated_logs(&log_dir, config.max_files);

    Ok(LoggingGuard { _guard: guard })
}

/// Initialize logging for tests (stdout, captured per test).
pub fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .with_span_events(FmtSpan::CLOSE)
        .try_init();
}

/// Returns the log file path
pub fn log_file_path() -> PathBuf {
    Config::log_path()
}

/// Delete the oldest rotated log files, keeping at most `max_files`.
///
/// Daily rotation names files `recap.log.YYYY-MM-DD`, so lexicographic order
/// is chronological order. Failures here are logged and ignored; logging
/// setup must not take the process down.
fn prune_rotated_logs(log_dir: &Path, max_files: usize) {
    let entries = match std::fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };

    let mut logs: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(LOG_FILE_PREFIX))
        })
        .collect();

    if logs.len() <= max_files {
        return;
    }

    logs.sort();
    let excess = logs.len() - max_files;
    for path in logs.into_iter().take(excess) {
        if let Err(e) = std::fs::remove_file(&path) {
            tracing::warn!(path = %path.display(), error = %e, "Failed to prune old log file");
        }
    }
}
