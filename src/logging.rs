//! Log setup and the log viewer
//!
//! Everything goes to the configured log file. Warnings and errors are also
//! echoed to stderr so the operator sees them without opening the file.

use crate::config::Settings;
use crate::error::IoError;
use std::fs::OpenOptions;
use std::path::Path;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install the global subscriber
///
/// Returns the guard that flushes the file writer on drop, or `None` when the
/// log file could not be opened and only the console is used.
pub fn init(settings: &Settings) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let file = settings
        .log_file
        .parent()
        .map_or(Ok(()), std::fs::create_dir_all)
        .and_then(|()| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&settings.log_file)
        });

    let (file_layer, guard, open_error) = match file {
        Ok(file) => {
            let (writer, guard) = tracing_appender::non_blocking(file);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false)
                .with_filter(filter);
            (Some(layer), Some(guard), None)
        }
        Err(e) => (None, None, Some(e)),
    };

    let console = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .with_filter(LevelFilter::WARN);

    tracing_subscriber::registry()
        .with(file_layer)
        .with(console)
        .init();

    if let Some(e) = open_error {
        tracing::warn!(
            path = %settings.log_file.display(),
            error = %e,
            "Cannot open log file, logging to console only"
        );
    }
    guard
}

/// The last `lines` lines of the log file
pub fn tail(path: &Path, lines: usize) -> Result<Vec<String>, IoError> {
    let content = std::fs::read_to_string(path).map_err(IoError::with("read log file", path))?;
    let all: Vec<&str> = content.lines().collect();
    let start = all.len().saturating_sub(lines);
    Ok(all[start..].iter().map(|l| l.to_string()).collect())
}
