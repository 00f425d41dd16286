//! # Setup Logging
//!
//! Configures the global `tracing` subscriber for a binary hosting the engine:
//!
//! - The level comes from `RUST_LOG` when set, otherwise from `default_level`.
//! - Console output is human-readable with ANSI colors.
//! - File output is JSON, written through a non-blocking daily rolling appender
//!   named after the application.
//!
//! The returned `WorkerGuard` must be kept alive for as long as logs should be
//! flushed to the file.

use std::io;
use std::path::Path;

use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Installs the console and rolling-file layers as the global subscriber.
///
/// # Errors
/// Fails when the log directory cannot be created or a global subscriber is
/// already installed.
pub fn setup_logging(log_dir: &Path, default_level: &str, app_name: &str) -> io::Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir)?;

    let file_appender = rolling::daily(log_dir, app_name);
    let (non_blocking_appender, guard) = non_blocking(file_appender);

    let console_layer = fmt::layer().with_target(true).with_ansi(true);

    let file_layer = fmt::layer()
        .with_ansi(false)
        .with_writer(non_blocking_appender)
        .json();

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(io::Error::other)?;

    info!(level = default_level, dir = %log_dir.display(), "Logging initialized");
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_logging_creates_directory_and_refuses_second_install() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temporary directory");
        let log_dir = temp_dir.path().join("nested").join("logs");

        let guard = setup_logging(&log_dir, "debug", "sip_pmi_test");
        assert!(guard.is_ok());
        assert!(log_dir.is_dir());

        // Only one global subscriber may exist per process.
        assert!(setup_logging(&log_dir, "debug", "sip_pmi_test").is_err());
    }
}
