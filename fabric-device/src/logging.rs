//! Logging setup for applications embedding the controller.
//!
//! Library code logs through `tracing` and never installs a subscriber on
//! its own; hosts pick a mode here, or wire their own subscriber.

use tracing_subscriber::{fmt, EnvFilter, Registry};

/// Logging mode for different host environments.
#[derive(Debug, Clone, Copy)]
pub enum LoggingMode {
    /// No output; for hosts that install their own subscriber or none.
    Silent,
    /// Compact stderr output for development.
    Development,
    /// Verbose output with source locations for debugging.
    Debug,
}

/// Logging configuration error.
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("failed to initialize tracing subscriber: {0}")]
    TracingInit(String),
}

/// Initialize logging with the given mode. Call once, early.
///
/// # Environment variables
///
/// - `FABRIC_LOG_LEVEL`: override the log level filter
/// - `RUST_LOG`: standard fallback filter
pub fn init_logging(mode: LoggingMode) -> Result<(), LoggingError> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    match mode {
        LoggingMode::Silent => Ok(()),
        LoggingMode::Development => {
            let subscriber = Registry::default()
                .with(
                    fmt::layer()
                        .with_target(false)
                        .with_file(false)
                        .with_line_number(false)
                        .compact(),
                )
                .with(env_filter("info"));
            subscriber
                .try_init()
                .map_err(|e| LoggingError::TracingInit(e.to_string()))
        }
        LoggingMode::Debug => {
            let subscriber = Registry::default()
                .with(fmt::layer().pretty().with_file(true).with_line_number(true))
                .with(env_filter("debug"));
            subscriber
                .try_init()
                .map_err(|e| LoggingError::TracingInit(e.to_string()))
        }
    }
}

/// Initialize from `FABRIC_LOG_MODE` (silent, development, debug).
/// Defaults to silent.
pub fn init_logging_from_env() -> Result<(), LoggingError> {
    let mode = match std::env::var("FABRIC_LOG_MODE").as_deref() {
        Ok("development") => LoggingMode::Development,
        Ok("debug") => LoggingMode::Debug,
        _ => LoggingMode::Silent,
    };
    init_logging(mode)
}

fn env_filter(default_level: &str) -> EnvFilter {
    if let Ok(level) = std::env::var("FABRIC_LOG_LEVEL") {
        EnvFilter::new(level)
    } else if let Ok(rust_log) = std::env::var("RUST_LOG") {
        EnvFilter::new(rust_log)
    } else {
        EnvFilter::new(default_level)
    }
}

/// Whether a subscriber has been installed, to avoid double init.
pub fn is_initialized() -> bool {
    tracing::dispatcher::has_been_set()
}
