//! Structured logging infrastructure for Firewatch.
//!
//! This module provides centralized logging initialization with support
//! for structured JSON output and environment-based configuration.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LogFormat;

fn filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize the logging system with human-readable output.
///
/// Log level can be configured via the `RUST_LOG` environment variable.
/// If not set, `default_level` is used.
///
/// # Example
/// ```no_run
/// use firewatch_core::logging;
///
/// logging::init("info");
/// tracing::info!("Application started");
/// ```
pub fn init(default_level: &str) {
    tracing_subscriber::registry()
        .with(filter(default_level))
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

/// Initialize the logging system with JSON output for production environments.
///
/// This format is suitable for log aggregation systems and structured log analysis.
///
/// # Example
/// ```no_run
/// use firewatch_core::logging;
///
/// logging::init_json("info");
/// tracing::info!(service = "dispatch", "Service started");
/// ```
pub fn init_json(default_level: &str) {
    tracing_subscriber::registry()
        .with(filter(default_level))
        .with(fmt::layer().json().with_target(true).with_thread_ids(true))
        .init();
}

/// Initialize logging in the configured format
pub fn init_with_format(format: LogFormat, default_level: &str) {
    match format {
        LogFormat::Pretty => init(default_level),
        LogFormat::Json => init_json(default_level),
    }
}
