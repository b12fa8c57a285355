//! Core error types

use thiserror::Error;

/// Core error type for Firewatch
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration is structurally valid but semantically wrong
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Configuration file could not be parsed
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for core operations
pub type Result<T> = std::result::Result<T, Error>;
