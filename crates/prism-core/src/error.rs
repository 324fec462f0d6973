//! Error types for the engine.

use thiserror::Error;

/// Engine-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file could not be parsed
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// Statistics or configuration could not be serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] toml::ser::Error),
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
