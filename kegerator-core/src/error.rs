//! Error types for kegerator-core

use thiserror::Error;

/// Main error type for the kegerator-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Unknown model name, bad parameter, or inconsistent state file entry
    #[error("validation error: {0}")]
    Validation(String),

    /// Attach or read failure reported by a hardware collaborator
    #[error("hardware error on pin {pin}: {message}")]
    Hardware { pin: u8, message: String },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed state document
    #[error("decode error: {0}")]
    Decode(#[source] serde_json::Error),

    /// State could not be serialized
    #[error("encode error: {0}")]
    Encode(#[source] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// The aggregator's consumer task is no longer running
    #[error("flow on pin {0} is stopped")]
    Stopped(u8),
}

impl Error {
    pub(crate) fn hardware(pin: u8, message: impl Into<String>) -> Self {
        Error::Hardware {
            pin,
            message: message.into(),
        }
    }
}

/// Result type alias for kegerator-core
pub type Result<T> = std::result::Result<T, Error>;
