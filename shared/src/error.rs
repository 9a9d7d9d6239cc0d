/*!
Common error types for the stimulation bridge components.
*/

use thiserror::Error;

/// Common result type used throughout the shared library
pub type Result<T> = std::result::Result<T, SharedError>;

/// Comprehensive error type for all shared operations
#[derive(Error, Debug)]
pub enum SharedError {
    /// I/O errors (file operations, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Payload was not valid UTF-8 text
    #[error("Encoding error: {0}")]
    Encoding(#[from] std::str::Utf8Error),

    /// Control frame decoded but carries values outside their range
    #[error("Invalid control frame: {0}")]
    InvalidControlFrame(String),

    /// Data frame could not be assembled from the acquisition buffer
    #[error("Invalid data frame: {0}")]
    InvalidDataFrame(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
}

impl SharedError {
    /// Create a new invalid control frame error
    pub fn invalid_control_frame(msg: impl Into<String>) -> Self {
        Self::InvalidControlFrame(msg.into())
    }

    /// Create a new invalid data frame error
    pub fn invalid_data_frame(msg: impl Into<String>) -> Self {
        Self::InvalidDataFrame(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
