//! Settings error types.

use thiserror::Error;

/// Errors that can occur when loading or validating options.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// Failed to read the options file from disk.
    #[error("failed to read options file: {0}")]
    Io(#[from] std::io::Error),
    /// Failed to parse JSON in the options file.
    #[error("failed to parse options JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// An option value was invalid (e.g., zero timeout).
    #[error("invalid option value: {0}")]
    InvalidValue(String),
}

/// Result type for settings operations.
pub type Result<T> = std::result::Result<T, SettingsError>;
