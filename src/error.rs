//! Error types for lora-rs.

use thiserror::Error;

/// Result type alias for lora-rs operations.
pub type Result<T> = std::result::Result<T, LoraError>;

/// Errors that can occur in lora-rs operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum LoraError {
    /// Invalid configuration parameter.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Underlying candle error.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}
