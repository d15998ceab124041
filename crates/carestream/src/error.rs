//! Error types for Carestream

use thiserror::Error;

/// Main error type for Carestream operations
#[derive(Error, Debug)]
pub enum CarestreamError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Upstream connection or HTTP errors
    #[error("Upstream error: {0}")]
    Upstream(String),
}

/// Result type alias for Carestream operations
pub type Result<T> = std::result::Result<T, CarestreamError>;
