//! Error types for Tollgate.

use thiserror::Error;

/// Main error type for Tollgate operations.
///
/// A rate-limited request is not an error: the engine answers `Ok(false)` for
/// it. Everything in here means the limiter could not reach a decision.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// The store could not be reached or failed an I/O operation
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// The store did not answer before the deadline
    #[error("Store timed out: {0}")]
    StoreTimeout(String),

    /// A caller or configuration supplied an unusable value
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The store returned a bucket that violates the current policy
    #[error("Invalid state for key {key}: tokens={tokens}, capacity={capacity}")]
    InvalidState {
        key: String,
        tokens: i64,
        capacity: i64,
    },

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// gRPC transport errors
    #[error("gRPC transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TollgateError {
    /// Whether this error came from the state store rather than the caller.
    pub fn is_store_failure(&self) -> bool {
        matches!(
            self,
            TollgateError::StoreUnavailable(_)
                | TollgateError::StoreTimeout(_)
                | TollgateError::InvalidState { .. }
        )
    }
}

impl From<config::ConfigError> for TollgateError {
    fn from(e: config::ConfigError) -> Self {
        TollgateError::Config(e.to_string())
    }
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;
