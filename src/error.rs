//! Crate-wide error type.
//!
//! Each layer owns its own error enum (codec, transport, HTTP API, config).
//! Connectivity failures never leave the realtime path as errors, so
//! `RealtimeError` only wraps what callers of views and the context see.

use thiserror::Error;

use crate::api::ApiError;
use crate::config::ConfigError;

/// Result type for realtime operations
pub type RealtimeResult<T> = Result<T, RealtimeError>;

/// Errors surfaced by views and the connection context
#[derive(Debug, Error)]
pub enum RealtimeError {
    #[error("API error: {0}")]
    Api(#[from] ApiError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("View is not mounted")]
    Unmounted,

    #[error("Invalid message: {0}")]
    InvalidMessage(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RealtimeError::InvalidMessage("empty content".to_string());
        assert_eq!(err.to_string(), "Invalid message: empty content");

        let err: RealtimeError = ApiError::Unauthorized.into();
        assert_eq!(err.to_string(), "API error: Unauthorized");
    }
}
