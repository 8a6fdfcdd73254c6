//! Error types for the Hivemind limiter.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for limiter operations.
///
/// Store failures reaching [`crate::ratelimit::RateLimiter::check`] are handled by the
/// policy's failure mode and never surface through this type; the `Store` variant is
/// only produced while constructing a store.
#[derive(Error, Debug)]
pub enum LimiterError {
    /// Malformed, missing or unknown policy
    #[error("Invalid policy: {0}")]
    InvalidPolicy(String),

    /// Dimensions that cannot be turned into a bucket key
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Counter store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for limiter operations.
pub type Result<T> = std::result::Result<T, LimiterError>;
