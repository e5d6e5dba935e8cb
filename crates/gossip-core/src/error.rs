//! Error types for gossip-core

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Info store and encoding errors
#[derive(Debug, Error)]
pub enum Error {
    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    /// Incoming info is not newer than the stored one
    #[error("info not fresh: {key} at {timestamp} (stored {existing})")]
    NotFresh {
        key: String,
        timestamp: i64,
        existing: i64,
    },

    /// Info arrived already past its expiry
    #[error("info expired: {key}")]
    Expired { key: String },

    /// Info failed validation and was not applied
    #[error("invalid info {key:?}: {reason}")]
    InvalidInfo { key: String, reason: String },

    /// Subscription pattern did not compile
    #[error("invalid key pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
}

impl Error {
    /// Stale writes are an expected outcome of merging, not a failure.
    pub fn is_stale(&self) -> bool {
        matches!(self, Error::NotFresh { .. } | Error::Expired { .. })
    }
}
