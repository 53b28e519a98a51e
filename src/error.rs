//! DHT error types.
//!
//! Errors are grouped so callers can tell "no answer" apart from "answered
//! with failure":
//!
//! | Kind | Variants |
//! |------|----------|
//! | Transport | [`DhtError::Transport`], [`DhtError::Io`] |
//! | Timeout | [`DhtError::Timeout`] |
//! | Protocol | [`DhtError::Protocol`], [`DhtError::Serialization`] |
//! | Validation | [`DhtError::Validation`], [`DhtError::InvalidKey`], [`DhtError::Crypto`] |
//! | Not found | [`DhtError::NotFound`], [`DhtError::KeyNotFound`] |
//! | Remote failure | [`DhtError::Rejected`] |

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DhtError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("operation timed out")]
    Timeout,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid key format: {0}")]
    InvalidKey(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("key not found")]
    KeyNotFound,

    #[error("crypto error: {0}")]
    Crypto(String),

    /// The remote peer received the request and answered with an error status.
    #[error("peer rejected request: {0}")]
    Rejected(String),

    #[error("state actor closed")]
    ActorClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DhtError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, DhtError::Timeout)
    }
}

/// Result type for DHT operations.
pub type Result<T> = std::result::Result<T, DhtError>;
