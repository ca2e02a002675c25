//! Error types for PeerLink.
//!
//! Errors fall into four families: protocol errors (dropped, connection
//! continues), authentication errors (reported to the caller), transport
//! errors (fatal to one connection or attempt) and brokering errors
//! (reported synchronously to the requester).

use thiserror::Error;

/// Core error type for PeerLink operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Wire protocol error.
    /// Malformed frames are silently dropped.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Encoding/decoding error.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Credential store operation failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// Socket read/write or connect failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// Username is already registered.
    #[error("username already exists")]
    DuplicateUser,

    /// Username/password pair was rejected.
    #[error("invalid credentials")]
    InvalidCredentials,

    /// Request requires a logged-in session.
    #[error("not authenticated")]
    NotAuthenticated,

    /// Brokering failed: the peer is offline or has no listener.
    #[error("peer unavailable: {0}")]
    PeerUnavailable(String),

    /// Neither the direct path nor the relay delivered the message.
    #[error("delivery failed: {0}")]
    Delivery(String),

    /// The connection was closed.
    #[error("connection closed")]
    Closed,
}

/// Result type alias using PeerLink's Error.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Check if this error should cause a silent frame drop.
    /// Malformed input never tears down the connection.
    pub fn should_silent_drop(&self) -> bool {
        matches!(self, Error::Protocol(_) | Error::Encoding(_))
    }

    /// Whether the error ends the connection it occurred on.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Timeout | Error::Closed)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Transport(e.to_string())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Encoding(e.to_string())
    }
}
