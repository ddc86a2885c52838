//! Server error types.

use huddle_net::ConnectionError;

/// Authentication and admission failures, mapped onto the HTTP surface.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// Unknown or already consumed token.
    #[error("invalid token")]
    InvalidToken,

    /// The token exists but its lifetime has passed.
    #[error("token expired")]
    ExpiredToken,

    /// No room with that id is open.
    #[error("unknown room")]
    RoomNotFound,

    /// Room permissions refuse this operation.
    #[error("access to this room is denied")]
    Forbidden,

    /// Rate limit exceeded.
    #[error("rate limit exceeded")]
    RateLimited,

    /// A supplied public key failed to parse.
    #[error("invalid public key")]
    InvalidKey,
}

/// Top-level server error.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Authentication or admission failure.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Connection-layer failure.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Configuration failure.
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    /// The connecting peer never completed `peer.init`.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result alias for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;
