//! Client error types.

use huddle_net::{ConnectionError, TransportError};

/// Errors surfaced by the client library.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// HTTP transport failure.
    #[error("http error: {0}")]
    Http(String),

    /// The server answered an API call with an error status.
    #[error("api error ({status}): {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Error message from the response body.
        message: String,
    },

    /// The endpoints speak different protocol versions.
    #[error("protocol version mismatch: {0}")]
    VersionMismatch(String),

    /// The handshake completed but admission was refused.
    #[error("join refused: {0}")]
    Unauthorized(String),

    /// The connection dropped before admission completed.
    #[error("connection lost before admission")]
    Disconnected,

    /// Admission did not complete within the deadline.
    #[error("timed out waiting for admission")]
    Timeout,

    /// The server violated the protocol.
    #[error("protocol error: {0}")]
    Protocol(&'static str),

    /// Connection-layer failure.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Transport-layer failure.
    #[error(transparent)]
    Transport(#[from] TransportError),
}
