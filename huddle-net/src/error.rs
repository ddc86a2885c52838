//! Connection-level errors.

use crate::transport::TransportError;
use huddle_crypto::CryptoError;
use huddle_types::{CodecError, PeerId};

/// Errors surfaced by [`crate::Connection`] operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConnectionError {
    /// The request exceeded its deadline.
    #[error("request timed out")]
    Timeout,

    /// The transport closed or the connection was disposed; every
    /// pending request fails with this.
    #[error("connection disconnected")]
    Disconnected,

    /// The remote handler answered with an error.
    #[error("remote error: {0}")]
    Remote(String),

    /// No public key is known for the addressed peer.
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),

    /// The handshake has not progressed far enough for this operation.
    #[error("handshake incomplete: {0}")]
    Handshake(&'static str),

    /// Encryption or decryption failed.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Wire encoding failed.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Transport-level failure.
    #[error(transparent)]
    Transport(#[from] TransportError),
}
