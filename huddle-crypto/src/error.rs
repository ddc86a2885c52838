//! Crypto failure modes.
//!
//! All of these are absorbed per-message by callers: the message is
//! dropped and logged, the connection survives.

/// Errors from sealing, opening and key handling.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    /// AEAD authentication failed on the content blob.
    #[error("message authentication failed")]
    Unauthenticated,

    /// No sealed key slot matches this recipient's fingerprint.
    #[error("no sealed key for this recipient")]
    NoKeyForMe,

    /// A sealed key slot could not be unwrapped into a valid key.
    #[error("sealed content key is invalid")]
    BadKey,

    /// The origin signature does not verify against the sender's key.
    #[error("origin signature verification failed")]
    BadSignature,

    /// A public key failed to parse or is not usable for agreement.
    #[error("invalid public key")]
    InvalidKey,

    /// Encryption-side failure.
    #[error("sealing failed: {0}")]
    Seal(String),
}
