//! Cryptography for the huddle protocol.
//!
//! Hybrid scheme per message: the content is encrypted once with a
//! symmetric key (XChaCha20-Poly1305), and that key is sealed once per
//! recipient under the recipient's public key (X25519 + HKDF-SHA256).
//! Senders sign the ciphertext with their Ed25519 identity so receivers
//! can verify origin claims.
//!
//! The relay never holds the recipients' private keys; forwarded
//! payloads stay opaque to it.

pub mod cache;
pub mod error;
pub mod identity;
pub mod seal;

pub use cache::{OpenCache, SealCache, CACHE_HEADROOM};
pub use error::CryptoError;
pub use identity::{Fingerprint, KeyPair, PublicKey};
pub use seal::{open, seal, ContentKey};
