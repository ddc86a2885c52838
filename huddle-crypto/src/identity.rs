//! Identity keys.
//!
//! Each endpoint (peer or server) holds one Ed25519 keypair. The same
//! key serves both roles of the hybrid scheme: signatures use it
//! directly, and the X25519 keys used for sealing are derived from it
//! (verifying key via the birational map to Montgomery form, signing
//! key via the clamped SHA-512 scalar), so a single 32-byte public key
//! identifies a peer everywhere.

use crate::error::CryptoError;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha512};
use std::fmt;

/// Length of a public key and of a fingerprint.
pub const KEY_LEN: usize = 32;

/// A 32-byte Ed25519 public key, base64url-encoded on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; KEY_LEN]);

impl PublicKey {
    /// Create from raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != KEY_LEN {
            return Err(CryptoError::InvalidKey);
        }
        let mut arr = [0u8; KEY_LEN];
        arr.copy_from_slice(bytes);
        Ok(Self(arr))
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// URL-safe base64 encoding.
    pub fn to_b64(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.0)
    }

    /// Parse from URL-safe base64.
    pub fn from_b64(s: &str) -> Result<Self, CryptoError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(s)
            .map_err(|_| CryptoError::InvalidKey)?;
        Self::from_bytes(&bytes)
    }

    /// BLAKE3 fingerprint, used to address key slots and caches.
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint(*blake3::hash(&self.0).as_bytes())
    }

    /// Verify an Ed25519 signature made by this key.
    pub fn verify(&self, message: &[u8], signature: &[u8; 64]) -> Result<(), CryptoError> {
        let key = VerifyingKey::from_bytes(&self.0).map_err(|_| CryptoError::InvalidKey)?;
        let sig = Signature::from_bytes(signature);
        key.verify(message, &sig)
            .map_err(|_| CryptoError::BadSignature)
    }

    /// The X25519 form of this key, for sealing.
    pub fn agreement_key(&self) -> Result<x25519_dalek::PublicKey, CryptoError> {
        let key = VerifyingKey::from_bytes(&self.0).map_err(|_| CryptoError::InvalidKey)?;
        Ok(x25519_dalek::PublicKey::from(key.to_montgomery().to_bytes()))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", &self.to_b64()[..8])
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_b64())
    }
}

/// BLAKE3 hash of a public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(pub [u8; KEY_LEN]);

impl Fingerprint {
    /// Raw fingerprint bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex: String = self.0[..4].iter().map(|b| format!("{b:02x}")).collect();
        write!(f, "Fingerprint({hex})")
    }
}

/// An endpoint's long-term identity keypair.
#[derive(Clone)]
pub struct KeyPair {
    signing: SigningKey,
    public: PublicKey,
}

impl KeyPair {
    /// Generate a fresh keypair.
    pub fn generate() -> Self {
        let signing = SigningKey::generate(&mut OsRng);
        let public = PublicKey(signing.verifying_key().to_bytes());
        Self { signing, public }
    }

    /// Restore a keypair from its 32-byte seed.
    pub fn from_seed(seed: &[u8]) -> Result<Self, CryptoError> {
        if seed.len() != KEY_LEN {
            return Err(CryptoError::InvalidKey);
        }
        let mut arr = [0u8; KEY_LEN];
        arr.copy_from_slice(seed);
        let signing = SigningKey::from_bytes(&arr);
        let public = PublicKey(signing.verifying_key().to_bytes());
        Ok(Self { signing, public })
    }

    /// This keypair's public half.
    pub fn public(&self) -> PublicKey {
        self.public
    }

    /// Sign a message; returns the raw 64-byte Ed25519 signature.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing.sign(message).to_bytes()
    }

    /// The X25519 secret matching [`PublicKey::agreement_key`].
    ///
    /// Derived the way Ed25519 derives its scalar: the first half of
    /// SHA-512 over the seed (clamping happens inside x25519).
    pub fn agreement_secret(&self) -> x25519_dalek::StaticSecret {
        let digest = Sha512::digest(self.signing.to_bytes());
        let mut scalar = [0u8; KEY_LEN];
        scalar.copy_from_slice(&digest[..KEY_LEN]);
        x25519_dalek::StaticSecret::from(scalar)
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyPair({:?})", self.public)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_roundtrip() {
        let keys = KeyPair::generate();
        let sig = keys.sign(b"origin claim");
        keys.public().verify(b"origin claim", &sig).unwrap();
    }

    #[test]
    fn wrong_message_fails_verification() {
        let keys = KeyPair::generate();
        let sig = keys.sign(b"original");
        assert_eq!(
            keys.public().verify(b"tampered", &sig),
            Err(CryptoError::BadSignature)
        );
    }

    #[test]
    fn wrong_key_fails_verification() {
        let alice = KeyPair::generate();
        let mallory = KeyPair::generate();
        let sig = mallory.sign(b"msg");
        assert!(alice.public().verify(b"msg", &sig).is_err());
    }

    #[test]
    fn agreement_keys_agree() {
        // The derived X25519 halves must produce the same shared secret
        // in both directions, otherwise sealing is broken.
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();

        let ab = alice
            .agreement_secret()
            .diffie_hellman(&bob.public().agreement_key().unwrap());
        let ba = bob
            .agreement_secret()
            .diffie_hellman(&alice.public().agreement_key().unwrap());

        assert_eq!(ab.as_bytes(), ba.as_bytes());
    }

    #[test]
    fn keypair_seed_roundtrip() {
        let keys = KeyPair::generate();
        let restored = KeyPair::from_seed(&keys.signing.to_bytes()).unwrap();
        assert_eq!(keys.public(), restored.public());
    }

    #[test]
    fn public_key_b64_roundtrip() {
        let keys = KeyPair::generate();
        let restored = PublicKey::from_b64(&keys.public().to_b64()).unwrap();
        assert_eq!(keys.public(), restored);
    }

    #[test]
    fn fingerprint_is_stable_and_distinct() {
        let a = KeyPair::generate().public();
        let b = KeyPair::generate().public();
        assert_eq!(a.fingerprint(), a.fingerprint());
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn bad_key_material_rejected() {
        assert!(PublicKey::from_bytes(&[0u8; 16]).is_err());
        assert!(PublicKey::from_b64("!!not-base64!!").is_err());
        assert!(KeyPair::from_seed(&[0u8; 31]).is_err());
    }
}
