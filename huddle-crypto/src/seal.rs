//! Hybrid seal/open of message content.
//!
//! Sealing: encrypt the content once under the sender's symmetric
//! [`ContentKey`], then wrap that key once per recipient (ephemeral
//! X25519 agreement, HKDF-SHA256, XChaCha20-Poly1305). The sender signs
//! the ciphertext so receivers can verify the origin claim.
//!
//! Wrapped slot layout: `eph_pub:32 ‖ nonce:24 ‖ ct:48`.

use crate::cache::{OpenCache, SealCache};
use crate::error::CryptoError;
use crate::identity::{KeyPair, PublicKey};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use huddle_types::envelope::{KeySlot, SealedPayload, NONCE_LEN};
use sha2::Sha256;
use x25519_dalek::EphemeralSecret;
use zeroize::Zeroize;

/// Content key length (XChaCha20-Poly1305).
pub const KEY_SIZE: usize = 32;

/// Expected length of a wrapped content key slot.
const WRAPPED_LEN: usize = 32 + NONCE_LEN + KEY_SIZE + 16;

const SEAL_SALT: &[u8] = b"huddle-seal-v1";
const WRAP_INFO: &[u8] = b"key-wrap";

/// The per-sender symmetric content key.
///
/// Generated once per connection; the generation tag keys the seal
/// cache so a rotating sender invalidates its recipients' wraps.
pub struct ContentKey {
    bytes: [u8; KEY_SIZE],
    generation: u64,
}

impl ContentKey {
    /// Generate a fresh random key at generation zero.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        getrandom::getrandom(&mut bytes).expect("getrandom failed");
        Self {
            bytes,
            generation: 0,
        }
    }

    /// The generation tag of this key.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Drop for ContentKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ContentKey(gen {}, [REDACTED])", self.generation)
    }
}

/// Seal `content` for every recipient.
///
/// Cached wraps skip the asymmetric operation; the cache records each
/// fresh wrap as a miss, which is the observable asymmetric-op counter.
pub fn seal(
    content: &[u8],
    sender: &KeyPair,
    key: &ContentKey,
    recipients: &[PublicKey],
    cache: &mut SealCache,
) -> Result<SealedPayload, CryptoError> {
    if recipients.is_empty() {
        return Err(CryptoError::Seal("no recipients".to_string()));
    }

    let cipher = XChaCha20Poly1305::new_from_slice(&key.bytes)
        .map_err(|e| CryptoError::Seal(e.to_string()))?;
    let mut nonce = [0u8; NONCE_LEN];
    getrandom::getrandom(&mut nonce).expect("getrandom failed");
    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), content)
        .map_err(|_| CryptoError::Seal("aead encrypt failed".to_string()))?;

    let mut slots = Vec::with_capacity(recipients.len());
    for recipient in recipients {
        let fingerprint = recipient.fingerprint();
        let wrapped = match cache.get(&fingerprint, key.generation) {
            Some(hit) => hit,
            None => {
                let fresh = wrap(key, recipient)?;
                cache.insert(fingerprint, key.generation, fresh.clone());
                fresh
            }
        };
        slots.push(KeySlot {
            fingerprint: *fingerprint.as_bytes(),
            wrapped,
        });
    }

    let signature = sender.sign(&claim_digest(&nonce, &ciphertext));

    Ok(SealedPayload {
        slots,
        nonce,
        ciphertext,
        signature,
    })
}

/// Open a sealed payload addressed to `me`.
///
/// When the sender's public key is known the origin signature is
/// verified first; a mismatch fails with [`CryptoError::BadSignature`]
/// before any key material is touched.
pub fn open(
    payload: &SealedPayload,
    me: &KeyPair,
    sender: Option<&PublicKey>,
    cache: &mut OpenCache,
) -> Result<Vec<u8>, CryptoError> {
    if let Some(sender_key) = sender {
        sender_key.verify(
            &claim_digest(&payload.nonce, &payload.ciphertext),
            &payload.signature,
        )?;
    }

    let my_fingerprint = me.public().fingerprint();
    let slot = payload
        .slots
        .iter()
        .find(|slot| &slot.fingerprint == my_fingerprint.as_bytes())
        .ok_or(CryptoError::NoKeyForMe)?;

    let wrap_digest = *blake3::hash(&slot.wrapped).as_bytes();
    let sender_fingerprint = sender.map(|k| k.fingerprint());

    let key = match sender_fingerprint.and_then(|f| cache.get(&f, &wrap_digest)) {
        Some(hit) => hit,
        None => {
            let fresh = unwrap(&slot.wrapped, me)?;
            if let Some(f) = sender_fingerprint {
                cache.insert(f, wrap_digest, fresh);
            }
            fresh
        }
    };

    let cipher = XChaCha20Poly1305::new_from_slice(&key)
        .map_err(|_| CryptoError::Unauthenticated)?;
    cipher
        .decrypt(XNonce::from_slice(&payload.nonce), payload.ciphertext.as_ref())
        .map_err(|_| CryptoError::Unauthenticated)
}

/// Digest the origin signature covers.
fn claim_digest(nonce: &[u8; NONCE_LEN], ciphertext: &[u8]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(nonce);
    hasher.update(ciphertext);
    *hasher.finalize().as_bytes()
}

/// Wrap the content key for one recipient.
fn wrap(key: &ContentKey, recipient: &PublicKey) -> Result<Vec<u8>, CryptoError> {
    let ephemeral = EphemeralSecret::random_from_rng(rand::rngs::OsRng);
    let ephemeral_public = x25519_dalek::PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(&recipient.agreement_key()?);
    if !shared.was_contributory() {
        return Err(CryptoError::InvalidKey);
    }

    let wrap_key = derive_wrap_key(shared.as_bytes());
    let cipher = XChaCha20Poly1305::new_from_slice(&wrap_key)
        .map_err(|e| CryptoError::Seal(e.to_string()))?;
    let mut nonce = [0u8; NONCE_LEN];
    getrandom::getrandom(&mut nonce).expect("getrandom failed");
    let ct = cipher
        .encrypt(XNonce::from_slice(&nonce), key.bytes.as_ref())
        .map_err(|_| CryptoError::Seal("key wrap failed".to_string()))?;

    let mut out = Vec::with_capacity(WRAPPED_LEN);
    out.extend_from_slice(ephemeral_public.as_bytes());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ct);
    Ok(out)
}

/// Unwrap a slot with our private key.
fn unwrap(wrapped: &[u8], me: &KeyPair) -> Result<[u8; KEY_SIZE], CryptoError> {
    if wrapped.len() != WRAPPED_LEN {
        return Err(CryptoError::BadKey);
    }
    let mut ephemeral_public = [0u8; 32];
    ephemeral_public.copy_from_slice(&wrapped[..32]);
    let nonce = &wrapped[32..32 + NONCE_LEN];
    let ct = &wrapped[32 + NONCE_LEN..];

    let shared = me
        .agreement_secret()
        .diffie_hellman(&x25519_dalek::PublicKey::from(ephemeral_public));
    let wrap_key = derive_wrap_key(shared.as_bytes());

    let cipher =
        XChaCha20Poly1305::new_from_slice(&wrap_key).map_err(|_| CryptoError::BadKey)?;
    let key_bytes = cipher
        .decrypt(XNonce::from_slice(nonce), ct)
        .map_err(|_| CryptoError::BadKey)?;

    if key_bytes.len() != KEY_SIZE {
        return Err(CryptoError::BadKey);
    }
    let mut out = [0u8; KEY_SIZE];
    out.copy_from_slice(&key_bytes);
    Ok(out)
}

fn derive_wrap_key(shared: &[u8]) -> [u8; KEY_SIZE] {
    let hkdf = Hkdf::<Sha256>::new(Some(SEAL_SALT), shared);
    let mut out = [0u8; KEY_SIZE];
    hkdf.expand(WRAP_INFO, &mut out).expect("hkdf expand failed");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (KeyPair, ContentKey, SealCache, OpenCache) {
        (
            KeyPair::generate(),
            ContentKey::generate(),
            SealCache::new(),
            OpenCache::new(),
        )
    }

    #[test]
    fn every_recipient_recovers_the_content() {
        let (sender, key, mut seal_cache, _) = setup();
        let recipients: Vec<KeyPair> = (0..3).map(|_| KeyPair::generate()).collect();
        let public: Vec<PublicKey> = recipients.iter().map(|k| k.public()).collect();

        let sealed = seal(b"secret note", &sender, &key, &public, &mut seal_cache).unwrap();
        assert_eq!(sealed.slots.len(), 3);

        for recipient in &recipients {
            let mut cache = OpenCache::new();
            let content =
                open(&sealed, recipient, Some(&sender.public()), &mut cache).unwrap();
            assert_eq!(content, b"secret note");
        }
    }

    #[test]
    fn non_recipient_gets_no_key_for_me() {
        let (sender, key, mut seal_cache, mut open_cache) = setup();
        let recipient = KeyPair::generate();
        let outsider = KeyPair::generate();

        let sealed = seal(
            b"private",
            &sender,
            &key,
            &[recipient.public()],
            &mut seal_cache,
        )
        .unwrap();

        assert_eq!(
            open(&sealed, &outsider, Some(&sender.public()), &mut open_cache),
            Err(CryptoError::NoKeyForMe)
        );
    }

    #[test]
    fn tampered_ciphertext_is_unauthenticated() {
        let (sender, key, mut seal_cache, mut open_cache) = setup();
        let recipient = KeyPair::generate();

        let mut sealed = seal(b"x", &sender, &key, &[recipient.public()], &mut seal_cache)
            .unwrap();
        sealed.ciphertext[0] ^= 0xFF;

        // Signature catches the tamper first when the sender is known.
        assert_eq!(
            open(&sealed, &recipient, Some(&sender.public()), &mut open_cache),
            Err(CryptoError::BadSignature)
        );
        // Without an origin key the AEAD tag catches it.
        assert_eq!(
            open(&sealed, &recipient, None, &mut open_cache),
            Err(CryptoError::Unauthenticated)
        );
    }

    #[test]
    fn forged_signature_is_rejected() {
        let (sender, key, mut seal_cache, mut open_cache) = setup();
        let recipient = KeyPair::generate();
        let mallory = KeyPair::generate();

        let mut sealed = seal(b"x", &sender, &key, &[recipient.public()], &mut seal_cache)
            .unwrap();
        sealed.signature = mallory.sign(&claim_digest(&sealed.nonce, &sealed.ciphertext));

        assert_eq!(
            open(&sealed, &recipient, Some(&sender.public()), &mut open_cache),
            Err(CryptoError::BadSignature)
        );
    }

    #[test]
    fn corrupted_slot_is_bad_key() {
        let (sender, key, mut seal_cache, mut open_cache) = setup();
        let recipient = KeyPair::generate();

        let mut sealed = seal(b"x", &sender, &key, &[recipient.public()], &mut seal_cache)
            .unwrap();
        let last = sealed.slots[0].wrapped.len() - 1;
        sealed.slots[0].wrapped[last] ^= 0xFF;
        // Re-sign so the slot corruption is what fails.
        sealed.signature = sender.sign(&claim_digest(&sealed.nonce, &sealed.ciphertext));

        assert_eq!(
            open(&sealed, &recipient, Some(&sender.public()), &mut open_cache),
            Err(CryptoError::BadKey)
        );
    }

    #[test]
    fn zero_recipients_is_an_error() {
        let (sender, key, mut seal_cache, _) = setup();
        assert!(seal(b"x", &sender, &key, &[], &mut seal_cache).is_err());
    }

    #[test]
    fn seal_cache_skips_repeat_asymmetric_work() {
        let (sender, key, mut seal_cache, _) = setup();
        let recipients: Vec<PublicKey> =
            (0..2).map(|_| KeyPair::generate().public()).collect();

        seal(b"one", &sender, &key, &recipients, &mut seal_cache).unwrap();
        assert_eq!(seal_cache.misses(), 2);

        seal(b"two", &sender, &key, &recipients, &mut seal_cache).unwrap();
        // Same recipients, same generation: no new asymmetric ops.
        assert_eq!(seal_cache.misses(), 2);
        assert_eq!(seal_cache.hits(), 2);
    }

    #[test]
    fn cached_wraps_keep_decrypting() {
        let (sender, key, mut seal_cache, mut open_cache) = setup();
        let recipient = KeyPair::generate();

        let first = seal(b"a", &sender, &key, &[recipient.public()], &mut seal_cache)
            .unwrap();
        let second = seal(b"b", &sender, &key, &[recipient.public()], &mut seal_cache)
            .unwrap();
        // The second message reuses the cached wrap byte-for-byte.
        assert_eq!(first.slots[0].wrapped, second.slots[0].wrapped);

        open(&first, &recipient, Some(&sender.public()), &mut open_cache).unwrap();
        assert_eq!(open_cache.misses(), 1);
        open(&second, &recipient, Some(&sender.public()), &mut open_cache).unwrap();
        // Identical wrap: served from the open cache.
        assert_eq!(open_cache.misses(), 1);
        assert_eq!(open_cache.hits(), 1);
    }

    #[test]
    fn large_content_roundtrips() {
        let (sender, key, mut seal_cache, mut open_cache) = setup();
        let recipient = KeyPair::generate();
        let content = vec![0x42u8; 256 * 1024];

        let sealed = seal(&content, &sender, &key, &[recipient.public()], &mut seal_cache)
            .unwrap();
        let back = open(&sealed, &recipient, Some(&sender.public()), &mut open_cache)
            .unwrap();
        assert_eq!(back, content);
    }
}
