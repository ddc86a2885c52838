//! The message envelope — the tagged unit exchanged on the wire.
//!
//! The envelope carries routing metadata in the clear (kind, origin,
//! target, request id) and the application content either as plaintext
//! control bytes (handshake only) or as a [`SealedPayload`] the relay
//! cannot open.

use crate::ids::PeerId;

/// Nonce length of the content cipher (XChaCha20-Poly1305).
pub const NONCE_LEN: usize = 24;

/// Length of a public-key fingerprint (BLAKE3).
pub const FINGERPRINT_LEN: usize = 32;

/// Length of an origin signature (Ed25519).
pub const SIGNATURE_LEN: usize = 64;

/// Where a message is headed.
///
/// The relay routes by this field alone; it never inspects payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// The directly connected endpoint (the server, from a peer's view).
    Server,
    /// A specific peer in the sender's room.
    Peer(PeerId),
    /// Every other peer in the sender's room.
    Broadcast,
}

/// One per-recipient sealed copy of the symmetric content key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySlot {
    /// Fingerprint of the recipient public key this slot is for.
    pub fingerprint: [u8; FINGERPRINT_LEN],
    /// The content key wrapped for that recipient.
    pub wrapped: Vec<u8>,
}

/// Hybrid-encrypted message body.
///
/// One symmetrically encrypted content blob plus one [`KeySlot`] per
/// recipient. Invariant: `slots` is never empty on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedPayload {
    /// Per-recipient sealed content keys.
    pub slots: Vec<KeySlot>,
    /// Nonce of the content cipher.
    pub nonce: [u8; NONCE_LEN],
    /// The encrypted content.
    pub ciphertext: Vec<u8>,
    /// Sender signature over the ciphertext (origin claim).
    pub signature: [u8; SIGNATURE_LEN],
}

/// Message body: cleartext control (handshake only) or sealed content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Unencrypted control bytes. Only valid during the handshake.
    Plain(Vec<u8>),
    /// Hybrid-encrypted content.
    Sealed(SealedPayload),
}

impl Payload {
    /// Whether this payload is sealed.
    pub fn is_sealed(&self) -> bool {
        matches!(self, Payload::Sealed(_))
    }
}

/// The six message shapes of the protocol.
///
/// `origin` is `None` for server-originated and pre-handshake traffic.
/// On inbound messages at the server the field is authoritative: the
/// server overwrites it with the authenticated peer id before routing.
/// Responses carry the original requester as `target` so the relay can
/// route them without per-request state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    /// A correlated request expecting exactly one reply.
    Request {
        id: u64,
        origin: Option<PeerId>,
        target: Target,
        payload: Payload,
    },
    /// Successful reply to a request.
    Response {
        id: u64,
        origin: Option<PeerId>,
        target: Target,
        payload: Payload,
    },
    /// Failed reply to a request; payload carries the error message.
    ResponseError {
        id: u64,
        origin: Option<PeerId>,
        target: Target,
        payload: Payload,
    },
    /// Fire-and-forget unicast.
    Notification {
        origin: Option<PeerId>,
        target: Target,
        payload: Payload,
    },
    /// Fire-and-forget room fanout.
    Broadcast {
        origin: Option<PeerId>,
        payload: Payload,
    },
    /// Out-of-band error report; payload carries the message.
    Error {
        origin: Option<PeerId>,
        payload: Payload,
    },
}

impl Envelope {
    /// Wire discriminator of this envelope.
    pub fn kind(&self) -> u8 {
        match self {
            Envelope::Request { .. } => 1,
            Envelope::Response { .. } => 2,
            Envelope::ResponseError { .. } => 3,
            Envelope::Notification { .. } => 4,
            Envelope::Broadcast { .. } => 5,
            Envelope::Error { .. } => 6,
        }
    }

    /// The claimed sender of this envelope.
    pub fn origin(&self) -> Option<PeerId> {
        match self {
            Envelope::Request { origin, .. }
            | Envelope::Response { origin, .. }
            | Envelope::ResponseError { origin, .. }
            | Envelope::Notification { origin, .. }
            | Envelope::Broadcast { origin, .. }
            | Envelope::Error { origin, .. } => *origin,
        }
    }

    /// Overwrite the sender. The server calls this with the
    /// authenticated peer id; the wire value is never trusted.
    pub fn set_origin(&mut self, value: Option<PeerId>) {
        match self {
            Envelope::Request { origin, .. }
            | Envelope::Response { origin, .. }
            | Envelope::ResponseError { origin, .. }
            | Envelope::Notification { origin, .. }
            | Envelope::Broadcast { origin, .. }
            | Envelope::Error { origin, .. } => *origin = value,
        }
    }

    /// Routing target, where the envelope carries one.
    ///
    /// `Broadcast` envelopes implicitly target the whole room and
    /// `Error` envelopes are point-to-point on the wire, so both
    /// return `None`.
    pub fn target(&self) -> Option<Target> {
        match self {
            Envelope::Request { target, .. }
            | Envelope::Response { target, .. }
            | Envelope::ResponseError { target, .. }
            | Envelope::Notification { target, .. } => Some(*target),
            Envelope::Broadcast { .. } | Envelope::Error { .. } => None,
        }
    }

    /// The message body.
    pub fn payload(&self) -> &Payload {
        match self {
            Envelope::Request { payload, .. }
            | Envelope::Response { payload, .. }
            | Envelope::ResponseError { payload, .. }
            | Envelope::Notification { payload, .. }
            | Envelope::Broadcast { payload, .. }
            | Envelope::Error { payload, .. } => payload,
        }
    }

    /// Whether the relay should fan this envelope out to the room.
    pub fn is_fanout(&self) -> bool {
        matches!(self, Envelope::Broadcast { .. })
            || self.target() == Some(Target::Broadcast)
    }
}
