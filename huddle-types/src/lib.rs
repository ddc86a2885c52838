//! Wire types for the huddle collaboration protocol.
//!
//! This crate defines the vocabulary shared by every endpoint:
//! identifiers, the message envelope, the binary codec and the
//! method/parameter schemas exchanged between peers and the server.
//!
//! The envelope is the outer layer the relay sees. Application payloads
//! travel inside it as sealed ciphertext that only the addressed peers
//! can open (zero-knowledge relay).

pub mod call;
pub mod codec;
pub mod envelope;
pub mod error;
pub mod ids;
pub mod messages;

pub use call::Call;
pub use envelope::{Envelope, KeySlot, Payload, SealedPayload, Target};
pub use error::CodecError;
pub use ids::{PeerId, RoomId, UserId};

/// Protocol version exchanged in `peer.init`.
pub const PROTOCOL_VERSION: &str = "0.0.1";
