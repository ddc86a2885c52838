//! The server-side handle for one connected client.

use crate::users::User;
use huddle_crypto::PublicKey;
use huddle_net::Connection;
use huddle_types::messages::PeerDescriptor;
use huddle_types::{PeerId, RoomId};

/// One connected peer: identity, room membership and its connection.
///
/// Exactly one peer exists per connection; the peer lives for
/// min(connection lifetime, room lifetime).
#[derive(Debug, Clone)]
pub struct Peer {
    pub id: PeerId,
    pub user: User,
    pub host: bool,
    pub room_id: RoomId,
    pub connection: Connection,
}

impl Peer {
    /// The peer's long-term public key (its user's key, verified
    /// during the handshake).
    pub fn public_key(&self) -> PublicKey {
        self.user.public_key
    }

    /// Public description shared with room members.
    pub fn descriptor(&self) -> PeerDescriptor {
        PeerDescriptor {
            id: self.id,
            name: self.user.name.clone(),
            email: self.user.email.clone(),
            public_key: self.user.public_key.to_b64(),
            host: self.host,
        }
    }
}
