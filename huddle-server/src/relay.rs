//! The message relay.
//!
//! Routes envelopes between peers of a room without ever decrypting
//! them: the sender pre-sealed the content key for every recipient, so
//! forwarding is byte-for-byte. By the time an envelope reaches the
//! relay its `origin` has already been rewritten to the authenticated
//! peer id by the connection core.

use crate::rooms::RoomManager;
use async_trait::async_trait;
use huddle_net::RelaySink;
use huddle_types::{Envelope, Target};
use std::sync::Arc;

/// The routing hook installed on every admitted peer connection.
#[derive(Debug)]
pub struct MessageRelay {
    rooms: Arc<RoomManager>,
}

impl MessageRelay {
    /// Create a relay over the room catalogue.
    pub fn new(rooms: Arc<RoomManager>) -> Self {
        Self { rooms }
    }
}

#[async_trait]
impl RelaySink for MessageRelay {
    async fn route(&self, envelope: &Envelope) -> bool {
        // Unauthenticated or roomless senders have nothing to route to.
        let Some(origin) = envelope.origin() else {
            return false;
        };
        let Some(room) = self.rooms.room_of(&origin) else {
            return false;
        };

        if envelope.is_fanout() {
            for member in room.others(&origin).await {
                if let Err(e) = member.connection.forward(envelope).await {
                    tracing::debug!(member = %member.id, "fanout forward failed: {e}");
                }
            }
            return true;
        }

        let Some(Target::Peer(destination)) = envelope.target() else {
            return false;
        };

        match room.member(&destination).await {
            Some(member) if destination != origin => {
                if let Err(e) = member.connection.forward(envelope).await {
                    tracing::debug!(member = %member.id, "forward failed: {e}");
                }
            }
            _ => {
                tracing::debug!(%origin, %destination, "dropping envelope: no such recipient");
                if let Some(sender) = room.member(&origin).await {
                    let _ = sender.connection.send_error("no such recipient").await;
                }
            }
        }
        true
    }
}
