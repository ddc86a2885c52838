//! Rooms and their lifecycle.
//!
//! A room exists only while its host is connected. The host is the
//! source of truth for admission: every join goes through a
//! `peer.onJoinRequest` round-trip to the host, bounded by the
//! configured approval deadline. Losing the host tears the room down
//! and disconnects every guest.

use crate::peer::Peer;
use huddle_types::messages::{
    methods, JoinCandidate, JoinRequestParams, JoinReply, PeerDescriptor, RoomCloseParams,
    RoomJoinParams, RoomLeaveParams,
};
use huddle_types::{PeerId, RoomId, Target};
use crate::users::User;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// What a room allows.
#[derive(Debug, Clone, Copy)]
pub struct RoomPermissions {
    /// Whether guests may request join tokens at all.
    pub allow_guests: bool,
}

impl Default for RoomPermissions {
    fn default() -> Self {
        Self { allow_guests: true }
    }
}

/// Outcome of a join attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Host approved; carries the workspace descriptor.
    Approved { workspace: String },
    /// Host denied, failed to answer in time, or is gone.
    Denied,
}

#[derive(Debug)]
struct Members {
    host: Arc<Peer>,
    guests: HashMap<PeerId, Arc<Peer>>,
}

impl Members {
    /// Host first, then guests.
    fn all(&self) -> Vec<Arc<Peer>> {
        let mut members = Vec::with_capacity(1 + self.guests.len());
        members.push(self.host.clone());
        members.extend(self.guests.values().cloned());
        members
    }
}

/// One collaboration room.
#[derive(Debug)]
pub struct Room {
    pub id: RoomId,
    pub workspace: String,
    pub permissions: RoomPermissions,
    pub created_at: Instant,
    members: RwLock<Members>,
}

impl Room {
    /// The host peer.
    pub async fn host(&self) -> Arc<Peer> {
        self.members.read().await.host.clone()
    }

    /// Look up a member (host or guest) by id.
    pub async fn member(&self, id: &PeerId) -> Option<Arc<Peer>> {
        let members = self.members.read().await;
        if members.host.id == *id {
            return Some(members.host.clone());
        }
        members.guests.get(id).cloned()
    }

    /// All members, host first.
    pub async fn members(&self) -> Vec<Arc<Peer>> {
        self.members.read().await.all()
    }

    /// All members except one.
    pub async fn others(&self, except: &PeerId) -> Vec<Arc<Peer>> {
        self.members
            .read()
            .await
            .all()
            .into_iter()
            .filter(|peer| peer.id != *except)
            .collect()
    }

    /// Roster as shared with clients, host first.
    pub async fn descriptors(&self) -> Vec<PeerDescriptor> {
        self.members
            .read()
            .await
            .all()
            .iter()
            .map(|peer| peer.descriptor())
            .collect()
    }

    /// Number of guests (host excluded).
    pub async fn guest_count(&self) -> usize {
        self.members.read().await.guests.len()
    }
}

/// Catalogue of open rooms.
#[derive(Debug)]
pub struct RoomManager {
    rooms: DashMap<RoomId, Arc<Room>>,
    peer_rooms: DashMap<PeerId, RoomId>,
    join_timeout: Duration,
}

impl RoomManager {
    /// Create a manager with the given host-approval deadline.
    pub fn new(join_timeout: Duration) -> Self {
        Self {
            rooms: DashMap::new(),
            peer_rooms: DashMap::new(),
            join_timeout,
        }
    }

    /// Open a room with the connecting peer as host.
    pub fn create_room(
        &self,
        room_id: RoomId,
        host: Arc<Peer>,
        workspace: String,
        permissions: RoomPermissions,
    ) -> Arc<Room> {
        let room = Arc::new(Room {
            id: room_id,
            workspace,
            permissions,
            created_at: Instant::now(),
            members: RwLock::new(Members {
                host: host.clone(),
                guests: HashMap::new(),
            }),
        });
        self.rooms.insert(room_id, room.clone());
        self.peer_rooms.insert(host.id, room_id);
        tracing::info!(room = %room_id, host = %host.id, "room opened");
        room
    }

    /// Look up a room by id.
    pub fn room(&self, id: &RoomId) -> Option<Arc<Room>> {
        self.rooms.get(id).map(|entry| entry.clone())
    }

    /// The room a peer belongs to, if any.
    pub fn room_of(&self, peer_id: &PeerId) -> Option<Arc<Room>> {
        let room_id = *self.peer_rooms.get(peer_id)?;
        self.room(&room_id)
    }

    /// Ask the room's host to admit a candidate.
    ///
    /// Denial, a host error and an expired deadline all collapse into
    /// [`JoinOutcome::Denied`]; the guest never learns which.
    pub async fn join_request(&self, room: &Arc<Room>, candidate: &User) -> JoinOutcome {
        let host = room.host().await;
        let params = JoinRequestParams {
            candidate: JoinCandidate {
                name: candidate.name.clone(),
                email: candidate.email.clone(),
                public_key: candidate.public_key.to_b64(),
            },
        };

        let reply = host
            .connection
            .send_request_with_timeout::<_, JoinReply>(
                methods::PEER_JOIN_REQUEST,
                Target::Peer(host.id),
                &params,
                self.join_timeout,
            )
            .await;

        match reply {
            Ok(reply) if reply.accept => JoinOutcome::Approved {
                workspace: reply
                    .workspace
                    .unwrap_or_else(|| room.workspace.clone()),
            },
            Ok(_) => {
                tracing::info!(room = %room.id, candidate = %candidate.name, "host denied join");
                JoinOutcome::Denied
            }
            Err(e) => {
                tracing::info!(room = %room.id, "join approval failed: {e}");
                JoinOutcome::Denied
            }
        }
    }

    /// Add an approved guest and notify the existing members.
    pub async fn admit(&self, room: &Arc<Room>, guest: Arc<Peer>) {
        {
            let mut members = room.members.write().await;
            members.guests.insert(guest.id, guest.clone());
        }
        self.peer_rooms.insert(guest.id, room.id);

        let params = RoomJoinParams {
            peer: guest.descriptor(),
        };
        for member in room.others(&guest.id).await {
            if let Err(e) = member
                .connection
                .send_notification(methods::ROOM_JOIN, Target::Peer(member.id), &params)
                .await
            {
                tracing::debug!(member = %member.id, "failed to announce join: {e}");
            }
        }
        tracing::info!(room = %room.id, peer = %guest.id, "guest admitted");
    }

    /// Detach a peer. A departing host closes the room; a departing
    /// guest is announced to the remainder.
    pub async fn leave(&self, peer: &Arc<Peer>) {
        let Some((_, room_id)) = self.peer_rooms.remove(&peer.id) else {
            return;
        };
        let Some(room) = self.room(&room_id) else {
            return;
        };

        if peer.host {
            tracing::info!(room = %room_id, "host left, closing room");
            self.close_room(&room, "host disconnected").await;
            return;
        }

        {
            let mut members = room.members.write().await;
            members.guests.remove(&peer.id);
        }
        tracing::info!(room = %room_id, peer = %peer.id, "guest left");

        let params = RoomLeaveParams { peer_id: peer.id };
        for member in room.members().await {
            if let Err(e) = member
                .connection
                .send_notification(methods::ROOM_LEAVE, Target::Peer(member.id), &params)
                .await
            {
                tracing::debug!(member = %member.id, "failed to announce leave: {e}");
            }
        }
    }

    /// Tear a room down: notify guests, disconnect everyone, drop the
    /// room from the catalogue.
    pub async fn close_room(&self, room: &Arc<Room>, reason: &str) {
        self.rooms.remove(&room.id);
        let members = room.members().await;
        for member in &members {
            self.peer_rooms.remove(&member.id);
        }

        let params = RoomCloseParams {
            reason: reason.to_string(),
        };
        for member in members {
            if !member.host {
                let _ = member
                    .connection
                    .send_notification_now(
                        methods::ROOM_CLOSE,
                        Target::Peer(member.id),
                        &params,
                    )
                    .await;
            }
            member.connection.dispose().await;
        }
        tracing::info!(room = %room.id, reason, "room closed");
    }

    /// Number of open rooms.
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Number of peers attached to any room.
    pub fn peer_count(&self) -> usize {
        self.peer_rooms.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::users::User;
    use huddle_crypto::KeyPair;
    use huddle_net::{Connection, ConnectionConfig, PipeTransport};
    use huddle_types::UserId;

    fn manager() -> RoomManager {
        RoomManager::new(Duration::from_secs(1))
    }

    fn test_peer(name: &str, host: bool, room_id: RoomId) -> (Arc<Peer>, PipeTransport) {
        let keys = KeyPair::generate();
        let (ours, theirs) = PipeTransport::pair();
        let connection = Connection::new(keys.clone(), Arc::new(ours), ConnectionConfig::default());
        let id = PeerId::random();
        connection.set_remote(Some(id), keys.public());
        connection.mark_ready();
        let peer = Arc::new(Peer {
            id,
            user: User {
                id: UserId::random(),
                name: name.to_string(),
                email: None,
                public_key: keys.public(),
            },
            host,
            room_id,
            connection,
        });
        (peer, theirs)
    }

    #[tokio::test]
    async fn create_room_indexes_the_host() {
        let rooms = manager();
        let room_id = RoomId::random();
        let (host, _wire) = test_peer("host", true, room_id);

        let room = rooms.create_room(room_id, host.clone(), "ws".to_string(), Default::default());

        assert_eq!(rooms.room_count(), 1);
        assert_eq!(rooms.peer_count(), 1);
        assert_eq!(rooms.room_of(&host.id).unwrap().id, room.id);
        assert_eq!(room.host().await.id, host.id);
        assert_eq!(room.guest_count().await, 0);
    }

    #[tokio::test]
    async fn roster_lists_the_host_first_and_exactly_once() {
        let rooms = manager();
        let room_id = RoomId::random();
        let (host, _hw) = test_peer("host", true, room_id);
        let (guest, _gw) = test_peer("guest", false, room_id);

        let room = rooms.create_room(room_id, host.clone(), "ws".to_string(), Default::default());
        rooms.admit(&room, guest.clone()).await;

        let roster = room.descriptors().await;
        assert_eq!(roster.len(), 2);
        assert!(roster[0].host);
        assert_eq!(roster[0].id, host.id);
        assert_eq!(roster.iter().filter(|peer| peer.host).count(), 1);
    }

    #[tokio::test]
    async fn admit_and_leave_keep_the_indexes_consistent() {
        let rooms = manager();
        let room_id = RoomId::random();
        let (host, _hw) = test_peer("host", true, room_id);
        let (guest, _gw) = test_peer("guest", false, room_id);

        let room = rooms.create_room(room_id, host.clone(), "ws".to_string(), Default::default());
        rooms.admit(&room, guest.clone()).await;
        assert_eq!(room.guest_count().await, 1);
        assert_eq!(rooms.peer_count(), 2);
        assert!(room.member(&guest.id).await.is_some());

        rooms.leave(&guest).await;
        assert_eq!(room.guest_count().await, 0);
        assert_eq!(rooms.peer_count(), 1);
        assert!(room.member(&guest.id).await.is_none());
        // The room survives its guests.
        assert_eq!(rooms.room_count(), 1);
    }

    #[tokio::test]
    async fn host_leave_closes_the_room_and_disconnects_guests() {
        let rooms = manager();
        let room_id = RoomId::random();
        let (host, _hw) = test_peer("host", true, room_id);
        let (guest, _gw) = test_peer("guest", false, room_id);

        let room = rooms.create_room(room_id, host.clone(), "ws".to_string(), Default::default());
        rooms.admit(&room, guest.clone()).await;

        rooms.leave(&host).await;

        assert_eq!(rooms.room_count(), 0);
        assert_eq!(rooms.peer_count(), 0);
        assert!(guest.connection.is_disposed());
        assert!(host.connection.is_disposed());
    }

    #[tokio::test]
    async fn leave_of_unknown_peer_is_a_noop() {
        let rooms = manager();
        let (stranger, _wire) = test_peer("stranger", false, RoomId::random());
        rooms.leave(&stranger).await;
        assert_eq!(rooms.room_count(), 0);
    }

    #[tokio::test]
    async fn peers_are_in_at_most_one_room() {
        let rooms = manager();
        let room_id = RoomId::random();
        let (host, _hw) = test_peer("host", true, room_id);
        rooms.create_room(room_id, host.clone(), "ws".to_string(), Default::default());

        let other = RoomId::random();
        assert!(rooms.room(&other).is_none());
        assert_eq!(rooms.room_of(&host.id).unwrap().id, room_id);
    }
}
