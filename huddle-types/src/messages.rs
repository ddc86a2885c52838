//! Method names and parameter schemas of the built-in protocol.
//!
//! Application methods are open-ended (string-keyed, registered at
//! runtime); the methods here are the ones the server and client
//! libraries speak between themselves.

use crate::ids::{PeerId, RoomId};
use serde::{Deserialize, Serialize};

/// Built-in method names.
pub mod methods {
    /// Cleartext handshake request from a connecting peer.
    pub const PEER_INIT: &str = "peer.init";
    /// Server notification carrying the assigned peer identity.
    pub const PEER_INFO: &str = "peer.onInfo";
    /// Server request asking the host to admit a candidate.
    pub const PEER_JOIN_REQUEST: &str = "peer.onJoinRequest";
    /// Server notification to the joiner: admission complete, roster attached.
    pub const ROOM_JOINED: &str = "room.onJoined";
    /// Server notification to existing members: a peer was admitted.
    pub const ROOM_JOIN: &str = "room.onJoin";
    /// Server notification: a guest left the room.
    pub const ROOM_LEAVE: &str = "room.onLeave";
    /// Server notification: the room was torn down.
    pub const ROOM_CLOSE: &str = "room.onClose";
}

/// Public description of a peer, shared in rosters and join events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDescriptor {
    pub id: PeerId,
    pub name: String,
    pub email: Option<String>,
    /// URL-safe base64 Ed25519 public key.
    pub public_key: String,
    pub host: bool,
}

/// Parameters of `peer.init` (cleartext, first message on the wire).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitParams {
    /// Protocol version; mismatch fails the handshake.
    pub protocol: String,
    /// URL-safe base64 Ed25519 public key of the connecting peer.
    pub public_key: String,
    /// Workspace name, supplied by hosts when opening a room.
    pub workspace: Option<String>,
    /// Host-declared room privacy: a private room refuses guest join
    /// tokens.
    #[serde(default)]
    pub private: bool,
}

/// Result of `peer.init`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitAck {
    pub protocol: String,
    /// The peer id the server assigned to this connection.
    pub peer_id: PeerId,
    /// URL-safe base64 public key of the server endpoint.
    pub server_key: String,
}

/// Parameters of `peer.onInfo`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfoParams {
    pub peer: PeerDescriptor,
    pub room_id: RoomId,
}

/// A candidate awaiting host approval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinCandidate {
    pub name: String,
    pub email: Option<String>,
    /// URL-safe base64 public key of the candidate.
    pub public_key: String,
}

/// Parameters of `peer.onJoinRequest` (server → host).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequestParams {
    pub candidate: JoinCandidate,
}

/// Host's answer to `peer.onJoinRequest`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinReply {
    pub accept: bool,
    /// Workspace descriptor handed to approved joiners.
    pub workspace: Option<String>,
}

/// Parameters of `room.onJoined` (server → the admitted peer).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomJoinedParams {
    pub room_id: RoomId,
    pub workspace: String,
    /// Full roster including the host and the admitted peer itself.
    pub peers: Vec<PeerDescriptor>,
}

/// Parameters of `room.onJoin` (server → existing members).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomJoinParams {
    pub peer: PeerDescriptor,
}

/// Parameters of `room.onLeave`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomLeaveParams {
    pub peer_id: PeerId,
}

/// Parameters of `room.onClose`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomCloseParams {
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::{decode_value, encode_value};

    #[test]
    fn init_params_roundtrip() {
        let params = InitParams {
            protocol: crate::PROTOCOL_VERSION.to_string(),
            public_key: "abc".to_string(),
            workspace: Some("project".to_string()),
            private: false,
        };
        let bytes = encode_value(&params).unwrap();
        let back: InitParams = decode_value(&bytes).unwrap();
        assert_eq!(params, back);
    }

    #[test]
    fn roster_roundtrip() {
        let params = RoomJoinedParams {
            room_id: RoomId::random(),
            workspace: "ws".to_string(),
            peers: vec![PeerDescriptor {
                id: PeerId::random(),
                name: "alice".to_string(),
                email: None,
                public_key: "k".to_string(),
                host: true,
            }],
        };
        let bytes = encode_value(&params).unwrap();
        let back: RoomJoinedParams = decode_value(&bytes).unwrap();
        assert_eq!(params, back);
    }
}
