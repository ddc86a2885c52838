//! The collaboration server context and the join handshake.
//!
//! [`ServerContext`] is the root of the explicit wiring: it owns the
//! singletons (user directory, credentials, rooms, limits, relay) and
//! every per-peer object is built from it. [`accept_transport`] runs
//! the server side of the handshake: redeemed join grant → `peer.init`
//! → `peer.onInfo` → (host approval for guests) → admission → ready.

use crate::config::Config;
use crate::credentials::{CredentialsManager, JoinGrant};
use crate::error::{AuthError, Result, ServerError};
use crate::limits::RateLimits;
use crate::peer::Peer;
use crate::relay::MessageRelay;
use crate::rooms::{JoinOutcome, RoomManager, RoomPermissions};
use crate::users::UserDirectory;
use huddle_crypto::{KeyPair, PublicKey};
use huddle_net::{Connection, ConnectionConfig, Transport};
use huddle_types::messages::{
    methods, InitAck, InitParams, PeerInfoParams, RoomJoinedParams,
};
use huddle_types::{PeerId, Target, PROTOCOL_VERSION};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::oneshot;

/// Root server state; all HTTP handlers and handshakes borrow from it.
pub struct ServerContext {
    config: Config,
    keys: KeyPair,
    pub users: UserDirectory,
    pub credentials: Arc<CredentialsManager>,
    pub rooms: Arc<RoomManager>,
    pub limits: RateLimits,
    relay: Arc<MessageRelay>,
}

impl std::fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerContext")
            .field("rooms", &self.rooms.room_count())
            .field("users", &self.users.len())
            .finish_non_exhaustive()
    }
}

impl ServerContext {
    /// Build the server from configuration, generating a fresh server
    /// identity keypair.
    pub fn new(config: Config) -> Arc<Self> {
        let rooms = Arc::new(RoomManager::new(config.protocol.join_approval_timeout()));
        Arc::new(Self {
            keys: KeyPair::generate(),
            users: UserDirectory::new(),
            credentials: Arc::new(CredentialsManager::new(&config.tokens)),
            limits: RateLimits::new(&config.limits),
            relay: Arc::new(MessageRelay::new(rooms.clone())),
            rooms,
            config,
        })
    }

    /// The server configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The server endpoint's identity keypair.
    pub fn identity(&self) -> &KeyPair {
        &self.keys
    }

    /// Run the server side of the join handshake over an accepted
    /// transport, then hand the connection to the relay.
    pub async fn accept_transport(
        self: &Arc<Self>,
        transport: Arc<dyn Transport>,
        grant: JoinGrant,
    ) -> Result<()> {
        let user = self
            .users
            .get(&grant.user_id)
            .ok_or(AuthError::InvalidToken)?;

        let connection = Connection::new(
            self.keys.clone(),
            transport,
            ConnectionConfig {
                request_timeout: self.config.protocol.request_timeout(),
            },
        );
        let peer_id = PeerId::random();

        // peer.init gate: the handler validates and reports back here.
        let (init_tx, init_rx) = oneshot::channel::<(Option<String>, bool)>();
        let init_gate = Arc::new(StdMutex::new(Some(init_tx)));
        let expected_key = user.public_key;
        let server_key = self.keys.public().to_b64();
        {
            let gate = init_gate.clone();
            let conn_for_handler = connection.clone();
            connection.on_request(methods::PEER_INIT, move |_origin, params: InitParams| {
                let conn = conn_for_handler.clone();
                let gate = gate.clone();
                let server_key = server_key.clone();
                async move {
                    if params.protocol != PROTOCOL_VERSION {
                        return Err(format!(
                            "protocol version mismatch: client {}, server {}",
                            params.protocol, PROTOCOL_VERSION
                        ));
                    }
                    let key = PublicKey::from_b64(&params.public_key)
                        .map_err(|_| "invalid public key".to_string())?;
                    if key != expected_key {
                        return Err("public key does not match authenticated user".to_string());
                    }
                    conn.set_remote(Some(peer_id), key);
                    if let Some(gate) = gate.lock().unwrap().take() {
                        let _ = gate.send((params.workspace, params.private));
                    }
                    Ok(InitAck {
                        protocol: PROTOCOL_VERSION.to_string(),
                        peer_id,
                        server_key,
                    })
                }
            });
        }
        connection.begin();

        let handshake = tokio::time::timeout(
            self.config.protocol.handshake_timeout(),
            init_rx,
        )
        .await;
        let (workspace, private) = match handshake {
            Ok(Ok(outcome)) => outcome,
            _ => {
                tracing::info!("connection dropped: peer.init not completed in time");
                connection.dispose().await;
                return Err(ServerError::Handshake(
                    "peer.init not received".to_string(),
                ));
            }
        };

        let peer = Arc::new(Peer {
            id: peer_id,
            user: user.clone(),
            host: grant.host,
            room_id: grant.room_id,
            connection: connection.clone(),
        });

        // Detach from the room when the transport goes away.
        {
            let ctx = self.clone();
            let peer = peer.clone();
            connection.on_disconnect(move || {
                let ctx = ctx.clone();
                let peer = peer.clone();
                tokio::spawn(async move {
                    ctx.rooms.leave(&peer).await;
                });
            });
        }

        connection
            .send_notification_now(
                methods::PEER_INFO,
                Target::Peer(peer_id),
                &PeerInfoParams {
                    peer: peer.descriptor(),
                    room_id: grant.room_id,
                },
            )
            .await?;

        if grant.host {
            self.attach_host(peer, workspace, private).await
        } else {
            self.attach_guest(peer).await
        }
    }

    async fn attach_host(
        self: &Arc<Self>,
        peer: Arc<Peer>,
        workspace: Option<String>,
        private: bool,
    ) -> Result<()> {
        let workspace =
            workspace.unwrap_or_else(|| format!("{}'s workspace", peer.user.name));
        let room = self.rooms.create_room(
            peer.room_id,
            peer.clone(),
            workspace.clone(),
            RoomPermissions {
                allow_guests: !private,
            },
        );
        peer.connection.set_relay(self.relay.clone());
        peer.connection.mark_ready();

        let joined = RoomJoinedParams {
            room_id: room.id,
            workspace,
            peers: room.descriptors().await,
        };
        if let Err(e) = peer
            .connection
            .send_notification_now(methods::ROOM_JOINED, Target::Peer(peer.id), &joined)
            .await
        {
            self.rooms.leave(&peer).await;
            peer.connection.dispose().await;
            return Err(e.into());
        }

        // The transport can die between room creation and here; the
        // disconnect hook may have fired before the room existed.
        if peer.connection.is_disposed() {
            self.rooms.leave(&peer).await;
        }
        tracing::info!(peer = %peer.id, room = %peer.room_id, "host connected");
        Ok(())
    }

    async fn attach_guest(self: &Arc<Self>, peer: Arc<Peer>) -> Result<()> {
        let Some(room) = self.rooms.room(&peer.room_id) else {
            let _ = peer.connection.send_error("room closed").await;
            peer.connection.dispose().await;
            return Err(AuthError::RoomNotFound.into());
        };

        match self.rooms.join_request(&room, &peer.user).await {
            JoinOutcome::Approved { workspace } => {
                if self.rooms.room(&room.id).is_none() {
                    let _ = peer.connection.send_error("room closed").await;
                    peer.connection.dispose().await;
                    return Err(AuthError::RoomNotFound.into());
                }
                self.rooms.admit(&room, peer.clone()).await;
                peer.connection.set_relay(self.relay.clone());
                peer.connection.mark_ready();

                let joined = RoomJoinedParams {
                    room_id: room.id,
                    workspace,
                    peers: room.descriptors().await,
                };
                if let Err(e) = peer
                    .connection
                    .send_notification_now(
                        methods::ROOM_JOINED,
                        Target::Peer(peer.id),
                        &joined,
                    )
                    .await
                {
                    self.rooms.leave(&peer).await;
                    peer.connection.dispose().await;
                    return Err(e.into());
                }
                if peer.connection.is_disposed() {
                    self.rooms.leave(&peer).await;
                }
                tracing::info!(peer = %peer.id, room = %room.id, "guest connected");
                Ok(())
            }
            JoinOutcome::Denied => {
                tracing::info!(peer = %peer.id, room = %room.id, "join denied");
                let _ = peer
                    .connection
                    .send_error("unauthorized: join request denied")
                    .await;
                peer.connection.dispose().await;
                Ok(())
            }
        }
    }
}
