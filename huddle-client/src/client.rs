//! The join handshake and the live session facade.

use crate::api::ApiClient;
use crate::error::ClientError;
use crate::transport::WsTransport;
use huddle_crypto::{KeyPair, PublicKey};
use huddle_net::{Connection, ConnectionConfig, ConnectionError, Emitter, Transport};
use huddle_types::messages::{
    methods, InitAck, InitParams, JoinCandidate, JoinReply, JoinRequestParams, PeerDescriptor,
    PeerInfoParams, RoomCloseParams, RoomJoinParams, RoomJoinedParams, RoomLeaveParams,
};
use huddle_types::{PeerId, RoomId, Target, PROTOCOL_VERSION};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;
use tokio::sync::mpsc;

/// Async callback deciding a guest's admission (host side).
pub type JoinDecider =
    Arc<dyn Fn(JoinCandidate) -> Pin<Box<dyn Future<Output = JoinReply> + Send>> + Send + Sync>;

/// Stock admission policies.
pub mod deciders {
    use super::*;

    /// Admit everyone.
    pub fn approve_all() -> JoinDecider {
        Arc::new(|_candidate| {
            Box::pin(async {
                JoinReply {
                    accept: true,
                    workspace: None,
                }
            })
        })
    }

    /// Refuse everyone. The default when no decider is configured.
    pub fn deny_all() -> JoinDecider {
        Arc::new(|_candidate| {
            Box::pin(async {
                JoinReply {
                    accept: false,
                    workspace: None,
                }
            })
        })
    }
}

/// Options for [`join`].
#[derive(Clone)]
pub struct JoinOptions {
    /// Workspace name declared by hosts.
    pub workspace: Option<String>,
    /// Host-declared room privacy (refuse guest join tokens).
    pub private: bool,
    /// Request deadline for the connection.
    pub request_timeout: Duration,
    /// How long to wait for admission. Slightly above the server's
    /// host-approval deadline so its denial arrives first.
    pub join_timeout: Duration,
    /// Admission policy when this peer hosts a room.
    pub join_decider: Option<JoinDecider>,
}

impl Default for JoinOptions {
    fn default() -> Self {
        Self {
            workspace: None,
            private: false,
            request_timeout: Duration::from_secs(60),
            join_timeout: Duration::from_secs(150),
            join_decider: None,
        }
    }
}

impl std::fmt::Debug for JoinOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JoinOptions")
            .field("workspace", &self.workspace)
            .field("private", &self.private)
            .field("request_timeout", &self.request_timeout)
            .field("join_timeout", &self.join_timeout)
            .field("join_decider", &self.join_decider.is_some())
            .finish()
    }
}

#[derive(Default)]
struct SessionShared {
    peers: StdRwLock<HashMap<PeerId, PeerDescriptor>>,
    peer_joined: Emitter<PeerDescriptor>,
    peer_left: Emitter<PeerId>,
    room_closed: Emitter<String>,
}

enum JoinSignal {
    Joined(RoomJoinedParams),
    Refused(String),
    Disconnected,
}

/// A live room membership.
pub struct Session {
    connection: Connection,
    peer_id: PeerId,
    room_id: RoomId,
    workspace: String,
    shared: Arc<SessionShared>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("peer_id", &self.peer_id)
            .field("room_id", &self.room_id)
            .field("workspace", &self.workspace)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Our assigned peer id.
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// The room we belong to.
    pub fn room_id(&self) -> RoomId {
        self.room_id
    }

    /// Workspace descriptor delivered at admission.
    pub fn workspace(&self) -> &str {
        &self.workspace
    }

    /// The other members of the room.
    pub fn peers(&self) -> Vec<PeerDescriptor> {
        self.shared.peers.read().unwrap().values().cloned().collect()
    }

    /// The underlying connection core.
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Send a request to one peer.
    pub async fn request<P: Serialize, R: DeserializeOwned>(
        &self,
        method: &str,
        peer: PeerId,
        params: &P,
    ) -> Result<R, ConnectionError> {
        self.connection
            .send_request(method, Target::Peer(peer), params)
            .await
    }

    /// Send a notification to one peer.
    pub async fn notify<P: Serialize>(
        &self,
        method: &str,
        peer: PeerId,
        params: &P,
    ) -> Result<(), ConnectionError> {
        self.connection
            .send_notification(method, Target::Peer(peer), params)
            .await
    }

    /// Broadcast to the whole room.
    pub async fn broadcast<P: Serialize>(
        &self,
        method: &str,
        params: &P,
    ) -> Result<(), ConnectionError> {
        self.connection.send_broadcast(method, params).await
    }

    /// Register a request handler.
    pub fn on_request<P, R, F, Fut>(&self, method: &str, handler: F)
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + 'static,
        F: Fn(Option<PeerId>, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, String>> + Send + 'static,
    {
        self.connection.on_request(method, handler);
    }

    /// Register a notification handler.
    pub fn on_notification<P, F, Fut>(&self, method: &str, handler: F)
    where
        P: DeserializeOwned + Send + 'static,
        F: Fn(Option<PeerId>, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.connection.on_notification(method, handler);
    }

    /// Register a broadcast handler.
    pub fn on_broadcast<P, F, Fut>(&self, method: &str, handler: F)
    where
        P: DeserializeOwned + Send + 'static,
        F: Fn(Option<PeerId>, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.connection.on_broadcast(method, handler);
    }

    /// Subscribe to peers being admitted.
    pub fn on_peer_joined(&self, f: impl Fn(&PeerDescriptor) + Send + Sync + 'static) {
        self.shared.peer_joined.subscribe(f);
    }

    /// Subscribe to peers leaving.
    pub fn on_peer_left(&self, f: impl Fn(&PeerId) + Send + Sync + 'static) {
        self.shared.peer_left.subscribe(f);
    }

    /// Subscribe to room teardown.
    pub fn on_room_closed(&self, f: impl Fn(&str) + Send + Sync + 'static) {
        self.shared
            .room_closed
            .subscribe(move |reason: &String| f(reason));
    }

    /// Whether the underlying connection is gone.
    pub fn is_closed(&self) -> bool {
        self.connection.is_disposed()
    }

    /// Leave the room and drop the connection.
    pub async fn close(&self) {
        self.connection.dispose().await;
    }
}

/// Run the client side of the join handshake over an established
/// transport and return the admitted session.
pub async fn join(
    transport: Arc<dyn Transport>,
    keys: KeyPair,
    options: JoinOptions,
) -> Result<Session, ClientError> {
    let connection = Connection::new(
        keys,
        transport,
        ConnectionConfig {
            request_timeout: options.request_timeout,
        },
    );
    let shared = Arc::new(SessionShared::default());
    let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();

    install_handlers(&connection, &shared, &signal_tx, &options);
    connection.begin();

    // Step: peer.init (cleartext control).
    let init = InitParams {
        protocol: PROTOCOL_VERSION.to_string(),
        public_key: connection.public_key().to_b64(),
        workspace: options.workspace.clone(),
        private: options.private,
    };
    let ack: InitAck = match connection.handshake_request(methods::PEER_INIT, &init).await {
        Ok(ack) => ack,
        Err(ConnectionError::Remote(message)) if message.contains("version mismatch") => {
            connection.dispose().await;
            return Err(ClientError::VersionMismatch(message));
        }
        Err(e) => {
            connection.dispose().await;
            return Err(e.into());
        }
    };
    if ack.protocol != PROTOCOL_VERSION {
        connection.dispose().await;
        return Err(ClientError::VersionMismatch(format!(
            "server speaks {}",
            ack.protocol
        )));
    }
    let server_key = PublicKey::from_b64(&ack.server_key)
        .map_err(|_| ClientError::Protocol("unparseable server key"))?;
    connection.set_remote(None, server_key);
    connection.set_local_id(ack.peer_id);

    // Step: await admission (room.onJoined), denial or disconnect.
    let admission = tokio::time::timeout(options.join_timeout, async {
        while let Some(signal) = signal_rx.recv().await {
            match signal {
                JoinSignal::Joined(params) => return Ok(params),
                JoinSignal::Refused(message) => {
                    return Err(ClientError::Unauthorized(message))
                }
                JoinSignal::Disconnected => return Err(ClientError::Disconnected),
            }
        }
        Err(ClientError::Disconnected)
    })
    .await;

    let joined = match admission {
        Ok(Ok(params)) => params,
        Ok(Err(e)) => {
            connection.dispose().await;
            return Err(e);
        }
        Err(_) => {
            connection.dispose().await;
            return Err(ClientError::Timeout);
        }
    };

    tracing::info!(peer = %ack.peer_id, room = %joined.room_id, "joined room");
    Ok(Session {
        connection,
        peer_id: ack.peer_id,
        room_id: joined.room_id,
        workspace: joined.workspace.clone(),
        shared,
    })
}

fn install_handlers(
    connection: &Connection,
    shared: &Arc<SessionShared>,
    signal_tx: &mpsc::UnboundedSender<JoinSignal>,
    options: &JoinOptions,
) {
    // peer.onInfo: our assigned identity.
    {
        let conn = connection.clone();
        connection.on_notification(
            methods::PEER_INFO,
            move |_origin, params: PeerInfoParams| {
                conn.set_local_id(params.peer.id);
                async {}
            },
        );
    }

    // room.onJoined: roster delivery completes the handshake.
    {
        let conn = connection.clone();
        let shared = shared.clone();
        let tx = signal_tx.clone();
        connection.on_notification(
            methods::ROOM_JOINED,
            move |_origin, params: RoomJoinedParams| {
                let myself = conn.local_id();
                let mut entries = Vec::new();
                {
                    let mut peers = shared.peers.write().unwrap();
                    peers.clear();
                    for peer in &params.peers {
                        if Some(peer.id) == myself {
                            continue;
                        }
                        match PublicKey::from_b64(&peer.public_key) {
                            Ok(key) => {
                                entries.push((peer.id, key));
                                peers.insert(peer.id, peer.clone());
                            }
                            Err(_) => {
                                tracing::warn!(peer = %peer.id, "roster entry with bad key")
                            }
                        }
                    }
                }
                conn.set_peers(entries);
                conn.mark_ready();
                let _ = tx.send(JoinSignal::Joined(params));
                async {}
            },
        );
    }

    // room.onJoin: a peer was admitted.
    {
        let conn = connection.clone();
        let shared = shared.clone();
        connection.on_notification(methods::ROOM_JOIN, move |_origin, params: RoomJoinParams| {
            match PublicKey::from_b64(&params.peer.public_key) {
                Ok(key) => {
                    conn.add_peer(params.peer.id, key);
                    shared
                        .peers
                        .write()
                        .unwrap()
                        .insert(params.peer.id, params.peer.clone());
                    shared.peer_joined.emit(&params.peer);
                }
                Err(_) => tracing::warn!(peer = %params.peer.id, "join event with bad key"),
            }
            async {}
        });
    }

    // room.onLeave: a guest departed.
    {
        let conn = connection.clone();
        let shared = shared.clone();
        connection.on_notification(
            methods::ROOM_LEAVE,
            move |_origin, params: RoomLeaveParams| {
                conn.remove_peer(&params.peer_id);
                shared.peers.write().unwrap().remove(&params.peer_id);
                shared.peer_left.emit(&params.peer_id);
                async {}
            },
        );
    }

    // room.onClose: the room is gone; so is our connection.
    {
        let conn = connection.clone();
        let shared = shared.clone();
        connection.on_notification(
            methods::ROOM_CLOSE,
            move |_origin, params: RoomCloseParams| {
                tracing::info!(reason = %params.reason, "room closed");
                shared.room_closed.emit(&params.reason);
                let conn = conn.clone();
                async move {
                    conn.dispose().await;
                }
            },
        );
    }

    // peer.onJoinRequest: we are hosting and must decide.
    {
        let decider = options
            .join_decider
            .clone()
            .unwrap_or_else(deciders::deny_all);
        connection.on_request(
            methods::PEER_JOIN_REQUEST,
            move |_origin, params: JoinRequestParams| {
                let decision = decider(params.candidate);
                async move { Ok::<JoinReply, String>(decision.await) }
            },
        );
    }

    // Admission failure paths.
    {
        let tx = signal_tx.clone();
        connection.on_error(move |message| {
            let _ = tx.send(JoinSignal::Refused(message.to_string()));
        });
    }
    {
        let tx = signal_tx.clone();
        connection.on_disconnect(move || {
            let _ = tx.send(JoinSignal::Disconnected);
        });
    }
}

/// Convenience wrapper running the whole flow: login, ticket,
/// websocket, handshake.
#[derive(Debug, Clone)]
pub struct CollabClient {
    api: ApiClient,
}

impl CollabClient {
    /// Create a client for a server base URL.
    pub fn new(base_url: &str) -> Self {
        Self {
            api: ApiClient::new(base_url),
        }
    }

    /// The underlying API client.
    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    /// Log in, open a fresh room and host it.
    pub async fn host_room(
        &self,
        name: &str,
        email: Option<&str>,
        keys: KeyPair,
        options: JoinOptions,
    ) -> Result<Session, ClientError> {
        let login = self.api.login(name, email, &keys.public()).await?;
        let ticket = self.api.create_session(&login).await?;
        let transport = WsTransport::connect(&self.api.join_url(&ticket.token)).await?;
        join(Arc::new(transport), keys, options).await
    }

    /// Log in and join an existing room as guest.
    pub async fn join_room(
        &self,
        name: &str,
        email: Option<&str>,
        keys: KeyPair,
        room_id: &RoomId,
        options: JoinOptions,
    ) -> Result<Session, ClientError> {
        let login = self.api.login(name, email, &keys.public()).await?;
        let ticket = self.api.join_session(&login, room_id).await?;
        let transport = WsTransport::connect(&self.api.join_url(&ticket.token)).await?;
        join(Arc::new(transport), keys, options).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stock_deciders_answer_as_named() {
        let candidate = JoinCandidate {
            name: "guest".to_string(),
            email: None,
            public_key: "k".to_string(),
        };

        assert!(deciders::approve_all()(candidate.clone()).await.accept);
        assert!(!deciders::deny_all()(candidate).await.accept);
    }

    #[test]
    fn join_options_default_deadlines() {
        let options = JoinOptions::default();
        assert_eq!(options.request_timeout, Duration::from_secs(60));
        assert!(options.join_timeout > Duration::from_secs(120));
        assert!(options.join_decider.is_none());
        assert!(!options.private);
    }
}
