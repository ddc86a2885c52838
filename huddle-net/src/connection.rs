//! The connection core.
//!
//! One [`Connection`] drives one transport: a reader task drains
//! inbound frames and settles responses; a single worker task runs
//! handlers in arrival order so a slow handler never blocks response
//! correlation. Outbound requests are correlated by a monotonically
//! increasing id and bounded by a timeout.
//!
//! Lifecycle: `Constructing → Ready → Disposed`. Cleartext handshake
//! traffic bypasses the ready barrier; sealed application traffic —
//! including handler replies to sealed requests — waits behind it until
//! the owner calls [`Connection::mark_ready`]. Disposal is idempotent,
//! fails every pending request with `Disconnected` and clears all
//! handlers and subscribers.

use crate::error::ConnectionError;
use crate::event::Emitter;
use crate::transport::Transport;
use async_trait::async_trait;
use huddle_crypto::{ContentKey, KeyPair, OpenCache, PublicKey, SealCache};
use huddle_types::call::{decode_value, encode_value};
use huddle_types::{codec, Call, Envelope, Payload, PeerId, Target};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

/// Hook the server installs to route peer-addressed envelopes.
///
/// The connection rewrites `origin` to the authenticated peer id before
/// the sink sees the envelope. Returning `true` consumes the envelope;
/// `false` hands it back for local dispatch.
#[async_trait]
pub trait RelaySink: Send + Sync {
    async fn route(&self, envelope: &Envelope) -> bool;
}

/// Tunables for one connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Deadline for outbound requests.
    pub request_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(60),
        }
    }
}

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;
type RequestFn =
    Arc<dyn Fn(Option<PeerId>, Vec<u8>) -> BoxFuture<Result<Vec<u8>, String>> + Send + Sync>;
type EventFn = Arc<dyn Fn(Option<PeerId>, Vec<u8>) -> BoxFuture<()> + Send + Sync>;

enum Work {
    Request {
        id: u64,
        origin: Option<PeerId>,
        call: Call,
        plain: bool,
    },
    Notification {
        origin: Option<PeerId>,
        call: Call,
    },
    Broadcast {
        origin: Option<PeerId>,
        call: Call,
    },
}

struct Inner {
    config: ConnectionConfig,
    keys: KeyPair,
    content_key: ContentKey,
    transport: Arc<dyn Transport>,

    request_handlers: StdRwLock<HashMap<String, RequestFn>>,
    notification_handlers: StdRwLock<HashMap<String, EventFn>>,
    broadcast_handlers: StdRwLock<HashMap<String, EventFn>>,

    pending: StdMutex<HashMap<u64, oneshot::Sender<Result<Vec<u8>, ConnectionError>>>>,
    next_id: AtomicU64,

    ready: watch::Sender<bool>,
    disposed: AtomicBool,
    started: AtomicBool,

    /// Room peers this endpoint can address: id → public key.
    peers: StdRwLock<HashMap<PeerId, PublicKey>>,
    /// Public key of the directly connected endpoint.
    remote_key: StdRwLock<Option<PublicKey>>,
    /// Authenticated id of the directly connected peer (server side).
    remote_id: StdRwLock<Option<PeerId>>,
    /// Our own peer id, once assigned (client side).
    local_id: StdRwLock<Option<PeerId>>,

    seal_cache: StdMutex<SealCache>,
    open_cache: StdMutex<OpenCache>,

    relay: StdRwLock<Option<Arc<dyn RelaySink>>>,

    on_disconnect: Emitter<()>,
    on_error: Emitter<String>,
    on_connection_error: Emitter<String>,

    work: StdMutex<Option<mpsc::UnboundedSender<Work>>>,
}

/// One endpoint of the encrypted RPC protocol.
///
/// Cheap to clone; all clones drive the same connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("local_id", &*self.inner.local_id.read().unwrap())
            .field("remote_id", &*self.inner.remote_id.read().unwrap())
            .field("ready", &self.is_ready())
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Create a connection over a transport. The handler worker starts
    /// immediately; the reader starts with [`begin`](Self::begin) so
    /// owners can register handlers first.
    pub fn new(keys: KeyPair, transport: Arc<dyn Transport>, config: ConnectionConfig) -> Self {
        let (ready, _) = watch::channel(false);
        let (work_tx, work_rx) = mpsc::unbounded_channel();

        let connection = Self {
            inner: Arc::new(Inner {
                config,
                keys,
                content_key: ContentKey::generate(),
                transport,
                request_handlers: StdRwLock::new(HashMap::new()),
                notification_handlers: StdRwLock::new(HashMap::new()),
                broadcast_handlers: StdRwLock::new(HashMap::new()),
                pending: StdMutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                ready,
                disposed: AtomicBool::new(false),
                started: AtomicBool::new(false),
                peers: StdRwLock::new(HashMap::new()),
                remote_key: StdRwLock::new(None),
                remote_id: StdRwLock::new(None),
                local_id: StdRwLock::new(None),
                seal_cache: StdMutex::new(SealCache::new()),
                open_cache: StdMutex::new(OpenCache::new()),
                relay: StdRwLock::new(None),
                on_disconnect: Emitter::new(),
                on_error: Emitter::new(),
                on_connection_error: Emitter::new(),
                work: StdMutex::new(Some(work_tx)),
            }),
        };

        let worker = connection.clone();
        tokio::spawn(async move { worker.work_loop(work_rx).await });

        connection
    }

    /// Start the reader task. Idempotent.
    pub fn begin(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let reader = self.clone();
        tokio::spawn(async move { reader.read_loop().await });
    }

    // ---- identity & peer directory -------------------------------------

    /// Our public key.
    pub fn public_key(&self) -> PublicKey {
        self.inner.keys.public()
    }

    /// Record the directly connected endpoint: the server's key on a
    /// client, or the authenticated peer on the server.
    pub fn set_remote(&self, id: Option<PeerId>, key: PublicKey) {
        *self.inner.remote_id.write().unwrap() = id;
        *self.inner.remote_key.write().unwrap() = Some(key);
    }

    /// Authenticated id of the directly connected peer, if any.
    pub fn remote_id(&self) -> Option<PeerId> {
        *self.inner.remote_id.read().unwrap()
    }

    /// Record our own assigned peer id.
    pub fn set_local_id(&self, id: PeerId) {
        *self.inner.local_id.write().unwrap() = Some(id);
    }

    /// Our assigned peer id, once the handshake delivered one.
    pub fn local_id(&self) -> Option<PeerId> {
        *self.inner.local_id.read().unwrap()
    }

    /// Add one addressable peer. Invalidates both key caches.
    pub fn add_peer(&self, id: PeerId, key: PublicKey) {
        let count = {
            let mut peers = self.inner.peers.write().unwrap();
            peers.insert(id, key);
            peers.len()
        };
        self.invalidate_caches(count);
    }

    /// Remove one peer. Invalidates both key caches.
    pub fn remove_peer(&self, id: &PeerId) {
        let count = {
            let mut peers = self.inner.peers.write().unwrap();
            peers.remove(id);
            peers.len()
        };
        self.invalidate_caches(count);
    }

    /// Replace the whole peer set (roster delivery). Invalidates both
    /// key caches.
    pub fn set_peers(&self, entries: impl IntoIterator<Item = (PeerId, PublicKey)>) {
        let count = {
            let mut peers = self.inner.peers.write().unwrap();
            *peers = entries.into_iter().collect();
            peers.len()
        };
        self.invalidate_caches(count);
    }

    /// Currently known peer ids.
    pub fn known_peers(&self) -> Vec<PeerId> {
        self.inner.peers.read().unwrap().keys().copied().collect()
    }

    /// Number of currently known peers.
    pub fn known_peer_count(&self) -> usize {
        self.inner.peers.read().unwrap().len()
    }

    /// Public key of a known peer.
    pub fn peer_key(&self, id: &PeerId) -> Option<PublicKey> {
        self.inner.peers.read().unwrap().get(id).copied()
    }

    /// Asymmetric seal operations performed so far (cache misses).
    pub fn seal_misses(&self) -> u64 {
        self.inner.seal_cache.lock().unwrap().misses()
    }

    /// Wraps served from the seal cache so far.
    pub fn seal_hits(&self) -> u64 {
        self.inner.seal_cache.lock().unwrap().hits()
    }

    fn invalidate_caches(&self, peer_count: usize) {
        let mut seal = self.inner.seal_cache.lock().unwrap();
        seal.set_peer_budget(peer_count);
        seal.clear();
        let mut open = self.inner.open_cache.lock().unwrap();
        open.set_peer_budget(peer_count);
        open.clear();
    }

    // ---- lifecycle ------------------------------------------------------

    /// Release the ready barrier. Called by the owner once the
    /// handshake completes.
    pub fn mark_ready(&self) {
        let _ = self.inner.ready.send(true);
    }

    /// Whether the barrier has been released.
    pub fn is_ready(&self) -> bool {
        *self.inner.ready.borrow()
    }

    /// Whether this connection has been disposed.
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    /// Register a disconnect subscriber.
    pub fn on_disconnect(&self, f: impl Fn() + Send + Sync + 'static) {
        self.inner.on_disconnect.subscribe(move |_| f());
    }

    /// Register a subscriber for inbound `Error` envelopes.
    pub fn on_error(&self, f: impl Fn(&str) + Send + Sync + 'static) {
        self.inner.on_error.subscribe(move |message: &String| f(message));
    }

    /// Register a subscriber for fatal connection failures (transport
    /// read errors, malformed frames). Fires just before disposal; a
    /// clean close fires only `on_disconnect`.
    pub fn on_connection_error(&self, f: impl Fn(&str) + Send + Sync + 'static) {
        self.inner
            .on_connection_error
            .subscribe(move |message: &String| f(message));
    }

    /// Install the server's routing hook.
    pub fn set_relay(&self, relay: Arc<dyn RelaySink>) {
        *self.inner.relay.write().unwrap() = Some(relay);
    }

    /// Tear the connection down: fires `on_disconnect`, fails every
    /// pending request with `Disconnected`, clears handlers and
    /// subscribers, closes the transport. Idempotent.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(remote = ?self.remote_id(), "disposing connection");

        self.inner.on_disconnect.emit(&());

        let pending: Vec<_> = {
            let mut map = self.inner.pending.lock().unwrap();
            map.drain().collect()
        };
        for (_, waiter) in pending {
            let _ = waiter.send(Err(ConnectionError::Disconnected));
        }

        self.inner.request_handlers.write().unwrap().clear();
        self.inner.notification_handlers.write().unwrap().clear();
        self.inner.broadcast_handlers.write().unwrap().clear();
        self.inner.work.lock().unwrap().take();

        // Wake barrier waiters; they re-check the disposed flag.
        let _ = self.inner.ready.send(true);

        let _ = self.inner.transport.close().await;

        self.inner.on_disconnect.clear();
        self.inner.on_error.clear();
        self.inner.on_connection_error.clear();
    }

    async fn await_ready(&self) -> Result<(), ConnectionError> {
        let mut rx = self.inner.ready.subscribe();
        loop {
            if self.is_disposed() {
                return Err(ConnectionError::Disconnected);
            }
            if *rx.borrow_and_update() {
                break;
            }
            if rx.changed().await.is_err() {
                return Err(ConnectionError::Disconnected);
            }
        }
        if self.is_disposed() {
            Err(ConnectionError::Disconnected)
        } else {
            Ok(())
        }
    }

    // ---- handler registration ------------------------------------------

    /// Register the handler for a request method. Registering a method
    /// twice replaces the previous handler.
    pub fn on_request<P, R, F, Fut>(&self, method: &str, handler: F)
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + 'static,
        F: Fn(Option<PeerId>, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, String>> + Send + 'static,
    {
        let erased: RequestFn = Arc::new(move |origin, params| {
            match decode_value::<P>(&params) {
                Ok(params) => {
                    let fut = handler(origin, params);
                    Box::pin(async move {
                        let result = fut.await?;
                        encode_value(&result).map_err(|e| e.to_string())
                    }) as BoxFuture<Result<Vec<u8>, String>>
                }
                Err(e) => {
                    let message = format!("invalid parameters: {e}");
                    Box::pin(async move { Err(message) })
                }
            }
        });
        self.inner
            .request_handlers
            .write()
            .unwrap()
            .insert(method.to_string(), erased);
    }

    /// Register the handler for a notification method.
    pub fn on_notification<P, F, Fut>(&self, method: &str, handler: F)
    where
        P: DeserializeOwned + Send + 'static,
        F: Fn(Option<PeerId>, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let erased = Self::erase_event(handler);
        self.inner
            .notification_handlers
            .write()
            .unwrap()
            .insert(method.to_string(), erased);
    }

    /// Register the handler for a broadcast method.
    pub fn on_broadcast<P, F, Fut>(&self, method: &str, handler: F)
    where
        P: DeserializeOwned + Send + 'static,
        F: Fn(Option<PeerId>, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let erased = Self::erase_event(handler);
        self.inner
            .broadcast_handlers
            .write()
            .unwrap()
            .insert(method.to_string(), erased);
    }

    fn erase_event<P, F, Fut>(handler: F) -> EventFn
    where
        P: DeserializeOwned + Send + 'static,
        F: Fn(Option<PeerId>, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Arc::new(move |origin, params| match decode_value::<P>(&params) {
            Ok(params) => Box::pin(handler(origin, params)) as BoxFuture<()>,
            Err(e) => {
                tracing::warn!("dropping event with invalid parameters: {e}");
                Box::pin(async {})
            }
        })
    }

    // ---- outbound -------------------------------------------------------

    /// Send a request and await its reply.
    pub async fn send_request<P, R>(
        &self,
        method: &str,
        target: Target,
        params: &P,
    ) -> Result<R, ConnectionError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        self.send_request_with_timeout(method, target, params, self.inner.config.request_timeout)
            .await
    }

    /// Send a request with an explicit deadline.
    pub async fn send_request_with_timeout<P, R>(
        &self,
        method: &str,
        target: Target,
        params: &P,
        deadline: Duration,
    ) -> Result<R, ConnectionError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        self.await_ready().await?;
        let content = Call::new(method, params)?.encode()?;
        let payload = self.seal_for(&target, &content)?;
        let raw = self.dispatch_request(target, payload, deadline).await?;
        Ok(decode_value(&raw)?)
    }

    /// Send a cleartext control request. Handshake use only: bypasses
    /// the ready barrier and carries no encryption.
    pub async fn handshake_request<P, R>(
        &self,
        method: &str,
        params: &P,
    ) -> Result<R, ConnectionError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let content = Call::new(method, params)?.encode()?;
        let raw = self
            .dispatch_request(
                Target::Server,
                Payload::Plain(content),
                self.inner.config.request_timeout,
            )
            .await?;
        Ok(decode_value(&raw)?)
    }

    async fn dispatch_request(
        &self,
        target: Target,
        payload: Payload,
        deadline: Duration,
    ) -> Result<Vec<u8>, ConnectionError> {
        if self.is_disposed() {
            return Err(ConnectionError::Disconnected);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().unwrap().insert(id, tx);

        let envelope = Envelope::Request {
            id,
            origin: self.local_id(),
            target,
            payload,
        };
        if let Err(e) = self.write(&envelope).await {
            self.inner.pending.lock().unwrap().remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ConnectionError::Disconnected),
            Err(_) => {
                self.inner.pending.lock().unwrap().remove(&id);
                Err(ConnectionError::Timeout)
            }
        }
    }

    /// Send a fire-and-forget unicast.
    pub async fn send_notification<P: Serialize>(
        &self,
        method: &str,
        target: Target,
        params: &P,
    ) -> Result<(), ConnectionError> {
        self.await_ready().await?;
        self.notify_inner(method, target, params).await
    }

    /// Send a sealed notification without waiting for the barrier.
    /// Owner-side handshake traffic (`peer.onInfo`, `room.onJoined`).
    pub async fn send_notification_now<P: Serialize>(
        &self,
        method: &str,
        target: Target,
        params: &P,
    ) -> Result<(), ConnectionError> {
        self.notify_inner(method, target, params).await
    }

    async fn notify_inner<P: Serialize>(
        &self,
        method: &str,
        target: Target,
        params: &P,
    ) -> Result<(), ConnectionError> {
        let content = Call::new(method, params)?.encode()?;
        let payload = self.seal_for(&target, &content)?;
        let envelope = Envelope::Notification {
            origin: self.local_id(),
            target,
            payload,
        };
        self.write(&envelope).await
    }

    /// Broadcast to every known peer. Skipped silently when the peer
    /// set is empty: an asymmetric seal needs at least one recipient.
    pub async fn send_broadcast<P: Serialize>(
        &self,
        method: &str,
        params: &P,
    ) -> Result<(), ConnectionError> {
        self.await_ready().await?;

        let recipients: Vec<PublicKey> =
            self.inner.peers.read().unwrap().values().copied().collect();
        if recipients.is_empty() {
            tracing::debug!(method, "skipping broadcast: no known peers");
            return Ok(());
        }

        let content = Call::new(method, params)?.encode()?;
        let payload = self.seal_with(&recipients, &content)?;
        let envelope = Envelope::Broadcast {
            origin: self.local_id(),
            payload,
        };
        self.write(&envelope).await
    }

    /// Send an `Error` envelope to the directly connected endpoint.
    pub async fn send_error(&self, message: &str) -> Result<(), ConnectionError> {
        let remote = *self.inner.remote_key.read().unwrap();
        let payload = match remote {
            Some(_) => self.seal_for(&Target::Server, message.as_bytes())?,
            None => Payload::Plain(message.as_bytes().to_vec()),
        };
        let envelope = Envelope::Error {
            origin: self.local_id(),
            payload,
        };
        self.write(&envelope).await
    }

    /// Forward an envelope verbatim (relay path: ciphertext untouched).
    pub async fn forward(&self, envelope: &Envelope) -> Result<(), ConnectionError> {
        self.write(envelope).await
    }

    async fn write(&self, envelope: &Envelope) -> Result<(), ConnectionError> {
        if self.is_disposed() {
            return Err(ConnectionError::Disconnected);
        }
        let frame = codec::encode(envelope)?;
        self.inner
            .transport
            .send(&frame)
            .await
            .map_err(|_| ConnectionError::Disconnected)
    }

    // ---- sealing --------------------------------------------------------

    fn seal_for(&self, target: &Target, content: &[u8]) -> Result<Payload, ConnectionError> {
        let recipients = match target {
            Target::Server => {
                let key = self
                    .inner
                    .remote_key
                    .read()
                    .unwrap()
                    .ok_or(ConnectionError::Handshake("remote key unknown"))?;
                vec![key]
            }
            Target::Peer(id) => vec![self.key_of(id)?],
            Target::Broadcast => self.inner.peers.read().unwrap().values().copied().collect(),
        };
        self.seal_with(&recipients, content)
    }

    fn seal_with(
        &self,
        recipients: &[PublicKey],
        content: &[u8],
    ) -> Result<Payload, ConnectionError> {
        let mut cache = self.inner.seal_cache.lock().unwrap();
        let sealed = huddle_crypto::seal(
            content,
            &self.inner.keys,
            &self.inner.content_key,
            recipients,
            &mut cache,
        )?;
        Ok(Payload::Sealed(sealed))
    }

    fn key_of(&self, id: &PeerId) -> Result<PublicKey, ConnectionError> {
        if let Some(key) = self.inner.peers.read().unwrap().get(id) {
            return Ok(*key);
        }
        if self.remote_id() == Some(*id) {
            if let Some(key) = *self.inner.remote_key.read().unwrap() {
                return Ok(key);
            }
        }
        Err(ConnectionError::UnknownPeer(*id))
    }

    fn resolve_sender_key(&self, origin: Option<PeerId>) -> Option<PublicKey> {
        match origin {
            Some(id) => self
                .key_of(&id)
                .ok()
                .or_else(|| *self.inner.remote_key.read().unwrap()),
            None => *self.inner.remote_key.read().unwrap(),
        }
    }

    fn open_content(
        &self,
        payload: &Payload,
        origin: Option<PeerId>,
    ) -> Result<Vec<u8>, ConnectionError> {
        match payload {
            Payload::Plain(bytes) => Ok(bytes.clone()),
            Payload::Sealed(sealed) => {
                let sender = self.resolve_sender_key(origin);
                let mut cache = self.inner.open_cache.lock().unwrap();
                Ok(huddle_crypto::open(
                    sealed,
                    &self.inner.keys,
                    sender.as_ref(),
                    &mut cache,
                )?)
            }
        }
    }

    // ---- inbound --------------------------------------------------------

    async fn read_loop(self) {
        use crate::transport::TransportError;
        loop {
            let bytes = match self.inner.transport.recv().await {
                Ok(bytes) => bytes,
                Err(TransportError::Closed) => break,
                Err(e) => {
                    self.inner.on_connection_error.emit(&e.to_string());
                    break;
                }
            };
            let envelope = match codec::decode(&bytes) {
                Ok(envelope) => envelope,
                Err(e) => {
                    // Structural failure: tear the connection down.
                    tracing::warn!("closing connection on malformed frame: {e}");
                    self.inner.on_connection_error.emit(&e.to_string());
                    break;
                }
            };
            self.dispatch(envelope).await;
        }
        self.dispose().await;
    }

    async fn dispatch(&self, mut envelope: Envelope) {
        // The wire value of `origin` is never trusted: on server-held
        // connections it is replaced with the authenticated peer id.
        let authenticated = self.remote_id();
        if authenticated.is_some() {
            envelope.set_origin(authenticated);
        }

        let relay = self.inner.relay.read().unwrap().clone();
        if let Some(relay) = relay {
            let routable = envelope.is_fanout()
                || matches!(envelope.target(), Some(Target::Peer(_)));
            if routable && relay.route(&envelope).await {
                return;
            }
        }

        match envelope {
            Envelope::Response {
                id,
                origin,
                payload,
                ..
            } => match self.open_content(&payload, origin) {
                Ok(content) => self.settle(id, Ok(content)),
                Err(e) => {
                    tracing::warn!(id, "failed to decrypt response: {e}");
                    self.settle(id, Err(e));
                }
            },
            Envelope::ResponseError {
                id,
                origin,
                payload,
                ..
            } => match self.open_content(&payload, origin) {
                Ok(content) => {
                    let message = String::from_utf8_lossy(&content).into_owned();
                    self.settle(id, Err(ConnectionError::Remote(message)));
                }
                Err(e) => self.settle(id, Err(e)),
            },
            Envelope::Request {
                id,
                origin,
                ref payload,
                ..
            } => {
                let plain = !payload.is_sealed();
                match self.open_content(payload, origin) {
                    Ok(content) => match Call::decode(&content) {
                        Ok(call) => self.enqueue(Work::Request {
                            id,
                            origin,
                            call,
                            plain,
                        }),
                        Err(e) => tracing::warn!(id, "dropping request with bad call frame: {e}"),
                    },
                    Err(e) => tracing::warn!(id, "dropping undecryptable request: {e}"),
                }
            }
            Envelope::Notification {
                origin, ref payload, ..
            } => match self.open_content(payload, origin) {
                Ok(content) => match Call::decode(&content) {
                    Ok(call) => self.enqueue(Work::Notification { origin, call }),
                    Err(e) => tracing::warn!("dropping notification with bad call frame: {e}"),
                },
                Err(e) => tracing::warn!("dropping undecryptable notification: {e}"),
            },
            Envelope::Broadcast { origin, ref payload } => {
                match self.open_content(payload, origin) {
                    Ok(content) => match Call::decode(&content) {
                        Ok(call) => self.enqueue(Work::Broadcast { origin, call }),
                        Err(e) => tracing::warn!("dropping broadcast with bad call frame: {e}"),
                    },
                    Err(e) => tracing::warn!("dropping undecryptable broadcast: {e}"),
                }
            }
            Envelope::Error { origin, payload } => {
                match self.open_content(&payload, origin) {
                    Ok(content) => {
                        let message = String::from_utf8_lossy(&content).into_owned();
                        tracing::debug!(?origin, "peer error: {message}");
                        self.inner.on_error.emit(&message);
                    }
                    Err(e) => tracing::warn!("dropping undecryptable error envelope: {e}"),
                }
            }
        }
    }

    fn settle(&self, id: u64, result: Result<Vec<u8>, ConnectionError>) {
        let waiter = self.inner.pending.lock().unwrap().remove(&id);
        match waiter {
            Some(waiter) => {
                let _ = waiter.send(result);
            }
            // Timed out or never ours: a late reply is dropped.
            None => tracing::debug!(id, "dropping reply for unknown request id"),
        }
    }

    fn enqueue(&self, work: Work) {
        let sender = self.inner.work.lock().unwrap().clone();
        if let Some(sender) = sender {
            let _ = sender.send(work);
        }
    }

    async fn work_loop(self, mut rx: mpsc::UnboundedReceiver<Work>) {
        while let Some(work) = rx.recv().await {
            match work {
                Work::Request {
                    id,
                    origin,
                    call,
                    plain,
                } => self.handle_request(id, origin, call, plain).await,
                Work::Notification { origin, call } => {
                    self.handle_event(&self.inner.notification_handlers, origin, call)
                        .await
                }
                Work::Broadcast { origin, call } => {
                    self.handle_event(&self.inner.broadcast_handlers, origin, call)
                        .await
                }
            }
        }
    }

    async fn handle_request(&self, id: u64, origin: Option<PeerId>, call: Call, plain: bool) {
        let handler = self
            .inner
            .request_handlers
            .read()
            .unwrap()
            .get(&call.method)
            .cloned();
        let Some(handler) = handler else {
            // No method-not-found on the wire: the caller times out.
            tracing::debug!(method = %call.method, "no handler for request, dropping");
            return;
        };

        let result = handler(origin, call.params).await;

        // Replies to sealed requests wait behind the ready barrier;
        // cleartext handshake replies do not.
        if !plain && self.await_ready().await.is_err() {
            return;
        }

        let target = origin.map(Target::Peer).unwrap_or(Target::Server);
        let outcome = match result {
            Ok(content) => self.write_reply(id, target, content, plain, false).await,
            Err(message) => {
                self.write_reply(id, target, message.into_bytes(), plain, true)
                    .await
            }
        };
        if let Err(e) = outcome {
            tracing::debug!(id, "failed to send reply: {e}");
        }
    }

    async fn write_reply(
        &self,
        id: u64,
        target: Target,
        content: Vec<u8>,
        plain: bool,
        is_error: bool,
    ) -> Result<(), ConnectionError> {
        let payload = if plain {
            Payload::Plain(content)
        } else {
            self.seal_for(&target, &content)?
        };
        let origin = self.local_id();
        let envelope = if is_error {
            Envelope::ResponseError {
                id,
                origin,
                target,
                payload,
            }
        } else {
            Envelope::Response {
                id,
                origin,
                target,
                payload,
            }
        };
        self.write(&envelope).await
    }

    async fn handle_event(
        &self,
        registry: &StdRwLock<HashMap<String, EventFn>>,
        origin: Option<PeerId>,
        call: Call,
    ) {
        let handler = registry.read().unwrap().get(&call.method).cloned();
        match handler {
            Some(handler) => handler(origin, call.params).await,
            None => tracing::debug!(method = %call.method, "no handler for event, dropping"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::PipeTransport;
    use serde::Deserialize;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct EchoParams {
        text: String,
    }

    /// Two directly connected, ready endpoints.
    fn connected_pair() -> (Connection, Connection) {
        let (ta, tb) = PipeTransport::pair();
        connect_over(Arc::new(ta), Arc::new(tb))
    }

    fn connect_over(
        ta: Arc<dyn Transport>,
        tb: Arc<dyn Transport>,
    ) -> (Connection, Connection) {
        let a = Connection::new(KeyPair::generate(), ta, ConnectionConfig::default());
        let b = Connection::new(KeyPair::generate(), tb, ConnectionConfig::default());
        a.set_remote(None, b.public_key());
        b.set_remote(None, a.public_key());
        a.mark_ready();
        b.mark_ready();
        a.begin();
        b.begin();
        (a, b)
    }

    #[tokio::test]
    async fn request_response_roundtrip() {
        let (a, b) = connected_pair();

        b.on_request("test.echo", |_origin, params: EchoParams| async move {
            Ok::<_, String>(params.text)
        });

        let reply: String = a
            .send_request(
                "test.echo",
                Target::Server,
                &EchoParams { text: "hi".into() },
            )
            .await
            .unwrap();
        assert_eq!(reply, "hi");
    }

    #[tokio::test]
    async fn handler_error_becomes_remote_error() {
        let (a, b) = connected_pair();

        b.on_request("test.fail", |_origin, _params: ()| async move {
            Err::<(), _>("boom".to_string())
        });

        let result: Result<(), _> = a.send_request("test.fail", Target::Server, &()).await;
        assert_eq!(result, Err(ConnectionError::Remote("boom".to_string())));
    }

    #[tokio::test]
    async fn concurrent_requests_correlate_by_id() {
        let (a, b) = connected_pair();

        b.on_request("test.slow_echo", |_origin, params: EchoParams| async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok::<_, String>(params.text)
        });

        let mut handles = Vec::new();
        for i in 0..5 {
            let a = a.clone();
            handles.push(tokio::spawn(async move {
                let text = "x".repeat(i + 1);
                let reply: String = a
                    .send_request(
                        "test.slow_echo",
                        Target::Server,
                        &EchoParams { text: text.clone() },
                    )
                    .await
                    .unwrap();
                (text, reply)
            }));
        }
        for handle in handles {
            let (sent, got) = handle.await.unwrap();
            assert_eq!(sent, got);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn request_times_out_and_late_reply_is_dropped() {
        let (a, b) = connected_pair();

        b.on_request("test.sleepy", |_origin, _params: ()| async move {
            tokio::time::sleep(Duration::from_secs(120)).await;
            Ok::<_, String>("late".to_string())
        });

        let result: Result<String, _> = a.send_request("test.sleepy", Target::Server, &()).await;
        assert_eq!(result, Err(ConnectionError::Timeout));

        // Let the handler finish and its reply arrive; it must be
        // dropped without disturbing the connection.
        tokio::time::sleep(Duration::from_secs(130)).await;
        assert!(!a.is_disposed());
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_method_hangs_the_caller_until_timeout() {
        let (a, _b) = connected_pair();

        let result: Result<(), _> = a
            .send_request_with_timeout(
                "test.nobody_home",
                Target::Server,
                &(),
                Duration::from_secs(5),
            )
            .await;
        assert_eq!(result, Err(ConnectionError::Timeout));
    }

    #[tokio::test]
    async fn notification_reaches_handler_with_origin() {
        let (a, b) = connected_pair();
        let peer = PeerId::random();
        a.set_local_id(peer);

        let (tx, rx) = oneshot::channel();
        let tx = StdMutex::new(Some(tx));
        b.on_notification("test.note", move |origin, params: EchoParams| {
            let sent = tx.lock().unwrap().take();
            async move {
                if let Some(sent) = sent {
                    let _ = sent.send((origin, params.text));
                }
            }
        });

        a.send_notification(
            "test.note",
            Target::Server,
            &EchoParams { text: "ping".into() },
        )
        .await
        .unwrap();

        let (origin, text) = rx.await.unwrap();
        assert_eq!(origin, Some(peer));
        assert_eq!(text, "ping");
    }

    #[tokio::test]
    async fn empty_broadcast_is_skipped_silently() {
        let (ta, tb, mut tap) = PipeTransport::pair_tapped();
        let (a, _b) = connect_over(Arc::new(ta), Arc::new(tb));

        // No known peers: nothing goes on the wire.
        a.send_broadcast("test.note", &EchoParams { text: "x".into() })
            .await
            .unwrap();
        assert!(tap.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_reaches_known_peers() {
        let (a, b) = connected_pair();
        let b_id = PeerId::random();
        // a addresses b as a room peer rather than as the raw remote.
        a.add_peer(b_id, b.public_key());

        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        b.on_broadcast("test.tick", move |_origin, _params: ()| {
            let count = count2.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
            }
        });

        a.send_broadcast("test.tick", &()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dispose_rejects_pending_requests() {
        let (a, b) = connected_pair();

        b.on_request("test.never", |_origin, _params: ()| async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok::<_, String>(())
        });

        let a2 = a.clone();
        let pending = tokio::spawn(async move {
            a2.send_request::<_, ()>("test.never", Target::Server, &())
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        a.dispose().await;

        assert_eq!(pending.await.unwrap(), Err(ConnectionError::Disconnected));
        assert!(a.is_disposed());
    }

    #[tokio::test]
    async fn peer_transport_close_disposes_and_fires_disconnect() {
        let (a, b) = connected_pair();

        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        a.on_disconnect(move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        });

        let a2 = a.clone();
        let pending = tokio::spawn(async move {
            a2.send_request::<_, ()>("test.void", Target::Server, &())
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        b.dispose().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(a.is_disposed());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(pending.await.unwrap(), Err(ConnectionError::Disconnected));
    }

    #[tokio::test]
    async fn dispose_is_idempotent() {
        let (a, _b) = connected_pair();
        a.dispose().await;
        a.dispose().await;
        assert!(a.is_disposed());
    }

    #[tokio::test]
    async fn sealed_reply_waits_for_ready_barrier() {
        let (ta, tb) = PipeTransport::pair();
        let a = Connection::new(
            KeyPair::generate(),
            Arc::new(ta),
            ConnectionConfig::default(),
        );
        let b = Connection::new(
            KeyPair::generate(),
            Arc::new(tb),
            ConnectionConfig::default(),
        );
        a.set_remote(None, b.public_key());
        b.set_remote(None, a.public_key());
        // Only the requester is ready; the responder is still
        // constructing.
        b.mark_ready();
        a.begin();
        b.begin();

        a.on_request("test.echo", |_origin, params: EchoParams| async move {
            Ok::<_, String>(params.text)
        });

        let b2 = b.clone();
        let request = tokio::spawn(async move {
            b2.send_request::<_, String>(
                "test.echo",
                Target::Server,
                &EchoParams { text: "gated".into() },
            )
            .await
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!request.is_finished(), "reply escaped the ready barrier");

        a.mark_ready();
        assert_eq!(request.await.unwrap().unwrap(), "gated");
    }

    #[tokio::test]
    async fn malformed_frame_tears_the_connection_down() {
        let (ta, tb) = PipeTransport::pair();
        let a = Connection::new(
            KeyPair::generate(),
            Arc::new(ta),
            ConnectionConfig::default(),
        );
        a.mark_ready();
        a.begin();

        let flagged = Arc::new(AtomicUsize::new(0));
        let flagged2 = flagged.clone();
        a.on_connection_error(move |_message| {
            flagged2.fetch_add(1, Ordering::SeqCst);
        });

        tb.send(b"not a frame").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(a.is_disposed());
        assert_eq!(flagged.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn error_envelope_reaches_on_error() {
        let (a, b) = connected_pair();

        let (tx, rx) = oneshot::channel();
        let tx = StdMutex::new(Some(tx));
        a.on_error(move |message| {
            if let Some(tx) = tx.lock().unwrap().take() {
                let _ = tx.send(message.to_string());
            }
        });

        b.send_error("no such recipient").await.unwrap();
        assert_eq!(rx.await.unwrap(), "no such recipient");
    }

    #[tokio::test]
    async fn registering_twice_replaces_the_handler() {
        let (a, b) = connected_pair();

        b.on_request("test.which", |_origin, _params: ()| async move {
            Ok::<_, String>("first".to_string())
        });
        b.on_request("test.which", |_origin, _params: ()| async move {
            Ok::<_, String>("second".to_string())
        });

        let reply: String = a.send_request("test.which", Target::Server, &()).await.unwrap();
        assert_eq!(reply, "second");
    }

    #[tokio::test]
    async fn peer_set_change_clears_seal_cache() {
        let (a, b) = connected_pair();
        let b_id = PeerId::random();
        a.add_peer(b_id, b.public_key());

        a.send_broadcast("test.tick", &()).await.unwrap();
        let misses_before = a.seal_misses();
        assert_eq!(misses_before, 1);

        a.send_broadcast("test.tick", &()).await.unwrap();
        // Served from cache.
        assert_eq!(a.seal_misses(), misses_before);

        // Membership change invalidates the cache.
        a.add_peer(PeerId::random(), KeyPair::generate().public());
        a.send_broadcast("test.tick", &()).await.unwrap();
        assert_eq!(a.seal_misses(), misses_before + 2);
    }
}
