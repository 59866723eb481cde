//! The transport bus: one long-lived socket endpoint per module process.
//!
//! A [`Bus`] is either a server, which binds and accepts many peers, or a
//! client, which connects (and reconnects) to one server. Activation spawns
//! exactly one reader task that owns every read half and dispatches decoded
//! messages to per-type handlers. All write state (peer writers, routes and
//! the configured send timeout) lives behind one async mutex that senders
//! and the reader share.
//!
//! A server learns which peer each sender uid lives behind and routes
//! directed traffic there; notifications and broadcasts fan out. With relay
//! enabled it also forwards what one peer sends to the others, acting as
//! the hub between client modules.

use crate::endpoint::{Endpoint, Role, Transport};
use crate::error::WireError;
use crate::frame::{
    encode_frame, encode_frames, read_frame, write_frames, Assembled, Frame, FrameAssembler,
};

use bytes::Bytes;
use futures::stream::{self, BoxStream, SelectAll};
use futures::StreamExt;
use modlink_codec::{codec_for, MessageCodec};
use modlink_types::{
    generate_uid, BusConfig, Message, MessageType, ModuleAddress, Object, Uid, BROADCAST_UID,
};
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// Token returned when registering a message handler.
pub type HandlerId = u64;

/// Identifier the bus assigns to each connection.
pub type PeerId = u64;

/// A message handler. Returning `false` stops dispatch of that message.
pub type MessageHandler = Arc<dyn Fn(&Message) -> bool + Send + Sync>;

type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Bytes of an undecodable payload included in trace logs.
const DUMP_LIMIT: usize = 64;

// ---------------------------------------------------------------------------
// Sockets
// ---------------------------------------------------------------------------

enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(tokio::net::UnixListener, PathBuf),
}

impl Listener {
    async fn bind(transport: &Transport) -> io::Result<Self> {
        match transport {
            Transport::Tcp { host, port } => {
                Ok(Listener::Tcp(TcpListener::bind((host.as_str(), *port)).await?))
            }
            #[cfg(unix)]
            Transport::Ipc(path) => Ok(Listener::Unix(
                tokio::net::UnixListener::bind(path)?,
                path.clone(),
            )),
            #[cfg(not(unix))]
            Transport::Ipc(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "ipc transport requires Unix-domain sockets",
            )),
        }
    }

    async fn accept(&self) -> io::Result<(BoxReader, BoxWriter, String)> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, addr) = listener.accept().await?;
                stream.set_nodelay(true)?;
                let (reader, writer) = stream.into_split();
                Ok((Box::new(reader), Box::new(writer), addr.to_string()))
            }
            #[cfg(unix)]
            Listener::Unix(listener, path) => {
                let (stream, _) = listener.accept().await?;
                let (reader, writer) = stream.into_split();
                Ok((Box::new(reader), Box::new(writer), path.display().to_string()))
            }
        }
    }

    /// The transport actually bound (resolves port 0).
    fn local_transport(&self) -> Option<Transport> {
        match self {
            Listener::Tcp(listener) => listener.local_addr().ok().map(|addr| Transport::Tcp {
                host: addr.ip().to_string(),
                port: addr.port(),
            }),
            #[cfg(unix)]
            Listener::Unix(_, path) => Some(Transport::Ipc(path.clone())),
        }
    }

    fn ipc_path(&self) -> Option<PathBuf> {
        match self {
            Listener::Tcp(_) => None,
            #[cfg(unix)]
            Listener::Unix(_, path) => Some(path.clone()),
        }
    }
}

async fn connect(transport: &Transport) -> io::Result<(BoxReader, BoxWriter, String)> {
    match transport {
        Transport::Tcp { host, port } => {
            let stream = TcpStream::connect((host.as_str(), *port)).await?;
            stream.set_nodelay(true)?;
            let remote = stream.peer_addr()?.to_string();
            let (reader, writer) = stream.into_split();
            Ok((Box::new(reader), Box::new(writer), remote))
        }
        #[cfg(unix)]
        Transport::Ipc(path) => {
            let stream = tokio::net::UnixStream::connect(path).await?;
            let (reader, writer) = stream.into_split();
            Ok((Box::new(reader), Box::new(writer), path.display().to_string()))
        }
        #[cfg(not(unix))]
        Transport::Ipc(_) => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "ipc transport requires Unix-domain sockets",
        )),
    }
}

/// `None` blocks forever; `Some(now)` for a zero timeout.
fn deadline_for(timeout_ms: i64) -> Option<Instant> {
    u64::try_from(timeout_ms)
        .ok()
        .map(|ms| Instant::now() + Duration::from_millis(ms))
}

async fn write_before(
    writer: &mut BoxWriter,
    frames: &[u8],
    deadline: Option<Instant>,
    timeout_ms: i64,
) -> Result<(), WireError> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, write_frames(writer, frames))
            .await
            .map_err(|_| WireError::Timeout { timeout_ms })?,
        None => write_frames(writer, frames).await,
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

struct PeerLink {
    writer: BoxWriter,
    remote: String,
}

/// Everything a write touches. Guarded by [`BusInner::socket`].
struct SocketState {
    peers: HashMap<PeerId, PeerLink>,
    routes: HashMap<Uid, PeerId>,
    /// Last timeout applied to a send; `None` before the first send.
    send_timeout_ms: Option<i64>,
    ipc_path: Option<PathBuf>,
}

impl SocketState {
    fn new() -> Self {
        Self {
            peers: HashMap::new(),
            routes: HashMap::new(),
            send_timeout_ms: None,
            ipc_path: None,
        }
    }

    fn apply_send_timeout(&mut self, timeout_ms: i64) {
        if self.send_timeout_ms != Some(timeout_ms) {
            debug!(timeout_ms, "Bus: send timeout changed");
            self.send_timeout_ms = Some(timeout_ms);
        }
    }

    fn remove_peer(&mut self, peer: PeerId) -> Option<PeerLink> {
        self.routes.retain(|_, p| *p != peer);
        self.peers.remove(&peer)
    }

    /// Peers a message should be written to.
    fn targets(&self, route: Option<(MessageType, Uid)>, exclude: Option<PeerId>) -> Vec<PeerId> {
        if let Some((kind, receiver)) = route {
            if !kind.is_notification() && receiver != BROADCAST_UID {
                if let Some(&peer) = self.routes.get(&receiver) {
                    if Some(peer) == exclude {
                        return Vec::new();
                    }
                    if self.peers.contains_key(&peer) {
                        return vec![peer];
                    }
                }
            }
        }
        let mut peers: Vec<PeerId> = self
            .peers
            .keys()
            .copied()
            .filter(|p| Some(*p) != exclude)
            .collect();
        peers.sort_unstable();
        peers
    }
}

struct ReaderControl {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

struct BusInner {
    endpoint: Endpoint,
    config: BusConfig,
    codec: Arc<dyn MessageCodec>,
    identity: RwLock<ModuleAddress>,
    active: AtomicBool,
    /// Bumped on every teardown so waiters can tell a deactivation happened.
    generation: AtomicU64,
    socket: tokio::sync::Mutex<SocketState>,
    /// Client only: whether the server connection is up.
    connected: watch::Sender<bool>,
    local_transport: RwLock<Option<Transport>>,
    handlers: RwLock<HashMap<MessageType, Vec<(HandlerId, MessageHandler)>>>,
    next_handler: AtomicU64,
    next_peer: AtomicU64,
    reader: Mutex<Option<ReaderControl>>,
}

/// Handle to a transport bus. Cheap to clone; clones share the endpoint.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl Bus {
    /// Create an inactive bus from configuration, using the configured codec.
    ///
    /// The connection string is validated here, before any socket exists.
    pub fn new(config: BusConfig) -> Result<Self, WireError> {
        let codec = codec_for(config.codec, config.strict_decoding);
        Self::with_codec(config, codec)
    }

    /// Create an inactive bus with default settings for `connection`.
    pub fn from_connection(connection: &str) -> Result<Self, WireError> {
        Self::new(BusConfig::with_connection(connection))
    }

    /// Create an inactive bus with an explicit codec.
    pub fn with_codec(config: BusConfig, codec: Arc<dyn MessageCodec>) -> Result<Self, WireError> {
        let endpoint = Endpoint::parse(&config.connection)?;
        let identity = ModuleAddress::new(
            generate_uid(),
            config.identity_name.clone(),
            config.identity_class.clone(),
        );
        let (connected, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(BusInner {
                endpoint,
                config,
                codec,
                identity: RwLock::new(identity),
                active: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                socket: tokio::sync::Mutex::new(SocketState::new()),
                connected,
                local_transport: RwLock::new(None),
                handlers: RwLock::new(HashMap::new()),
                next_handler: AtomicU64::new(1),
                next_peer: AtomicU64::new(1),
                reader: Mutex::new(None),
            }),
        })
    }

    pub fn role(&self) -> Role {
        self.inner.endpoint.role
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    pub fn codec(&self) -> &Arc<dyn MessageCodec> {
        &self.inner.codec
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// The address stamped as sender on outgoing messages.
    pub fn identity(&self) -> ModuleAddress {
        self.inner
            .identity
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn set_identity(&self, identity: ModuleAddress) {
        *self.inner.identity.write().unwrap_or_else(|e| e.into_inner()) = identity;
    }

    /// The bound transport of an active server, e.g. `tcp://127.0.0.1:40123`.
    pub fn local_endpoint(&self) -> Option<String> {
        self.inner
            .local_transport
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(Transport::to_string)
    }

    /// Number of live connections (0 or 1 for a client).
    pub async fn peer_count(&self) -> usize {
        self.inner.socket.lock().await.peers.len()
    }

    /// Start the bus. An already active bus is deactivated first.
    ///
    /// A server binds immediately and fails with [`WireError::Transport`]
    /// if the address is taken. A client connects in the background and
    /// keeps reconnecting until deactivated.
    pub async fn activate(&self) -> Result<(), WireError> {
        self.deactivate().await;

        {
            let mut socket = self.inner.socket.lock().await;
            *socket = SocketState::new();
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let inner = Arc::clone(&self.inner);

        let handle = match self.inner.endpoint.role {
            Role::Server => {
                let transport = &self.inner.endpoint.transport;
                let listener = Listener::bind(transport).await.map_err(|e| {
                    WireError::Transport(format!("Failed to bind {transport}: {e}"))
                })?;
                let local = listener.local_transport();
                info!(
                    endpoint = %local.as_ref().unwrap_or(transport),
                    uid = self.identity().uid,
                    "Bus: server listening"
                );
                self.inner.socket.lock().await.ipc_path = listener.ipc_path();
                *self
                    .inner
                    .local_transport
                    .write()
                    .unwrap_or_else(|e| e.into_inner()) = local;
                self.inner.active.store(true, Ordering::SeqCst);
                tokio::spawn(run_server(inner, listener, shutdown_rx))
            }
            Role::Client => {
                info!(
                    endpoint = %self.inner.endpoint.transport,
                    uid = self.identity().uid,
                    "Bus: client starting"
                );
                self.inner.active.store(true, Ordering::SeqCst);
                tokio::spawn(run_client(inner, shutdown_rx))
            }
        };

        *self.inner.reader.lock().unwrap_or_else(|e| e.into_inner()) = Some(ReaderControl {
            shutdown: shutdown_tx,
            handle,
        });
        Ok(())
    }

    /// Stop the bus: flag it inactive, signal the reader, close every
    /// socket and wait for the reader task to finish. Idempotent.
    pub async fn deactivate(&self) {
        let was_active = self.inner.active.swap(false, Ordering::SeqCst);
        let control = self
            .inner
            .reader
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(control) = &control {
            control.shutdown.send_replace(true);
        }

        self.inner.teardown().await;

        if let Some(control) = control {
            if let Err(e) = control.handle.await {
                warn!(error = %e, "Bus: reader task ended abnormally");
            }
        }
        if was_active {
            info!(endpoint = %self.inner.endpoint, "Bus: deactivated");
        }
    }

    /// Register a handler for one message type. Handlers run in
    /// registration order on the reader task and must not block.
    pub fn add_message_handler<F>(&self, kind: MessageType, handler: F) -> HandlerId
    where
        F: Fn(&Message) -> bool + Send + Sync + 'static,
    {
        self.insert_handler(kind, Arc::new(handler))
    }

    /// Register one handler for every message type.
    pub fn add_handler_for_all<F>(&self, handler: F) -> Vec<HandlerId>
    where
        F: Fn(&Message) -> bool + Send + Sync + 'static,
    {
        let handler: MessageHandler = Arc::new(handler);
        MessageType::ALL
            .iter()
            .map(|kind| self.insert_handler(*kind, Arc::clone(&handler)))
            .collect()
    }

    fn insert_handler(&self, kind: MessageType, handler: MessageHandler) -> HandlerId {
        let id = self.inner.next_handler.fetch_add(1, Ordering::Relaxed);
        let mut handlers = self
            .inner
            .handlers
            .write()
            .unwrap_or_else(|e| e.into_inner());
        handlers.entry(kind).or_default().push((id, handler));
        id
    }

    /// Remove a handler by the id returned at registration.
    pub fn remove_message_handler(&self, id: HandlerId) -> bool {
        let mut handlers = self
            .inner
            .handlers
            .write()
            .unwrap_or_else(|e| e.into_inner());
        let mut removed = false;
        for list in handlers.values_mut() {
            let before = list.len();
            list.retain(|(hid, _)| *hid != id);
            removed |= list.len() != before;
        }
        removed
    }

    pub fn handler_count(&self, kind: MessageType) -> usize {
        self.inner
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&kind)
            .map_or(0, Vec::len)
    }

    /// Send raw bytes as one frame. A server writes to every peer.
    ///
    /// `timeout_ms`: `-1` blocks, `0` only succeeds if nothing has to wait,
    /// otherwise the send (connection wait included) is bounded.
    pub async fn send(&self, data: &[u8], timeout_ms: i64) -> Result<(), WireError> {
        self.send_frames(&[data], None, timeout_ms).await
    }

    /// Send raw bytes as a multipart message.
    pub async fn send_multipart(&self, parts: &[&[u8]], timeout_ms: i64) -> Result<(), WireError> {
        self.send_frames(parts, None, timeout_ms).await
    }

    /// Stamp the local identity as sender, serialize and send.
    pub async fn send_message(&self, message: Message, timeout_ms: i64) -> Result<(), WireError> {
        if !self.is_active() {
            return Err(WireError::Inactive);
        }
        let message = message.with_sender(self.identity());
        let bytes = self.inner.codec.serialize_message(&message)?;
        trace!(
            kind = %message.get_type(),
            receiver = message.receiver().uid,
            len = bytes.len(),
            "Bus: sending"
        );
        let route = Some((message.get_type(), message.receiver().uid));
        self.send_frames(&[&bytes], route, timeout_ms).await
    }

    /// Build a message for `receiver` (use [`BROADCAST_UID`] for everyone)
    /// and send it.
    pub async fn send_fields(
        &self,
        kind: MessageType,
        fields: Object,
        receiver: Uid,
        timeout_ms: i64,
    ) -> Result<(), WireError> {
        self.send_message(Message::to_uid(kind, fields, receiver), timeout_ms)
            .await
    }

    async fn send_frames(
        &self,
        parts: &[&[u8]],
        route: Option<(MessageType, Uid)>,
        timeout_ms: i64,
    ) -> Result<(), WireError> {
        if !self.is_active() {
            return Err(WireError::Inactive);
        }
        let max = self.inner.config.max_frame_size;
        if let Some(part) = parts.iter().find(|p| p.len() > max as usize) {
            return Err(WireError::FrameTooLarge {
                size: part.len(),
                max,
            });
        }

        let deadline = deadline_for(timeout_ms);
        if self.role() == Role::Client {
            self.wait_connected(deadline, timeout_ms).await?;
        }

        let mut socket = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, self.inner.socket.lock())
                .await
                .map_err(|_| WireError::Timeout { timeout_ms })?,
            None => self.inner.socket.lock().await,
        };
        if !self.is_active() {
            return Err(WireError::Inactive);
        }
        socket.apply_send_timeout(timeout_ms);

        let targets = socket.targets(route, None);
        if targets.is_empty() {
            if self.role() == Role::Client {
                return Err(WireError::Transport(format!(
                    "Not connected to {}",
                    self.inner.endpoint.transport
                )));
            }
            debug!("Bus: no connected peers, message dropped");
            return Ok(());
        }

        // Fresh buffer per send: callers may reuse theirs immediately.
        let frames = encode_frames(parts);
        let mut delivered = 0usize;
        let mut last_error = None;
        for peer in &targets {
            let Some(link) = socket.peers.get_mut(peer) else {
                continue;
            };
            match write_before(&mut link.writer, &frames, deadline, timeout_ms).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(
                        peer,
                        remote = %link.remote,
                        error = %e,
                        "Bus: send failed, dropping peer"
                    );
                    socket.remove_peer(*peer);
                    if self.role() == Role::Client {
                        self.inner.connected.send_replace(false);
                    }
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if delivered == 0 => Err(e),
            _ => Ok(()),
        }
    }

    /// Wait for the client connection. A deactivation while waiting fails
    /// the wait with [`WireError::Inactive`], even if the bus was already
    /// reactivated.
    async fn wait_connected(
        &self,
        deadline: Option<Instant>,
        timeout_ms: i64,
    ) -> Result<(), WireError> {
        let generation = self.inner.generation.load(Ordering::SeqCst);
        let torn_down = || self.inner.generation.load(Ordering::SeqCst) != generation;
        let mut connected = self.inner.connected.subscribe();
        if *connected.borrow_and_update() {
            return Ok(());
        }
        if timeout_ms == 0 {
            return Err(WireError::Transport(format!(
                "Not connected to {}",
                self.inner.endpoint.transport
            )));
        }
        let woken = connected.wait_for(|up| *up || torn_down() || !self.is_active());
        let outcome = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, woken).await {
                Ok(result) => result.is_ok(),
                Err(_) => return Err(WireError::Timeout { timeout_ms }),
            },
            None => woken.await.is_ok(),
        };
        if !outcome || torn_down() || !self.is_active() {
            return Err(WireError::Inactive);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Reader side
// ---------------------------------------------------------------------------

enum PeerEvent {
    Frame(Frame),
    Closed,
    Failed(WireError),
}

fn peer_stream(
    peer: PeerId,
    reader: BoxReader,
    max: u32,
) -> BoxStream<'static, (PeerId, PeerEvent)> {
    stream::unfold(Some(reader), move |state| async move {
        let Some(mut reader) = state else {
            return None;
        };
        match read_frame(&mut reader, max).await {
            Ok(Some(frame)) => Some(((peer, PeerEvent::Frame(frame)), Some(reader))),
            Ok(None) => Some(((peer, PeerEvent::Closed), None)),
            Err(e) => Some(((peer, PeerEvent::Failed(e)), None)),
        }
    })
    .boxed()
}

impl BusInner {
    fn handle(self: &Arc<Self>) -> Bus {
        Bus {
            inner: Arc::clone(self),
        }
    }

    fn identity_uid(&self) -> Uid {
        self.identity.read().unwrap_or_else(|e| e.into_inner()).uid
    }

    /// Close every socket and mark the bus inactive. Idempotent.
    async fn teardown(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.connected.send_replace(false);
        let mut socket = self.socket.lock().await;
        for (peer, mut link) in socket.peers.drain() {
            if let Err(e) = link.writer.shutdown().await {
                trace!(peer, error = %e, "Bus: shutdown of peer writer failed");
            }
        }
        socket.routes.clear();
        if let Some(path) = socket.ipc_path.take() {
            if let Err(e) = std::fs::remove_file(&path) {
                debug!(path = %path.display(), error = %e, "Bus: could not remove ipc socket");
            }
        }
        *self
            .local_transport
            .write()
            .unwrap_or_else(|e| e.into_inner()) = None;
    }

    async fn drop_peer(&self, peer: PeerId) {
        let mut socket = self.socket.lock().await;
        if let Some(link) = socket.remove_peer(peer) {
            debug!(peer, remote = %link.remote, "Bus: peer disconnected");
        }
    }

    /// Decode one complete payload, learn routes, relay and dispatch.
    async fn handle_payload(self: &Arc<Self>, payload: Bytes, origin: Option<PeerId>) {
        let message = match self.codec.deserialize_message(&payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(len = payload.len(), error = %e, "Bus: dropping undecodable payload");
                trace!(
                    head = %hex::encode(&payload[..payload.len().min(DUMP_LIMIT)]),
                    "Bus: undecodable payload"
                );
                return;
            }
        };
        debug!(
            kind = %message.get_type(),
            sender = message.sender().uid,
            receiver = message.receiver().uid,
            "Bus: received"
        );

        if let Some(peer) = origin {
            let mut socket = self.socket.lock().await;
            let sender = message.sender().uid;
            if sender != BROADCAST_UID {
                socket.routes.insert(sender, peer);
            }
            if self.config.relay && self.should_relay(&message) {
                self.relay(&mut socket, &payload, &message, peer).await;
            }
        }

        self.dispatch(&message);
    }

    fn should_relay(&self, message: &Message) -> bool {
        !matches!(
            message.get_type(),
            MessageType::EchoRequest | MessageType::EchoReply
        ) && message.receiver().uid != self.identity_uid()
    }

    async fn relay(
        &self,
        socket: &mut SocketState,
        payload: &[u8],
        message: &Message,
        origin: PeerId,
    ) {
        let targets = socket.targets(
            Some((message.get_type(), message.receiver().uid)),
            Some(origin),
        );
        if targets.is_empty() {
            return;
        }
        let frames = encode_frames(&[payload]);
        let timeout_ms = i64::try_from(self.config.relay_timeout_ms).unwrap_or(i64::MAX);
        let deadline = deadline_for(timeout_ms);
        for peer in targets {
            let Some(link) = socket.peers.get_mut(&peer) else {
                continue;
            };
            if let Err(e) = write_before(&mut link.writer, &frames, deadline, timeout_ms).await {
                warn!(peer, error = %e, "Bus: relay failed, dropping peer");
                socket.remove_peer(peer);
            } else {
                trace!(peer, kind = %message.get_type(), "Bus: relayed");
            }
        }
    }

    /// Run type handlers in order; `false` stops. Then the default handler.
    fn dispatch(self: &Arc<Self>, message: &Message) {
        let handlers: Vec<MessageHandler> = {
            let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
            handlers
                .get(&message.get_type())
                .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
                .unwrap_or_default()
        };
        for handler in handlers {
            if !handler(message) {
                trace!(kind = %message.get_type(), "Bus: dispatch stopped by handler");
                return;
            }
        }
        self.default_handler(message);
    }

    fn default_handler(self: &Arc<Self>, message: &Message) {
        if message.get_type() != MessageType::EchoRequest {
            return;
        }
        let bus = self.handle();
        let requester = message.sender().uid;
        let timeout_ms = self.config.send_timeout_ms;
        tokio::spawn(async move {
            let reply = Message::to_uid(MessageType::EchoReply, Object::new(), requester);
            if let Err(e) = bus.send_message(reply, timeout_ms).await {
                warn!(requester, error = %e, "Bus: echo reply failed");
            }
        });
    }
}

async fn run_server(inner: Arc<BusInner>, listener: Listener, mut shutdown: watch::Receiver<bool>) {
    let max = inner.config.max_frame_size;
    let mut streams: SelectAll<BoxStream<'static, (PeerId, PeerEvent)>> = SelectAll::new();
    let mut assemblers: HashMap<PeerId, FrameAssembler> = HashMap::new();

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((reader, writer, remote)) => {
                    let peer = inner.next_peer.fetch_add(1, Ordering::Relaxed);
                    inner
                        .socket
                        .lock()
                        .await
                        .peers
                        .insert(peer, PeerLink { writer, remote: remote.clone() });
                    debug!(peer, %remote, "Bus: peer connected");
                    streams.push(peer_stream(peer, reader, max));
                    assemblers.insert(peer, FrameAssembler::new(max as usize));
                }
                Err(e) => {
                    error!(error = %e, "Bus: accept failed, deactivating");
                    break;
                }
            },
            Some((peer, event)) = streams.next(), if !streams.is_empty() => match event {
                PeerEvent::Frame(frame) => {
                    let Some(assembler) = assemblers.get_mut(&peer) else { continue };
                    match assembler.push(frame) {
                        Ok(Assembled::Complete(payload)) => {
                            inner.handle_payload(payload, Some(peer)).await
                        }
                        Ok(Assembled::Probe) => debug!(peer, "Bus: peer probe"),
                        Ok(Assembled::Pending) => {}
                        Err(e) => {
                            warn!(peer, error = %e, "Bus: oversized message, dropping peer");
                            assemblers.remove(&peer);
                            inner.drop_peer(peer).await;
                        }
                    }
                }
                PeerEvent::Closed => {
                    assemblers.remove(&peer);
                    inner.drop_peer(peer).await;
                }
                PeerEvent::Failed(e) => {
                    warn!(peer, error = %e, "Bus: peer read failed, dropping peer");
                    assemblers.remove(&peer);
                    inner.drop_peer(peer).await;
                }
            },
        }
    }

    // Read halves drop with `streams`; write halves go in teardown.
    drop(streams);
    inner.teardown().await;
    debug!("Bus: server reader stopped");
}

/// Sleep between reconnects. Returns `false` if shutdown was requested.
async fn backoff(interval: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = shutdown.changed() => false,
        _ = tokio::time::sleep(interval) => true,
    }
}

async fn run_client(inner: Arc<BusInner>, mut shutdown: watch::Receiver<bool>) {
    let max = inner.config.max_frame_size;
    let interval = Duration::from_millis(inner.config.reconnect_interval_ms.max(1));
    let transport = inner.endpoint.transport.clone();

    'connection: loop {
        let connected = tokio::select! {
            _ = shutdown.changed() => break,
            result = connect(&transport) => result,
        };
        let (mut reader, mut writer, remote) = match connected {
            Ok(parts) => parts,
            Err(e) => {
                trace!(endpoint = %transport, error = %e, "Bus: connect failed, retrying");
                if backoff(interval, &mut shutdown).await {
                    continue;
                }
                break;
            }
        };

        let peer = inner.next_peer.fetch_add(1, Ordering::Relaxed);
        {
            let mut socket = inner.socket.lock().await;
            // Announce ourselves so the server learns about this peer.
            if let Err(e) = write_frames(&mut writer, &encode_frame(&[], false)).await {
                debug!(error = %e, "Bus: probe failed, reconnecting");
                drop(socket);
                if backoff(interval, &mut shutdown).await {
                    continue;
                }
                break;
            }
            socket.peers.insert(peer, PeerLink { writer, remote: remote.clone() });
        }
        inner.connected.send_replace(true);
        info!(%remote, "Bus: connected");

        let mut assembler = FrameAssembler::new(max as usize);
        loop {
            let frame = tokio::select! {
                _ = shutdown.changed() => break 'connection,
                frame = read_frame(&mut reader, max) => frame,
            };
            let fault = match frame {
                Ok(Some(frame)) => match assembler.push(frame) {
                    Ok(Assembled::Complete(payload)) => {
                        inner.handle_payload(payload, None).await;
                        continue;
                    }
                    Ok(Assembled::Probe) => {
                        debug!("Bus: server probe");
                        continue;
                    }
                    Ok(Assembled::Pending) => continue,
                    Err(e) => e,
                },
                Ok(None) => {
                    info!(%remote, "Bus: connection closed, reconnecting");
                    break;
                }
                Err(WireError::Io(e)) => {
                    warn!(%remote, error = %e, "Bus: connection lost, reconnecting");
                    break;
                }
                Err(e) => e,
            };
            error!(%remote, error = %fault, "Bus: protocol fault, deactivating");
            break 'connection;
        }

        inner.connected.send_replace(false);
        inner.drop_peer(peer).await;
        if !backoff(interval, &mut shutdown).await {
            break;
        }
    }

    inner.teardown().await;
    debug!("Bus: client reader stopped");
}
