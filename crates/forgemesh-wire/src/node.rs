//! MeshNode — TCP server and client for the ForgeMesh wire protocol.
//!
//! A [`MeshNode`] binds a local TCP listener, dials configured bootstrap
//! peers, and keeps one reader task and one writer task per open socket.
//! Writes go through an unbounded queue, so [`MeshNode::send`] and
//! [`MeshNode::broadcast`] never block.
//!
//! A freshly opened socket carries no identity. It is bound to a peer node ID
//! when the first frame arrives, from that frame's `sourceNodeId`; this works
//! the same for sockets we accepted and sockets we dialed.
//!
//! Inbound frames are decoded and handed to every handler registered for the
//! frame's type (see [`crate::handler`]), then published as
//! [`NodeEvent::Message`].

use crate::error::{HandlerError, WireError};
use crate::event::{NodeEvent, EVENT_CHANNEL_CAPACITY};
use crate::handler::{run_handlers, FnHandler, MessageHandler};
use crate::message::*;
use crate::registry::PeerRegistry;

use async_trait::async_trait;
use dashmap::DashMap;
use forgemesh_types::config::NodeConfig;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch, Notify};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// How long a closing connection may spend flushing queued frames.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// How long `stop()` waits for connection tasks before aborting them.
const STOP_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Back-off after a failed `accept()`.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_secs(1);

type HandlerMap = HashMap<MessageType, Vec<Arc<dyn MessageHandler>>>;

/// Public identity of a node, as carried by its announce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub node_id: String,
    pub host: String,
    pub port: u16,
    pub agents: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Inbound,
    Outbound,
}

/// Write side of one socket, shared between the maps and the reader task.
#[derive(Clone)]
struct Connection {
    id: u64,
    remote_addr: SocketAddr,
    direction: Direction,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    close: Arc<Notify>,
    /// Peer node ID, set once the first frame arrives.
    peer: Arc<OnceLock<String>>,
}

impl Connection {
    fn is_open(&self) -> bool {
        !self.outbound.is_closed()
    }

    fn enqueue(&self, frame: Vec<u8>) -> bool {
        self.outbound.send(frame).is_ok()
    }

    fn close(&self) {
        self.close.notify_one();
    }
}

/// Tasks that only exist between `start()` and `stop()`.
struct Runtime {
    shutdown_tx: watch::Sender<bool>,
    heartbeat: JoinHandle<()>,
    accept: JoinHandle<()>,
}

struct NodeInner {
    config: NodeConfig,
    registry: PeerRegistry,
    local_agents: RwLock<BTreeSet<String>>,
    /// Sockets bound to a peer identity, keyed by peer node ID.
    connections: DashMap<String, Connection>,
    /// Every live socket, bound or not, keyed by connection ID.
    sockets: DashMap<u64, Connection>,
    connection_tasks: Mutex<JoinSet<()>>,
    handlers: RwLock<HandlerMap>,
    events: broadcast::Sender<NodeEvent>,
    runtime: tokio::sync::Mutex<Option<Runtime>>,
    local_addr: RwLock<Option<SocketAddr>>,
    next_connection_id: AtomicU64,
}

/// A participant in the peer mesh.
///
/// Cloning is cheap; every clone drives the same node.
#[derive(Clone)]
pub struct MeshNode {
    inner: Arc<NodeInner>,
}

impl MeshNode {
    /// Create a node with the built-in `announce`, `heartbeat`, and
    /// `agent:list` handlers. Nothing is bound until [`start`](Self::start).
    pub fn new(config: NodeConfig) -> Self {
        let registry = PeerRegistry::with_stale_timeout(config.stale_timeout());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let node = Self {
            inner: Arc::new(NodeInner {
                config,
                registry,
                local_agents: RwLock::new(BTreeSet::new()),
                connections: DashMap::new(),
                sockets: DashMap::new(),
                connection_tasks: Mutex::new(JoinSet::new()),
                handlers: RwLock::new(HashMap::new()),
                events,
                runtime: tokio::sync::Mutex::new(None),
                local_addr: RwLock::new(None),
                next_connection_id: AtomicU64::new(1),
            }),
        };

        node.on(MessageType::Announce, Arc::new(AnnounceHandler))
            .on(MessageType::Heartbeat, Arc::new(HeartbeatHandler))
            .on(MessageType::AgentList, Arc::new(AgentListHandler));
        node
    }

    pub fn node_id(&self) -> &str {
        &self.inner.config.node_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.inner.registry
    }

    /// The bound listener address while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_running(&self) -> bool {
        self.local_addr().is_some()
    }

    /// Subscribe to node events.
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.inner.events.subscribe()
    }

    pub(crate) fn emit(&self, event: NodeEvent) {
        let _ = self.inner.events.send(event);
    }

    /// Bind the listener, dial bootstrap peers, and start the heartbeat loop.
    ///
    /// A bootstrap peer that cannot be reached is logged and skipped.
    /// Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr, WireError> {
        let mut runtime = self.inner.runtime.lock().await;
        if runtime.is_some() {
            return Err(WireError::AlreadyRunning);
        }

        for warning in self.inner.config.validate() {
            warn!(node_id = %self.node_id(), "Config: {warning}");
        }

        let listener =
            TcpListener::bind((self.inner.config.host.as_str(), self.inner.config.port)).await?;
        let local_addr = listener.local_addr()?;
        *self.inner.local_addr.write().unwrap_or_else(|e| e.into_inner()) = Some(local_addr);
        info!(node_id = %self.node_id(), addr = %local_addr, "Mesh node listening");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let accept = tokio::spawn(self.clone().accept_loop(listener, shutdown_rx.clone()));

        for peer in &self.inner.config.bootstrap_peers {
            if let Err(e) = self.connect_to_peer(&peer.host, peer.port).await {
                warn!(peer = %peer, error = %e, "Failed to connect to bootstrap peer");
            }
        }

        let heartbeat = tokio::spawn(self.clone().heartbeat_loop(shutdown_rx));
        *runtime = Some(Runtime {
            shutdown_tx,
            heartbeat,
            accept,
        });

        self.emit(NodeEvent::Started {
            node_id: self.node_id().to_string(),
            addr: local_addr,
        });
        Ok(local_addr)
    }

    /// Shut the node down. Safe to call when already stopped.
    ///
    /// The heartbeat loop is stopped before any socket is closed so no beat
    /// is written to a closing connection.
    pub async fn stop(&self) {
        let Some(runtime) = self.inner.runtime.lock().await.take() else {
            return;
        };

        let _ = runtime.shutdown_tx.send(true);
        let _ = runtime.heartbeat.await;
        // The accept loop listens on the same signal; once it returns the
        // listener is closed and no new socket can appear.
        let _ = runtime.accept.await;

        let sockets: Vec<Connection> = self
            .inner
            .sockets
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for conn in &sockets {
            conn.close();
        }
        drop(sockets);

        let mut tasks = {
            let mut guard = self
                .inner
                .connection_tasks
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *guard, JoinSet::new())
        };
        let drained = tokio::time::timeout(STOP_DRAIN_TIMEOUT, async {
            while tasks.join_next().await.is_some() {}
        })
        .await
        .is_ok();
        if !drained {
            warn!(node_id = %self.node_id(), "Connection tasks did not finish in time, aborting");
            tasks.shutdown().await;
        }

        *self.inner.local_addr.write().unwrap_or_else(|e| e.into_inner()) = None;
        info!(node_id = %self.node_id(), "Mesh node stopped");
        self.emit(NodeEvent::Stopped {
            node_id: self.node_id().to_string(),
        });
    }

    /// Dial a peer and announce ourselves on the new connection.
    ///
    /// Fails on timeout or transport error; there is no retry at this layer.
    pub async fn connect_to_peer(&self, host: &str, port: u16) -> Result<(), WireError> {
        let timeout = self.inner.config.connection_timeout();
        info!(node_id = %self.node_id(), peer = %format!("{host}:{port}"), "Connecting to peer");

        let stream = dial(
            TcpStream::connect((host, port)),
            format!("{host}:{port}"),
            timeout,
        )
        .await?;
        let remote_addr = stream.peer_addr()?;
        let greeting = encode_message(&self.announce_message(None))?;
        self.spawn_connection(stream, remote_addr, Direction::Outbound, Some(greeting));
        Ok(())
    }

    /// Host an agent locally and tell every peer.
    pub fn register_agent(&self, agent_id: impl Into<String>) {
        let agent_id = agent_id.into();
        debug!(node_id = %self.node_id(), agent = %agent_id, "Registering local agent");
        self.inner
            .local_agents
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(agent_id);
        self.broadcast(&self.announce_message(None));
    }

    /// Stop hosting an agent and tell every peer.
    pub fn unregister_agent(&self, agent_id: &str) {
        debug!(node_id = %self.node_id(), agent = %agent_id, "Unregistering local agent");
        self.inner
            .local_agents
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(agent_id);
        self.broadcast(&self.announce_message(None));
    }

    pub fn local_agents(&self) -> Vec<String> {
        let agents = self.inner.local_agents.read().unwrap_or_else(|e| e.into_inner());
        agents.iter().cloned().collect()
    }

    pub fn is_local_agent(&self, agent_id: &str) -> bool {
        let agents = self.inner.local_agents.read().unwrap_or_else(|e| e.into_inner());
        agents.contains(agent_id)
    }

    pub fn info(&self) -> NodeInfo {
        NodeInfo {
            node_id: self.node_id().to_string(),
            host: self.inner.config.host.clone(),
            port: self.advertised_port(),
            agents: self.local_agents(),
        }
    }

    /// Peers we currently hold a bound, open connection to.
    pub fn connected_peer_ids(&self) -> Vec<String> {
        self.inner
            .connections
            .iter()
            .filter(|entry| entry.value().is_open())
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Queue a message on the connection to `target_node_id`.
    ///
    /// Returns `false` when no open connection exists. Never blocks and
    /// never confirms delivery.
    pub fn send(&self, target_node_id: &str, message: &MeshMessage) -> bool {
        let Some(conn) = self
            .inner
            .connections
            .get(target_node_id)
            .map(|entry| entry.value().clone())
        else {
            return false;
        };
        if !conn.is_open() {
            return false;
        }
        match encode_message(message) {
            Ok(frame) => conn.enqueue(frame),
            Err(e) => {
                warn!(peer = %target_node_id, error = %e, "Failed to encode message");
                false
            }
        }
    }

    /// Queue a message on every open connection. Returns how many accepted it.
    pub fn broadcast(&self, message: &MeshMessage) -> usize {
        let frame = match encode_message(message) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(message_type = %message.message_type(), error = %e, "Failed to encode broadcast");
                return 0;
            }
        };
        let targets: Vec<Connection> = self
            .inner
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        targets
            .iter()
            .filter(|conn| conn.is_open() && conn.enqueue(frame.clone()))
            .count()
    }

    /// Register a handler for a message type. Handlers run in registration order.
    pub fn on(&self, message_type: MessageType, handler: Arc<dyn MessageHandler>) -> &Self {
        self.inner
            .handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(message_type)
            .or_default()
            .push(handler);
        self
    }

    /// Register a synchronous closure as a handler.
    pub fn on_fn<F>(&self, message_type: MessageType, handler: F) -> &Self
    where
        F: Fn(&MeshNode, &MeshMessage) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.on(message_type, Arc::new(FnHandler(handler)))
    }

    /// Broadcast a heartbeat and prune stale peers.
    ///
    /// Runs on every heartbeat tick; returns the peers that went stale.
    pub fn heartbeat_tick(&self) -> Vec<String> {
        let beat = MeshMessage::new(
            MeshPayload::Heartbeat {
                node_id: self.node_id().to_string(),
                timestamp: now_millis(),
            },
            self.node_id(),
        );
        let sent = self.broadcast(&beat);
        let stale = self.inner.registry.prune_stale();
        debug!(node_id = %self.node_id(), sent, stale = stale.len(), "Heartbeat tick");
        if !stale.is_empty() {
            info!(node_id = %self.node_id(), peers = ?stale, "Marked stale peers disconnected");
        }
        stale
    }

    /// Our announce, optionally addressed to one peer.
    pub fn announce_message(&self, target: Option<&str>) -> MeshMessage {
        let info = self.info();
        let message = MeshMessage::new(
            MeshPayload::Announce(AnnouncePayload {
                node_id: info.node_id,
                host: info.host,
                port: info.port,
                agents: info.agents,
            }),
            self.node_id(),
        );
        match target {
            Some(target) => message.with_target(target),
            None => message,
        }
    }

    fn advertised_port(&self) -> u16 {
        self.local_addr()
            .map(|addr| addr.port())
            .unwrap_or(self.inner.config.port)
    }

    /// Run every handler for the message's type, then publish it.
    pub(crate) async fn dispatch(&self, message: &MeshMessage) {
        let handlers: Vec<Arc<dyn MessageHandler>> = self
            .inner
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&message.message_type())
            .cloned()
            .unwrap_or_default();

        debug!(
            node_id = %self.node_id(),
            message_type = %message.message_type(),
            source = %message.source_node_id(),
            handlers = handlers.len(),
            "Dispatching message"
        );
        run_handlers(self, &handlers, message).await;
        self.emit(NodeEvent::Message(message.clone()));
    }

    fn spawn_connection(
        &self,
        stream: TcpStream,
        remote_addr: SocketAddr,
        direction: Direction,
        greeting: Option<Vec<u8>>,
    ) {
        let (reader, writer) = stream.into_split();
        let (outbound, rx) = mpsc::unbounded_channel();
        let conn = Connection {
            id: self.inner.next_connection_id.fetch_add(1, Ordering::Relaxed),
            remote_addr,
            direction,
            outbound,
            close: Arc::new(Notify::new()),
            peer: Arc::new(OnceLock::new()),
        };
        if let Some(frame) = greeting {
            conn.enqueue(frame);
        }
        self.inner.sockets.insert(conn.id, conn.clone());
        debug!(
            node_id = %self.node_id(),
            remote = %remote_addr,
            direction = ?direction,
            connection = conn.id,
            "Connection opened"
        );

        let node = self.clone();
        let mut tasks = self
            .inner
            .connection_tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            node.run_connection(reader, writer, rx, conn).await;
        });
    }

    async fn run_connection(
        self,
        mut reader: OwnedReadHalf,
        writer: OwnedWriteHalf,
        rx: mpsc::UnboundedReceiver<Vec<u8>>,
        conn: Connection,
    ) {
        let mut writer_task = tokio::spawn(write_loop(writer, rx, conn.remote_addr));
        let bound = self.read_loop(&mut reader, &conn).await;
        self.release_connection(&conn, bound);

        // With every sender gone the writer flushes what is queued and exits.
        drop(conn);
        if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer_task)
            .await
            .is_err()
        {
            writer_task.abort();
        }
    }

    /// Read frames until the socket closes or `close()` is requested.
    /// Returns the peer identity the socket was bound to, if any.
    async fn read_loop(&self, reader: &mut OwnedReadHalf, conn: &Connection) -> Option<String> {
        let mut bound: Option<String> = None;
        loop {
            let frame = tokio::select! {
                _ = conn.close.notified() => {
                    debug!(remote = %conn.remote_addr, "Closing connection");
                    break;
                }
                frame = read_frame(reader) => frame,
            };

            let body = match frame {
                Ok(body) => body,
                Err(WireError::ConnectionClosed) => break,
                Err(e) => {
                    debug!(remote = %conn.remote_addr, error = %e, "Connection ended");
                    break;
                }
            };

            let message = match decode_message(&body) {
                Ok(message) => message,
                Err(e) => {
                    warn!(remote = %conn.remote_addr, error = %e, "Dropping malformed frame");
                    continue;
                }
            };

            self.bind_connection(&mut bound, conn, &message);
            self.dispatch(&message).await;
        }
        bound
    }

    /// Associate the socket with the sender's node ID.
    fn bind_connection(&self, bound: &mut Option<String>, conn: &Connection, message: &MeshMessage) {
        let source = message.source_node_id();
        if bound.is_none() {
            debug!(
                remote = %conn.remote_addr,
                peer = %source,
                connection = conn.id,
                "Connection bound to peer"
            );
            *bound = Some(source.to_string());
            let _ = conn.peer.set(source.to_string());
            // Answer the dialer's announce so both sides learn each other.
            if conn.direction == Direction::Inbound {
                match encode_message(&self.announce_message(Some(source))) {
                    Ok(frame) => {
                        conn.enqueue(frame);
                    }
                    Err(e) => warn!(peer = %source, error = %e, "Failed to encode announce"),
                }
            }
        } else if bound.as_deref() != Some(source) {
            debug!(
                remote = %conn.remote_addr,
                bound = ?bound,
                source = %source,
                "Frame source differs from bound peer"
            );
            return;
        }

        if let Some(peer) = bound.as_deref() {
            if !self.inner.connections.contains_key(peer) {
                self.inner
                    .connections
                    .entry(peer.to_string())
                    .or_insert_with(|| conn.clone());
            }
        }
    }

    fn release_connection(&self, conn: &Connection, bound: Option<String>) {
        self.inner.sockets.remove(&conn.id);
        let Some(peer) = bound else {
            debug!(remote = %conn.remote_addr, "Unbound connection closed");
            return;
        };
        // Another socket to the same peer may own the map entry; leave it be.
        if self
            .inner
            .connections
            .remove_if(&peer, |_, owner| owner.id == conn.id)
            .is_none()
        {
            return;
        }

        let successor = self
            .inner
            .sockets
            .iter()
            .find(|entry| {
                let other = entry.value();
                other.id != conn.id && other.is_open() && other.peer.get() == Some(&peer)
            })
            .map(|entry| entry.value().clone());
        if let Some(successor) = successor {
            debug!(
                peer = %peer,
                from = conn.id,
                to = successor.id,
                "Connection ownership moved"
            );
            self.inner.connections.entry(peer).or_insert(successor);
        } else {
            self.inner.registry.disconnect(&peer);
            info!(node_id = %self.node_id(), peer = %peer, "Peer disconnected");
            self.emit(NodeEvent::PeerDisconnected { node_id: peer });
        }
    }

    async fn accept_loop(self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    debug!(node_id = %self.node_id(), "Accept loop: shutdown signal received");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!(node_id = %self.node_id(), remote = %addr, "Accepted connection");
                        self.spawn_connection(stream, addr, Direction::Inbound, None);
                    }
                    Err(e) => {
                        error!(node_id = %self.node_id(), error = %e, "Accept error");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
            }
        }
    }

    async fn heartbeat_loop(self, mut shutdown: watch::Receiver<bool>) {
        let period = self.inner.config.heartbeat_interval();
        if period.is_zero() {
            let _ = shutdown.changed().await;
            return;
        }

        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        // A slow tick delays the next one instead of queueing a burst.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    debug!(node_id = %self.node_id(), "Heartbeat loop: shutdown signal received");
                    break;
                }
            }
            self.heartbeat_tick();
        }
    }
}

/// Await a connect attempt, giving up after `timeout`.
async fn dial<F>(connect: F, addr: String, timeout: Duration) -> Result<TcpStream, WireError>
where
    F: std::future::Future<Output = std::io::Result<TcpStream>>,
{
    match tokio::time::timeout(timeout, connect).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(WireError::ConnectionTimeout {
            addr,
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

/// Drain queued frames onto the socket until every sender is dropped.
async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    remote_addr: SocketAddr,
) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = writer.write_all(&frame).await {
            debug!(remote = %remote_addr, error = %e, "Write failed");
            return;
        }
    }
    let _ = writer.shutdown().await;
}

/// Read one framed body (4-byte length + JSON).
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(WireError::ConnectionClosed);
        }
        Err(e) => return Err(WireError::Io(e)),
    }

    let len = decode_length(&header);
    if len > MAX_MESSAGE_SIZE {
        return Err(WireError::MessageTooLarge {
            size: len,
            max: MAX_MESSAGE_SIZE,
        });
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

/// `announce`: record the peer and tell subscribers it is connected.
struct AnnounceHandler;

#[async_trait]
impl MessageHandler for AnnounceHandler {
    async fn handle(&self, node: &MeshNode, message: &MeshMessage) -> Result<(), HandlerError> {
        let MeshPayload::Announce(announce) = message.payload() else {
            return Ok(());
        };
        info!(
            node_id = %node.node_id(),
            peer = %announce.node_id,
            agents = announce.agents.len(),
            "Peer announced"
        );
        node.registry().register(announce.clone().into());
        if let Some(peer) = node.registry().get(&announce.node_id) {
            node.emit(NodeEvent::PeerConnected(peer));
        }
        Ok(())
    }
}

/// `heartbeat`: refresh the sender's liveness.
struct HeartbeatHandler;

#[async_trait]
impl MessageHandler for HeartbeatHandler {
    async fn handle(&self, node: &MeshNode, message: &MeshMessage) -> Result<(), HandlerError> {
        node.registry().heartbeat(message.source_node_id());
        Ok(())
    }
}

/// `agent:list`: reply with our announce.
struct AgentListHandler;

#[async_trait]
impl MessageHandler for AgentListHandler {
    async fn handle(&self, node: &MeshNode, message: &MeshMessage) -> Result<(), HandlerError> {
        let requester = message.source_node_id();
        let reply = node.announce_message(Some(requester));
        if node.send(requester, &reply) {
            Ok(())
        } else {
            Err(HandlerError::rejected(format!(
                "no open connection to {requester} for agent list reply"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::PeerStatus;
    use std::sync::atomic::AtomicUsize;

    fn config(node_id: &str) -> NodeConfig {
        NodeConfig {
            node_id: node_id.to_string(),
            host: "127.0.0.1".to_string(),
            port: 0,
            connection_timeout_ms: 2_000,
            ..NodeConfig::default()
        }
    }

    async fn started(node_id: &str, agents: &[&str]) -> (MeshNode, SocketAddr) {
        let node = MeshNode::new(config(node_id));
        for agent in agents {
            node.register_agent(*agent);
        }
        let addr = node.start().await.unwrap();
        (node, addr)
    }

    async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
        for _ in 0..200 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        condition()
    }

    fn announce_from(node_id: &str, agents: &[&str]) -> MeshMessage {
        MeshMessage::new(
            MeshPayload::Announce(AnnouncePayload {
                node_id: node_id.to_string(),
                host: "127.0.0.1".to_string(),
                port: 1,
                agents: agents.iter().map(|s| s.to_string()).collect(),
            }),
            node_id,
        )
    }

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_start_and_stop_idempotent() {
        let node = MeshNode::new(config("solo"));
        assert!(!node.is_running());
        let addr = node.start().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(node.local_addr(), Some(addr));
        assert_eq!(node.info().port, addr.port());

        node.stop().await;
        assert!(!node.is_running());
        node.stop().await;
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let (node, _) = started("twice", &[]).await;
        assert!(matches!(node.start().await, Err(WireError::AlreadyRunning)));
        node.stop().await;
    }

    #[tokio::test]
    async fn test_connect_registers_both_sides() {
        let (a, _) = started("node-a", &["writer"]).await;
        let (b, b_addr) = started("node-b", &["reader"]).await;

        a.connect_to_peer("127.0.0.1", b_addr.port()).await.unwrap();

        assert!(eventually(|| b.registry().get("node-a").is_some()).await);
        let peer = b.registry().get("node-a").unwrap();
        assert_eq!(peer.status, PeerStatus::Connected);
        assert_eq!(peer.agents, vec!["writer"]);

        // The accepting side answers with its own announce.
        assert!(eventually(|| a.registry().get("node-b").is_some()).await);
        assert_eq!(a.registry().get("node-b").unwrap().agents, vec!["reader"]);
        assert!(eventually(|| a.connected_peer_ids() == vec!["node-b".to_string()]).await);
        assert_eq!(b.connected_peer_ids(), vec!["node-a".to_string()]);

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn test_connect_refused_is_an_error() {
        let node = MeshNode::new(config("dialer"));
        let port = closed_port().await;
        assert!(node.connect_to_peer("127.0.0.1", port).await.is_err());
    }

    #[tokio::test]
    async fn test_dial_times_out() {
        let started = std::time::Instant::now();
        let result = dial(
            std::future::pending::<std::io::Result<TcpStream>>(),
            "10.255.255.1:9".to_string(),
            Duration::from_millis(50),
        )
        .await;
        match result {
            Err(WireError::ConnectionTimeout { addr, timeout_ms }) => {
                assert_eq!(addr, "10.255.255.1:9");
                assert_eq!(timeout_ms, 50);
            }
            other => panic!("Expected ConnectionTimeout, got {other:?}"),
        }
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_connect_to_unroutable_host_gives_up() {
        let mut cfg = config("impatient");
        cfg.connection_timeout_ms = 50;
        let node = MeshNode::new(cfg);

        let result = tokio::time::timeout(
            Duration::from_secs(1),
            node.connect_to_peer("10.255.255.1", 9),
        )
        .await
        .expect("connect_to_peer should give up within its timeout");
        // Hosts without a route fail fast with an I/O error instead.
        match result {
            Err(WireError::ConnectionTimeout { timeout_ms, .. }) => assert_eq!(timeout_ms, 50),
            Err(WireError::Io(_)) => {}
            other => panic!("Expected a connect failure, got {other:?}"),
        }
        assert!(node.connected_peer_ids().is_empty());
    }

    #[tokio::test]
    async fn test_bootstrap_failure_is_not_fatal() {
        let port = closed_port().await;
        let mut cfg = config("bootstrapper");
        cfg.bootstrap_peers = vec![forgemesh_types::BootstrapPeer::new("127.0.0.1", port)];
        let node = MeshNode::new(cfg);
        assert!(node.start().await.is_ok());
        node.stop().await;
    }

    #[tokio::test]
    async fn test_bootstrap_connects_on_start() {
        let (b, b_addr) = started("seed", &["oracle"]).await;
        let mut cfg = config("joiner");
        cfg.bootstrap_peers = vec![forgemesh_types::BootstrapPeer::new("127.0.0.1", b_addr.port())];
        let a = MeshNode::new(cfg);
        a.start().await.unwrap();

        assert!(eventually(|| b.registry().get("joiner").is_some()).await);
        assert!(eventually(|| !a.registry().find_peers_with_agent("oracle").is_empty()).await);

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn test_send_without_connection_returns_false() {
        let node = MeshNode::new(config("lonely"));
        let msg = MeshMessage::new(
            MeshPayload::Discover {
                node_id: "lonely".to_string(),
            },
            "lonely",
        );
        assert!(!node.send("nobody", &msg));
        assert_eq!(node.broadcast(&msg), 0);
    }

    #[tokio::test]
    async fn test_handlers_isolated_and_ordered() {
        let node = MeshNode::new(config("isolated"));
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = order.clone();
        node.on_fn(MessageType::Discover, move |_, _| {
            o.lock().unwrap().push("first");
            Err(HandlerError::rejected("boom"))
        });
        let o = order.clone();
        node.on_fn(MessageType::Discover, move |_, _| {
            o.lock().unwrap().push("second");
            panic!("handler exploded");
        });
        let o = order.clone();
        node.on_fn(MessageType::Discover, move |_, _| {
            o.lock().unwrap().push("third");
            Ok(())
        });

        let mut events = node.subscribe();
        let msg = MeshMessage::new(
            MeshPayload::Discover {
                node_id: "x".to_string(),
            },
            "x",
        );
        node.dispatch(&msg).await;

        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
        match events.try_recv().unwrap() {
            NodeEvent::Message(received) => assert_eq!(received.id(), msg.id()),
            other => panic!("Expected Message event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_announce_handler_registers_and_emits() {
        let node = MeshNode::new(config("listener"));
        let mut events = node.subscribe();
        node.dispatch(&announce_from("remote", &["coder"])).await;

        let peer = node.registry().get("remote").unwrap();
        assert_eq!(peer.agents, vec!["coder"]);
        let names: Vec<&str> = std::iter::from_fn(|| events.try_recv().ok())
            .map(|e| e.name())
            .collect();
        assert_eq!(names, vec!["peer:connected", "message"]);
    }

    #[tokio::test]
    async fn test_malformed_frame_keeps_connection_open() {
        let (node, addr) = started("tolerant", &[]).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        let garbage = b"{not json";
        stream
            .write_all(&(garbage.len() as u32).to_be_bytes())
            .await
            .unwrap();
        stream.write_all(garbage).await.unwrap();
        let frame = encode_message(&announce_from("raw-client", &["a"])).unwrap();
        stream.write_all(&frame).await.unwrap();

        assert!(eventually(|| node.registry().get("raw-client").is_some()).await);
        node.stop().await;
    }

    #[tokio::test]
    async fn test_inbound_announce_gets_reply_and_heartbeats() {
        let (node, addr) = started("server", &["svc"]).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let frame = encode_message(&announce_from("client", &[])).unwrap();
        stream.write_all(&frame).await.unwrap();

        let reply = decode_message(&read_frame(&mut stream).await.unwrap()).unwrap();
        match reply.payload() {
            MeshPayload::Announce(a) => {
                assert_eq!(a.node_id, "server");
                assert_eq!(a.agents, vec!["svc"]);
                assert_eq!(reply.target_node_id(), Some("client"));
            }
            other => panic!("Expected announce, got {other:?}"),
        }

        assert!(eventually(|| node.connected_peer_ids().len() == 1).await);
        node.heartbeat_tick();
        let beat = decode_message(&read_frame(&mut stream).await.unwrap()).unwrap();
        assert_eq!(beat.message_type(), MessageType::Heartbeat);
        assert_eq!(beat.source_node_id(), "server");

        node.stop().await;
    }

    #[tokio::test]
    async fn test_agent_list_request_answered() {
        let (node, addr) = started("lister", &["alpha", "beta"]).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = MeshMessage::new(
            MeshPayload::AgentList {
                node_id: "asker".to_string(),
            },
            "asker",
        );
        stream
            .write_all(&encode_message(&request).unwrap())
            .await
            .unwrap();

        // First frame is the announce answering the new binding, second the
        // explicit agent list reply.
        for _ in 0..2 {
            let reply = decode_message(&read_frame(&mut stream).await.unwrap()).unwrap();
            match reply.payload() {
                MeshPayload::Announce(a) => assert_eq!(a.agents, vec!["alpha", "beta"]),
                other => panic!("Expected announce, got {other:?}"),
            }
        }
        node.stop().await;
    }

    #[tokio::test]
    async fn test_socket_close_disconnects_peer() {
        let (node, addr) = started("watcher", &[]).await;
        let mut events = node.subscribe();
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(&encode_message(&announce_from("fleeting", &[])).unwrap())
            .await
            .unwrap();
        assert!(eventually(|| node.connected_peer_ids().len() == 1).await);
        drop(stream);

        assert!(
            eventually(|| node
                .registry()
                .get("fleeting")
                .map(|p| p.status == PeerStatus::Disconnected)
                .unwrap_or(false))
            .await
        );
        assert!(node.connected_peer_ids().is_empty());

        let mut saw_disconnect = false;
        while let Ok(event) = events.try_recv() {
            if let NodeEvent::PeerDisconnected { node_id } = event {
                assert_eq!(node_id, "fleeting");
                saw_disconnect = true;
            }
        }
        assert!(saw_disconnect);
        node.stop().await;
    }

    #[tokio::test]
    async fn test_broadcast_skips_dropped_peer() {
        let (node, addr) = started("fanout", &[]).await;
        let mut left = TcpStream::connect(addr).await.unwrap();
        left.write_all(&encode_message(&announce_from("left", &[])).unwrap())
            .await
            .unwrap();
        let mut right = TcpStream::connect(addr).await.unwrap();
        right
            .write_all(&encode_message(&announce_from("right", &[])).unwrap())
            .await
            .unwrap();
        assert!(eventually(|| node.connected_peer_ids().len() == 2).await);

        drop(left);
        assert!(eventually(|| node.connected_peer_ids() == vec!["right".to_string()]).await);

        let msg = MeshMessage::new(
            MeshPayload::Discover {
                node_id: "fanout".to_string(),
            },
            "fanout",
        );
        assert_eq!(node.broadcast(&msg), 1);
        assert!(!node.send("left", &msg));

        // The announce reply comes first.
        loop {
            let frame = decode_message(&read_frame(&mut right).await.unwrap()).unwrap();
            if frame.message_type() == MessageType::Discover {
                assert_eq!(frame.id(), msg.id());
                break;
            }
        }
        node.stop().await;
    }

    #[tokio::test]
    async fn test_broadcast_ignores_closed_map_entry() {
        let node = MeshNode::new(config("stale-entry"));
        let entry = |id: u64| {
            let (outbound, rx) = mpsc::unbounded_channel();
            let conn = Connection {
                id,
                remote_addr: "127.0.0.1:1".parse().unwrap(),
                direction: Direction::Inbound,
                outbound,
                close: Arc::new(Notify::new()),
                peer: Arc::new(OnceLock::new()),
            };
            (conn, rx)
        };
        let (open, mut open_rx) = entry(1);
        let (closed, closed_rx) = entry(2);
        drop(closed_rx);
        node.inner.connections.insert("open".to_string(), open);
        node.inner.connections.insert("closed".to_string(), closed);

        let msg = MeshMessage::new(
            MeshPayload::Discover {
                node_id: "stale-entry".to_string(),
            },
            "stale-entry",
        );
        assert_eq!(node.broadcast(&msg), 1);
        assert!(!node.send("closed", &msg));
        assert_eq!(node.connected_peer_ids(), vec!["open".to_string()]);
        assert!(open_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_duplicate_socket_takes_over_on_close() {
        let (node, addr) = started("twin-host", &[]).await;
        let mut events = node.subscribe();

        let mut first = TcpStream::connect(addr).await.unwrap();
        first
            .write_all(&encode_message(&announce_from("twin", &[])).unwrap())
            .await
            .unwrap();
        read_frame(&mut first).await.unwrap();
        assert!(eventually(|| node.connected_peer_ids() == vec!["twin".to_string()]).await);
        let first_id = node.inner.connections.get("twin").unwrap().id;

        let mut second = TcpStream::connect(addr).await.unwrap();
        second
            .write_all(&encode_message(&announce_from("twin", &[])).unwrap())
            .await
            .unwrap();
        // The reply is queued after the socket is bound.
        read_frame(&mut second).await.unwrap();

        drop(first);
        assert!(
            eventually(|| node
                .inner
                .connections
                .get("twin")
                .map(|conn| conn.id != first_id)
                .unwrap_or(false))
            .await
        );
        assert_eq!(node.inner.sockets.len(), 1);
        assert_eq!(node.registry().get("twin").unwrap().status, PeerStatus::Connected);
        assert_eq!(node.connected_peer_ids(), vec!["twin".to_string()]);
        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, NodeEvent::PeerDisconnected { .. }));
        }

        let msg = MeshMessage::new(
            MeshPayload::Discover {
                node_id: "twin-host".to_string(),
            },
            "twin-host",
        );
        assert!(node.send("twin", &msg));
        let frame = decode_message(&read_frame(&mut second).await.unwrap()).unwrap();
        assert_eq!(frame.id(), msg.id());
        node.stop().await;
    }

    #[tokio::test]
    async fn test_register_agent_broadcasts_announce() {
        let (a, _) = started("host-a", &[]).await;
        let (b, b_addr) = started("host-b", &[]).await;
        a.connect_to_peer("127.0.0.1", b_addr.port()).await.unwrap();
        assert!(eventually(|| a.connected_peer_ids().len() == 1).await);

        a.register_agent("late-joiner");
        assert!(eventually(|| !b.registry().find_peers_with_agent("late-joiner").is_empty()).await);
        assert!(a.is_local_agent("late-joiner"));

        a.unregister_agent("late-joiner");
        assert!(eventually(|| b.registry().find_peers_with_agent("late-joiner").is_empty()).await);

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn test_stop_closes_connections() {
        let (a, _) = started("closer", &[]).await;
        let (b, b_addr) = started("remote-end", &[]).await;
        a.connect_to_peer("127.0.0.1", b_addr.port()).await.unwrap();
        assert!(eventually(|| b.connected_peer_ids().len() == 1).await);

        a.stop().await;
        assert!(a.connected_peer_ids().is_empty());
        assert!(
            eventually(|| b
                .registry()
                .get("closer")
                .map(|p| p.status == PeerStatus::Disconnected)
                .unwrap_or(false))
            .await
        );
        b.stop().await;
    }

    #[tokio::test]
    async fn test_heartbeat_loop_runs_on_interval() {
        let mut cfg = config("ticker");
        cfg.heartbeat_interval_ms = 20;
        cfg.stale_timeout_ms = 40;
        let node = MeshNode::new(cfg);
        node.dispatch(&announce_from("quiet-peer", &[])).await;
        node.start().await.unwrap();

        // The peer never heartbeats, so the loop's prune marks it stale.
        assert!(
            eventually(|| node
                .registry()
                .get("quiet-peer")
                .map(|p| p.status == PeerStatus::Disconnected)
                .unwrap_or(false))
            .await
        );
        node.stop().await;
    }

    #[tokio::test]
    async fn test_heartbeat_refreshes_registry() {
        let node = MeshNode::new(config("beat-target"));
        node.dispatch(&announce_from("beater", &[])).await;
        node.registry().disconnect("beater");

        let beat = MeshMessage::new(
            MeshPayload::Heartbeat {
                node_id: "beater".to_string(),
                timestamp: now_millis(),
            },
            "beater",
        );
        node.dispatch(&beat).await;
        assert_eq!(node.registry().get("beater").unwrap().status, PeerStatus::Connected);
    }

    #[tokio::test]
    async fn test_handler_count_for_custom_type() {
        let node = MeshNode::new(config("counter"));
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        node.on_fn(MessageType::Ack, move |_, _| {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let original = announce_from("peer", &[]);
        node.dispatch(&original.create_ack("peer")).await;
        node.dispatch(&original.create_ack("peer")).await;
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
