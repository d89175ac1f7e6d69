//! PeerNode — TCP listener, dialer and session supervisor.
//!
//! A [`PeerNode`] binds a local TCP listener and accepts connections from
//! other Ivy nodes. It also dials outward to candidates produced by
//! discovery. Every connection is claimed in the [`ConnectionRegistry`],
//! runs the encrypted handshake, is admitted to the [`PeerRegistry`], and
//! then runs as two tasks:
//!
//! - a **reader** that opens inbound envelopes and hands them to the
//!   [`MessageHandler`], enforcing the idle timeout;
//! - a **writer** that drains the session's outbound queue and emits
//!   heartbeats. It is the only task that writes to the stream.
//!
//! Both report into one channel watched by the session supervisor, which
//! tears the session down exactly once.

use crate::channel::{EncryptedChannel, EncryptedReader, EncryptedWriter, Role};
use crate::discovery::Candidate;
use crate::error::WireError;
use crate::frame::FramedChannel;
use crate::message::Envelope;
use crate::registry::{Admission, ConnectionRegistry, Outbound, PeerRegistry, PeerSession};

use async_trait::async_trait;
use ivy_types::config::{NodeConfig, SessionConfig};
use ivy_types::{Keypair, PeerId};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Interval, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

/// Text carried by periodic heartbeats.
pub const HEARTBEAT_MESSAGE: &str = "ping";

/// Configuration for a PeerNode.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Address to bind the listener on.
    pub listen_addr: SocketAddr,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    /// `None` disables outbound heartbeats.
    pub heartbeat_interval: Option<Duration>,
    /// `None` disables the idle timeout.
    pub idle_timeout: Option<Duration>,
    pub max_message_size: u64,
    pub outbound_queue: usize,
}

impl PeerConfig {
    fn with_session(listen_addr: SocketAddr, session: &SessionConfig) -> Self {
        Self {
            listen_addr,
            connect_timeout: session.connect_timeout(),
            handshake_timeout: session.handshake_timeout(),
            heartbeat_interval: session.heartbeat_interval(),
            idle_timeout: session.idle_timeout(),
            max_message_size: session.max_message_size,
            outbound_queue: session.outbound_queue,
        }
    }
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self::with_session(
            SocketAddr::from(([127, 0, 0, 1], 0)),
            &SessionConfig::default(),
        )
    }
}

impl From<&NodeConfig> for PeerConfig {
    fn from(config: &NodeConfig) -> Self {
        Self::with_session(config.listen_addr, &config.session)
    }
}

/// Application side of the node.
///
/// The PeerNode calls these as sessions come and go and as envelopes arrive.
/// Calls for one session are sequential and in wire order.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// An application envelope (`Heartbeat`, `Data`) arrived from `from`.
    async fn handle_message(&self, from: &PeerId, envelope: Envelope);

    /// A session passed the handshake and was admitted.
    async fn peer_connected(&self, _session: &PeerSession) {}

    /// A previously admitted session has been torn down.
    ///
    /// When two nodes dial each other at once, the losing session's call can
    /// arrive after `peer_connected` for the surviving one.
    async fn peer_disconnected(&self, _peer_id: &PeerId, _reason: &str) {}
}

/// The local network node — listens for connections and connects to peers.
pub struct PeerNode {
    config: PeerConfig,
    keypair: Keypair,
    connections: ConnectionRegistry,
    peers: PeerRegistry,
    handler: Arc<dyn MessageHandler>,
    /// Actual bound address (useful when binding to port 0).
    local_addr: SocketAddr,
    next_session_id: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
}

impl PeerNode {
    /// Bind the listener and start accepting connections.
    ///
    /// The returned task ends with `Ok(())` after [`PeerNode::shutdown`] and
    /// with [`WireError::ListenerFatal`] if the listener fails.
    pub async fn start(
        config: PeerConfig,
        keypair: Keypair,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(Arc<Self>, JoinHandle<Result<(), WireError>>), WireError> {
        let listener = TcpListener::bind(config.listen_addr)
            .await
            .map_err(WireError::ListenerFatal)?;
        let local_addr = listener.local_addr().map_err(WireError::ListenerFatal)?;

        info!(
            addr = %local_addr,
            peer = %keypair.peer_id(),
            "Listening for peers"
        );

        let (shutdown_tx, _) = watch::channel(false);
        let node = Arc::new(Self {
            config,
            keypair,
            connections: ConnectionRegistry::new(),
            peers: PeerRegistry::new(),
            handler,
            local_addr,
            next_session_id: AtomicU64::new(1),
            shutdown_tx,
        });

        let node_clone = Arc::clone(&node);
        let accept_handle = tokio::spawn(async move { node_clone.accept_loop(listener).await });

        Ok((node, accept_handle))
    }

    /// Get the actual bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_id(&self) -> &PeerId {
        self.keypair.peer_id()
    }

    pub fn peers(&self) -> &PeerRegistry {
        &self.peers
    }

    pub fn connections(&self) -> &ConnectionRegistry {
        &self.connections
    }

    /// Receiver that flips to `true` when the node shuts down.
    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Stop accepting, and close every session with a goodbye.
    pub fn shutdown(&self) {
        info!("Peer node shutting down");
        self.shutdown_tx.send_replace(true);
    }

    /// Dial `addr`, run the initiator handshake and start the session.
    ///
    /// `expected` is the identity the caller believes listens at `addr`; a
    /// different identity fails the handshake. Returns the remote identity
    /// once the session is admitted.
    pub async fn connect(
        self: &Arc<Self>,
        addr: SocketAddr,
        expected: Option<&PeerId>,
    ) -> Result<PeerId, WireError> {
        if self.is_shutting_down() {
            return Err(WireError::NotConnected("node is shutting down".into()));
        }
        if let Some(id) = expected {
            if self.peers.contains(id) {
                return Err(WireError::RegistryConflict(format!(
                    "already connected to peer {}",
                    id.short()
                )));
            }
        }

        // Claimed before the socket exists so concurrent dials of one
        // address cannot both proceed.
        let key = addr.to_string();
        if !self.connections.try_add(&key) {
            return Err(WireError::RegistryConflict(format!(
                "connection to {addr} already active"
            )));
        }
        let guard = SessionGuard::new(self.connections.clone(), self.peers.clone(), key);

        debug!(addr = %addr, "Dialing peer");
        let stream = match timeout(self.config.connect_timeout, TcpStream::connect(addr)).await {
            Ok(result) => result?,
            Err(_) => return Err(WireError::Timeout("connect")),
        };

        let established = self
            .establish(stream, addr, Role::Initiator, expected, guard)
            .await?;
        let peer_id = established.session.peer_id.clone();
        tokio::spawn(Arc::clone(self).supervise(established));
        Ok(peer_id)
    }

    /// Dial a discovery candidate unless it is already connected.
    pub async fn dial_candidate(self: &Arc<Self>, candidate: &Candidate) -> Result<(), WireError> {
        if let Some(id) = &candidate.peer_id {
            if id == self.peer_id() || self.peers.contains(id) {
                return Ok(());
            }
        }
        if self.connections.contains(&candidate.addr.to_string()) {
            return Ok(());
        }
        self.connect(candidate.addr, candidate.peer_id.as_ref())
            .await
            .map(|_| ())
    }

    /// Queue an envelope for one connected peer.
    pub async fn send(&self, peer_id: &PeerId, envelope: Envelope) -> Result<(), WireError> {
        let session = self
            .peers
            .get(peer_id)
            .ok_or_else(|| WireError::NotConnected(peer_id.to_string()))?;
        session.send(envelope).await
    }

    /// Queue an envelope for every connected peer. Returns how many sessions
    /// accepted it.
    pub async fn broadcast(&self, envelope: Envelope) -> usize {
        let mut delivered = 0;
        for session in self.peers.sessions() {
            match session.send(envelope.clone()).await {
                Ok(()) => delivered += 1,
                Err(e) => debug!(peer = %session.peer_id.short(), error = %e, "Broadcast skipped peer"),
            }
        }
        delivered
    }

    /// Say goodbye to a peer and close its session.
    pub async fn disconnect(&self, peer_id: &PeerId, reason: &str) -> Result<(), WireError> {
        let session = self
            .peers
            .get(peer_id)
            .ok_or_else(|| WireError::NotConnected(peer_id.to_string()))?;
        session.close(reason).await
    }

    /// Internal accept loop — runs in a spawned task.
    async fn accept_loop(self: Arc<Self>, listener: TcpListener) -> Result<(), WireError> {
        let mut shutdown = self.subscribe_shutdown();
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!(addr = %addr, "Accepted connection");
                        let node = Arc::clone(&self);
                        tokio::spawn(async move { node.handle_inbound(stream, addr).await });
                    }
                    Err(e) => {
                        error!(error = %e, "Listener failed");
                        return Err(WireError::ListenerFatal(e));
                    }
                },
                _ = shutdown.changed() => {
                    debug!("Accept loop stopped");
                    return Ok(());
                }
            }
        }
    }

    /// Handle a single inbound connection: handshake, admission, session.
    async fn handle_inbound(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let key = addr.to_string();
        if !self.connections.try_add(&key) {
            debug!(addr = %addr, "Duplicate inbound connection, closing");
            return;
        }
        let guard = SessionGuard::new(self.connections.clone(), self.peers.clone(), key);

        match self
            .establish(stream, addr, Role::Responder, None, guard)
            .await
        {
            Ok(established) => self.supervise(established).await,
            Err(e) => warn!(addr = %addr, error = %e, "Inbound handshake failed"),
        }
    }

    /// Handshake and admit one connection. Dropping `guard` on any error
    /// releases the connection entry and the socket.
    async fn establish(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
        role: Role,
        expected: Option<&PeerId>,
        mut guard: SessionGuard,
    ) -> Result<Established, WireError> {
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();
        let framed = FramedChannel::new(read_half, write_half, self.config.max_message_size);
        let mut channel = EncryptedChannel::new(framed, role);

        let peer_id = match timeout(
            self.config.handshake_timeout,
            channel.handshake(&self.keypair, expected, &self.peers),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(WireError::Timeout("handshake")),
        };

        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let (outbound_tx, outbound_rx) = mpsc::channel(self.config.outbound_queue);
        let session = PeerSession::new(peer_id.clone(), addr, role, session_id, outbound_tx);
        match self.peers.admit(self.peer_id(), session.clone()) {
            Admission::Admitted => {}
            Admission::Replaced(crossed) => {
                info!(
                    peer = %peer_id.short(),
                    kept = %role,
                    "Crossed dial, closing the other session"
                );
                tokio::spawn(async move {
                    let _ = crossed.close("superseded by crossed connection").await;
                });
            }
            Admission::Rejected => {
                return Err(WireError::RegistryConflict(format!(
                    "peer {} already has a live session",
                    peer_id.short()
                )));
            }
        }
        guard.admit(peer_id.clone(), session_id);

        let (reader, writer) = channel.into_split()?;
        info!(peer = %peer_id.short(), addr = %addr, role = %role, "Peer session established");

        Ok(Established {
            session,
            reader,
            writer,
            outbound: outbound_rx,
            guard,
        })
    }

    /// Run the reader and writer of an admitted session until either ends,
    /// then tear down.
    async fn supervise(self: Arc<Self>, established: Established) {
        let Established {
            session,
            reader,
            writer,
            outbound,
            guard,
        } = established;
        let peer_id = session.peer_id.clone();

        self.handler.peer_connected(&session).await;

        let (done_tx, mut done_rx) = mpsc::channel(2);
        let reader_task = tokio::spawn(read_loop(
            reader,
            peer_id.clone(),
            Arc::clone(&self.handler),
            self.config.idle_timeout,
            done_tx.clone(),
        ));
        let writer_task = tokio::spawn(write_loop(
            writer,
            outbound,
            self.config.heartbeat_interval,
            self.subscribe_shutdown(),
            done_tx,
        ));

        let end = done_rx
            .recv()
            .await
            .unwrap_or_else(|| Err(WireError::ConnectionClosed));

        reader_task.abort();
        writer_task.abort();
        let _ = reader_task.await;
        let _ = writer_task.await;
        drop(session);
        drop(guard);

        let reason = match &end {
            Ok(reason) => {
                info!(peer = %peer_id.short(), reason = %reason, "Peer session closed");
                reason.clone()
            }
            Err(WireError::ConnectionClosed) => {
                info!(peer = %peer_id.short(), "Peer closed the connection");
                "connection closed".to_string()
            }
            Err(e) => {
                warn!(peer = %peer_id.short(), error = %e, "Peer session failed");
                e.to_string()
            }
        };
        self.handler.peer_disconnected(&peer_id, &reason).await;
    }
}

type SessionReader = EncryptedReader<OwnedReadHalf>;
type SessionWriter = EncryptedWriter<OwnedWriteHalf>;

/// How a session task ended. `Ok` carries the reason for a clean close.
type SessionEnd = Result<String, WireError>;

struct Established {
    session: PeerSession,
    reader: SessionReader,
    writer: SessionWriter,
    outbound: mpsc::Receiver<Outbound>,
    guard: SessionGuard,
}

/// Releases a session's registry entries when dropped, on every exit path.
struct SessionGuard {
    connections: ConnectionRegistry,
    peers: PeerRegistry,
    addr_key: String,
    admitted: Option<(PeerId, u64)>,
}

impl SessionGuard {
    fn new(connections: ConnectionRegistry, peers: PeerRegistry, addr_key: String) -> Self {
        Self {
            connections,
            peers,
            addr_key,
            admitted: None,
        }
    }

    fn admit(&mut self, peer_id: PeerId, session_id: u64) {
        self.admitted = Some((peer_id, session_id));
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Some((peer_id, session_id)) = self.admitted.take() {
            self.peers.remove_session(&peer_id, session_id);
        }
        self.connections.remove(&self.addr_key);
        debug!(addr = %self.addr_key, "Session released");
    }
}

async fn read_loop(
    mut reader: SessionReader,
    peer_id: PeerId,
    handler: Arc<dyn MessageHandler>,
    idle_timeout: Option<Duration>,
    done: mpsc::Sender<SessionEnd>,
) {
    let end = read_until_closed(&mut reader, &peer_id, &*handler, idle_timeout).await;
    let _ = done.send(end).await;
}

async fn read_until_closed(
    reader: &mut SessionReader,
    peer_id: &PeerId,
    handler: &dyn MessageHandler,
    idle_timeout: Option<Duration>,
) -> SessionEnd {
    loop {
        let envelope = match idle_timeout {
            Some(limit) => match timeout(limit, reader.receive_message()).await {
                Ok(result) => result?,
                Err(_) => return Err(WireError::Timeout("idle")),
            },
            None => reader.receive_message().await?,
        };

        match envelope {
            Envelope::Goodbye(goodbye) => {
                return Ok(format!("remote said goodbye: {}", goodbye.reason));
            }
            Envelope::Handshake(_) => {
                return Err(WireError::Handshake(
                    "handshake received inside an established session".into(),
                ));
            }
            Envelope::EncryptedPayload(_) => {
                return Err(WireError::Decrypt("nested encrypted payload".into()));
            }
            other @ (Envelope::Heartbeat(_) | Envelope::Data(_)) => {
                trace!(peer = %peer_id.short(), kind = other.kind(), "Received message");
                handler.handle_message(peer_id, other).await;
            }
        }
    }
}

async fn write_loop(
    mut writer: SessionWriter,
    outbound: mpsc::Receiver<Outbound>,
    heartbeat_interval: Option<Duration>,
    shutdown: watch::Receiver<bool>,
    done: mpsc::Sender<SessionEnd>,
) {
    let end = write_until_closed(&mut writer, outbound, heartbeat_interval, shutdown).await;
    let _ = done.send(end).await;
}

async fn write_until_closed(
    writer: &mut SessionWriter,
    mut outbound: mpsc::Receiver<Outbound>,
    heartbeat_interval: Option<Duration>,
    mut shutdown: watch::Receiver<bool>,
) -> SessionEnd {
    let mut heartbeat = heartbeat_interval.map(|period| {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });

    loop {
        if *shutdown.borrow() {
            return say_goodbye(writer, "node shutting down").await;
        }
        tokio::select! {
            command = outbound.recv() => match command {
                Some(Outbound::Message(envelope)) => writer.send_message(&envelope).await?,
                Some(Outbound::Close(reason)) => return say_goodbye(writer, &reason).await,
                None => return Ok("session released".to_string()),
            },
            _ = next_tick(&mut heartbeat) => {
                writer.send_message(&Envelope::heartbeat(HEARTBEAT_MESSAGE)).await?;
            }
            _ = shutdown.changed() => {
                return say_goodbye(writer, "node shutting down").await;
            }
        }
    }
}

async fn say_goodbye(writer: &mut SessionWriter, reason: &str) -> SessionEnd {
    writer.send_message(&Envelope::goodbye(reason)).await?;
    let _ = writer.shutdown().await;
    Ok(reason.to_string())
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullHandler;

    #[async_trait]
    impl MessageHandler for NullHandler {
        async fn handle_message(&self, _from: &PeerId, _envelope: Envelope) {}
    }

    #[test]
    fn test_peer_config_default() {
        let config = PeerConfig::default();
        assert_eq!(config.listen_addr.port(), 0);
        assert_eq!(config.handshake_timeout, Duration::from_secs(10));
        assert_eq!(config.heartbeat_interval, Some(Duration::from_secs(15)));
        assert_eq!(config.outbound_queue, 64);
    }

    #[test]
    fn test_peer_config_from_node_config() {
        let mut node = NodeConfig::default();
        node.session.heartbeat_interval_secs = 0;
        node.session.idle_timeout_secs = 0;
        node.session.max_message_size = 1024;
        let config = PeerConfig::from(&node);
        assert_eq!(config.listen_addr, node.listen_addr);
        assert!(config.heartbeat_interval.is_none());
        assert!(config.idle_timeout.is_none());
        assert_eq!(config.max_message_size, 1024);
    }

    #[tokio::test]
    async fn test_start_binds_os_chosen_port() {
        let (node, _task) = PeerNode::start(
            PeerConfig::default(),
            Keypair::generate(),
            Arc::new(NullHandler),
        )
        .await
        .unwrap();
        assert_ne!(node.local_addr().port(), 0);
        assert!(node.peers().is_empty());
        assert!(node.connections().is_empty());
    }

    #[tokio::test]
    async fn test_refused_dial_releases_connection_entry() {
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = closed.local_addr().unwrap();
        drop(closed);

        let (node, _task) = PeerNode::start(
            PeerConfig::default(),
            Keypair::generate(),
            Arc::new(NullHandler),
        )
        .await
        .unwrap();
        assert!(node.connect(addr, None).await.is_err());
        assert!(node.connections().is_empty());
        assert!(node.peers().is_empty());
    }

    #[tokio::test]
    async fn test_silent_peer_hits_handshake_timeout() {
        // Accepts the TCP connection but never answers the handshake.
        let silent = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = silent.local_addr().unwrap();
        let _holder = tokio::spawn(async move {
            let (_stream, _) = silent.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let config = PeerConfig {
            handshake_timeout: Duration::from_millis(200),
            ..PeerConfig::default()
        };
        let (node, _task) = PeerNode::start(config, Keypair::generate(), Arc::new(NullHandler))
            .await
            .unwrap();

        let err = node.connect(addr, None).await.unwrap_err();
        assert!(matches!(err, WireError::Timeout("handshake")), "got {err:?}");
        assert!(node.connections().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_stops_accept_loop() {
        let (node, task) = PeerNode::start(
            PeerConfig::default(),
            Keypair::generate(),
            Arc::new(NullHandler),
        )
        .await
        .unwrap();
        node.shutdown();
        let result = timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert!(result.is_ok());
        assert!(node.connect(node.local_addr(), None).await.is_err());
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer_fails() {
        let (node, _task) = PeerNode::start(
            PeerConfig::default(),
            Keypair::generate(),
            Arc::new(NullHandler),
        )
        .await
        .unwrap();
        let stranger = Keypair::generate().peer_id().clone();
        assert!(matches!(
            node.send(&stranger, Envelope::heartbeat("hi")).await,
            Err(WireError::NotConnected(_))
        ));
        assert_eq!(node.broadcast(Envelope::heartbeat("hi")).await, 0);
    }
}
