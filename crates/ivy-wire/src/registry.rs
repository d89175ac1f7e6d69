//! Connection and peer registries.
//!
//! [`ConnectionRegistry`] holds the remote addresses with an open or pending
//! transport connection. [`PeerRegistry`] holds the authenticated peers with
//! an established session. Each is guarded by its own lock, held only for the
//! duration of a single lookup or update and never across an await point.

use chrono::{DateTime, Utc};
use ivy_types::PeerId;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::channel::Role;
use crate::error::WireError;
use crate::message::Envelope;

/// Command queued for a session's writer task.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// Seal and send this envelope.
    Message(Envelope),
    /// Send a goodbye with this reason, then close.
    Close(String),
}

/// Set of remote addresses with a live or in-progress connection.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    addrs: Arc<Mutex<HashSet<String>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically claim `addr`. Returns `false` if it is already claimed.
    pub fn try_add(&self, addr: &str) -> bool {
        let mut addrs = self.addrs.lock().unwrap_or_else(|e| e.into_inner());
        addrs.insert(addr.to_string())
    }

    /// Release `addr`. Returns whether it was present.
    pub fn remove(&self, addr: &str) -> bool {
        let mut addrs = self.addrs.lock().unwrap_or_else(|e| e.into_inner());
        addrs.remove(addr)
    }

    pub fn contains(&self, addr: &str) -> bool {
        let addrs = self.addrs.lock().unwrap_or_else(|e| e.into_inner());
        addrs.contains(addr)
    }

    pub fn len(&self) -> usize {
        let addrs = self.addrs.lock().unwrap_or_else(|e| e.into_inner());
        addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the claimed addresses.
    pub fn addresses(&self) -> Vec<String> {
        let addrs = self.addrs.lock().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<String> = addrs.iter().cloned().collect();
        out.sort();
        out
    }
}

/// An established, authenticated session with one remote peer.
#[derive(Debug, Clone)]
pub struct PeerSession {
    pub peer_id: PeerId,
    /// Remote socket address of the transport connection.
    pub address: SocketAddr,
    /// Whether we dialed (`Initiator`) or accepted (`Responder`).
    pub role: Role,
    /// Distinguishes this session from earlier or later ones with the same peer.
    pub session_id: u64,
    pub connected_at: DateTime<Utc>,
    outbound: mpsc::Sender<Outbound>,
}

impl PeerSession {
    pub fn new(
        peer_id: PeerId,
        address: SocketAddr,
        role: Role,
        session_id: u64,
        outbound: mpsc::Sender<Outbound>,
    ) -> Self {
        Self {
            peer_id,
            address,
            role,
            session_id,
            connected_at: Utc::now(),
            outbound,
        }
    }

    /// Queue an envelope for this session's writer.
    pub async fn send(&self, envelope: Envelope) -> Result<(), WireError> {
        self.outbound
            .send(Outbound::Message(envelope))
            .await
            .map_err(|_| WireError::NotConnected(self.peer_id.to_string()))
    }

    /// Ask the writer to say goodbye and close the session.
    pub async fn close(&self, reason: impl Into<String>) -> Result<(), WireError> {
        self.outbound
            .send(Outbound::Close(reason.into()))
            .await
            .map_err(|_| WireError::NotConnected(self.peer_id.to_string()))
    }

    /// Whether the writer task is still accepting messages.
    pub fn is_open(&self) -> bool {
        !self.outbound.is_closed()
    }
}

/// Result of [`PeerRegistry::admit`].
#[derive(Debug)]
pub enum Admission {
    Admitted,
    /// Admitted in place of a crossed session, which the caller must close.
    Replaced(PeerSession),
    Rejected,
}

/// Role, on the local side, of the connection that survives when two peers
/// dial each other at once: the one dialed by the lower [`PeerId`]. Both ends
/// compute the same connection.
pub fn crossed_dial_winner(local: &PeerId, remote: &PeerId) -> Role {
    if local < remote {
        Role::Initiator
    } else {
        Role::Responder
    }
}

fn supersedes(existing: Role, incoming: Role, local: &PeerId, remote: &PeerId) -> bool {
    existing != incoming && incoming == crossed_dial_winner(local, remote)
}

/// Authenticated peers keyed by identity. At most one session per peer.
#[derive(Debug, Clone, Default)]
pub struct PeerRegistry {
    peers: Arc<Mutex<HashMap<PeerId, PeerSession>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `session` unless its peer already has one. The existing
    /// session is never replaced.
    pub fn try_add(&self, session: PeerSession) -> bool {
        let mut peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        if peers.contains_key(&session.peer_id) {
            return false;
        }
        peers.insert(session.peer_id.clone(), session);
        true
    }

    /// Whether a session with `remote` in `role` would be admitted now.
    ///
    /// A live session blocks a new one unless the two were dialed from
    /// opposite ends and the new one wins the crossed-dial tie-break.
    pub fn would_admit(&self, local: &PeerId, remote: &PeerId, role: Role) -> bool {
        let peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        match peers.get(remote) {
            None => true,
            Some(existing) => supersedes(existing.role, role, local, remote),
        }
    }

    /// Atomic admission for the node at `local`: insert `session`, replace a
    /// crossed session it wins against, or reject it.
    pub fn admit(&self, local: &PeerId, session: PeerSession) -> Admission {
        let mut peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        let existing = peers.get(&session.peer_id).map(|s| s.role);
        match existing {
            Some(role) if !supersedes(role, session.role, local, &session.peer_id) => {
                Admission::Rejected
            }
            _ => match peers.insert(session.peer_id.clone(), session) {
                Some(old) => Admission::Replaced(old),
                None => Admission::Admitted,
            },
        }
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<PeerSession> {
        let peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        peers.get(peer_id).cloned()
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        let peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        peers.contains_key(peer_id)
    }

    /// Remove whatever session `peer_id` has.
    pub fn remove(&self, peer_id: &PeerId) -> Option<PeerSession> {
        let mut peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        peers.remove(peer_id)
    }

    /// Remove the entry for `peer_id` only if it belongs to `session_id`.
    pub fn remove_session(&self, peer_id: &PeerId, session_id: u64) -> bool {
        let mut peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        match peers.get(peer_id) {
            Some(s) if s.session_id == session_id => {
                peers.remove(peer_id);
                true
            }
            _ => false,
        }
    }

    /// Snapshot of all sessions, ordered by peer id.
    pub fn sessions(&self) -> Vec<PeerSession> {
        let peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<PeerSession> = peers.values().cloned().collect();
        out.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        out
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.sessions().into_iter().map(|s| s.peer_id).collect()
    }

    pub fn len(&self) -> usize {
        let peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
