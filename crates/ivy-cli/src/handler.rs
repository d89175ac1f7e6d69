//! Console message handler: logs what peers send.

use async_trait::async_trait;
use ivy_types::PeerId;
use ivy_wire::peer::HEARTBEAT_MESSAGE;
use ivy_wire::{Envelope, MessageHandler, PeerSession};
use tracing::{debug, info};

pub struct ConsoleHandler;

#[async_trait]
impl MessageHandler for ConsoleHandler {
    async fn handle_message(&self, from: &PeerId, envelope: Envelope) {
        match envelope {
            Envelope::Heartbeat(hb) if hb.message == HEARTBEAT_MESSAGE => {
                debug!(peer = %from.short(), "Heartbeat");
            }
            Envelope::Heartbeat(hb) => {
                info!(peer = %from.short(), message = %hb.message, "Message");
            }
            Envelope::Data(data) => {
                info!(peer = %from.short(), bytes = data.payload.len(), "Data");
            }
            other => {
                debug!(peer = %from.short(), kind = other.kind(), "Ignored message");
            }
        }
    }

    async fn peer_connected(&self, session: &PeerSession) {
        info!(
            peer = %session.peer_id,
            addr = %session.address,
            role = %session.role,
            "Peer connected"
        );
    }

    async fn peer_disconnected(&self, peer_id: &PeerId, reason: &str) {
        info!(peer = %peer_id, reason = %reason, "Peer disconnected");
    }
}
