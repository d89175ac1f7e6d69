//! Errors from the wire protocol layer.
//!
//! Everything except [`WireError::ListenerFatal`] is local to one session:
//! the session is torn down and the node keeps running.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("Encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("Handshake failed: {0}")]
    Handshake(String),
    #[error("Decrypt failed: {0}")]
    Decrypt(String),
    #[error("Nonce space exhausted for this session")]
    NonceExhausted,
    #[error("Registry conflict: {0}")]
    RegistryConflict(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: u64, max: u64 },
    #[error("Timed out during {0}")]
    Timeout(&'static str),
    #[error("Peer not connected: {0}")]
    NotConnected(String),
    #[error("Discovery error: {0}")]
    Discovery(String),
    #[error("Listener failed: {0}")]
    ListenerFatal(std::io::Error),
}

impl WireError {
    /// Whether the error ends the whole node rather than a single session.
    pub fn is_fatal(&self) -> bool {
        matches!(self, WireError::ListenerFatal(_))
    }
}
