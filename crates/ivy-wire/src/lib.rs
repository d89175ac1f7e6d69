//! Ivy Wire Protocol — encrypted peer-to-peer sessions.
//!
//! Nodes find each other on the local network, open TCP connections, and
//! bootstrap every connection with a signed ephemeral key exchange. After the
//! handshake all traffic is sealed with a per-session XChaCha20-Poly1305 key.
//!
//! ## Architecture
//!
//! - **FramedChannel**: 8-byte little-endian length-prefixed MessagePack envelopes
//! - **EncryptedChannel**: handshake state machine and AEAD sealing on top of the framing
//! - **ConnectionRegistry / PeerRegistry**: duplicate suppression by address and by identity
//! - **PeerNode**: listener, dialer and per-session supervisor
//! - **Discovery**: candidate sources consumed by the [`DiscoveryDriver`]

pub mod channel;
pub mod crypto;
pub mod discovery;
pub mod error;
pub mod frame;
pub mod message;
pub mod peer;
pub mod registry;

pub use channel::{EncryptedChannel, Role, SessionState};
pub use discovery::{Candidate, Discovery, DiscoveryDriver, LanDiscovery, StaticDiscovery};
pub use error::WireError;
pub use message::{Envelope, Handshake, Heartbeat};
pub use peer::{MessageHandler, PeerConfig, PeerNode};
pub use registry::{Admission, ConnectionRegistry, PeerRegistry, PeerSession};
