//! Wire protocol message types.
//!
//! Every frame on the stream carries exactly one [`Envelope`], serialized as
//! MessagePack with named fields. Before the session key exists only
//! [`Envelope::Handshake`] travels in the clear; afterwards every frame is an
//! [`Envelope::EncryptedPayload`] whose plaintext is another envelope.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::WireError;

/// Text of the first encrypted message an initiator sends.
pub const HANDSHAKE_CONFIRMATION: &str = "hello";

/// A wire protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Envelope {
    /// Signed ephemeral key announcement.
    Handshake(Handshake),
    /// AEAD-sealed inner envelope.
    EncryptedPayload(EncryptedPayload),
    /// Liveness probe, also used as the handshake confirmation.
    Heartbeat(Heartbeat),
    /// Opaque application data.
    Data(Data),
    /// The sender is closing the session.
    Goodbye(Goodbye),
}

/// Binds an ephemeral X25519 key to a long-term Ed25519 identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    /// Base64 Ed25519 public key of the sender. Validated by the receiver,
    /// not by the decoder.
    pub peer_id: String,
    /// Sender's ephemeral X25519 public key.
    pub ephemeral_public_key: Bytes,
    /// Ed25519 signature over `ephemeral_public_key`.
    pub signature: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPayload {
    pub ciphertext: Bytes,
    /// Explicit 24-byte XChaCha20 nonce.
    pub nonce: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Data {
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Goodbye {
    pub reason: String,
}

impl Envelope {
    pub fn heartbeat(message: impl Into<String>) -> Self {
        Envelope::Heartbeat(Heartbeat {
            message: message.into(),
        })
    }

    pub fn data(payload: impl Into<Bytes>) -> Self {
        Envelope::Data(Data {
            payload: payload.into(),
        })
    }

    pub fn goodbye(reason: impl Into<String>) -> Self {
        Envelope::Goodbye(Goodbye {
            reason: reason.into(),
        })
    }

    /// Variant name for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Handshake(_) => "handshake",
            Envelope::EncryptedPayload(_) => "encrypted_payload",
            Envelope::Heartbeat(_) => "heartbeat",
            Envelope::Data(_) => "data",
            Envelope::Goodbye(_) => "goodbye",
        }
    }
}

/// Serialize an envelope to its MessagePack payload (no length prefix).
pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>, WireError> {
    Ok(rmp_serde::to_vec_named(envelope)?)
}

/// Parse a MessagePack payload into an envelope.
pub fn decode_envelope(body: &[u8]) -> Result<Envelope, WireError> {
    Ok(rmp_serde::from_slice(body)?)
}
