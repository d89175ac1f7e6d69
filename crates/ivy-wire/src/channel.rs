//! EncryptedChannel — handshake state machine on top of a framed channel.
//!
//! The initiator speaks first:
//!
//! ```text
//! initiator                                   responder
//!     | -- Handshake{id_i, eph_i, sig_i} ------> |  verify, check identity
//!     | <------ Handshake{id_r, eph_r, sig_r} -- |  derive key
//!     |  verify, derive key                      |
//!     | == Encrypted(Heartbeat "hello") =======> |  open, established
//!  established
//! ```
//!
//! Each side signs its ephemeral X25519 public key with its long-term Ed25519
//! key, so a man in the middle cannot substitute its own ephemeral key
//! without forging a signature. After the exchange every frame is an
//! `EncryptedPayload`.

use bytes::Bytes;
use ivy_types::{Keypair, PeerId};
use rand::rngs::OsRng;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;
use x25519_dalek::{EphemeralSecret, PublicKey};

use crate::crypto::{
    Direction, OpeningCipher, SealingCipher, SessionKey, EPHEMERAL_KEY_LENGTH,
};
use crate::error::WireError;
use crate::frame::{FrameReader, FrameWriter, FramedChannel};
use crate::message::{
    decode_envelope, encode_envelope, EncryptedPayload, Envelope, Handshake,
    HANDSHAKE_CONFIRMATION,
};
use crate::registry::PeerRegistry;

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// We dialed.
    Initiator,
    /// We accepted.
    Responder,
}

impl Role {
    fn outbound(self) -> Direction {
        match self {
            Role::Initiator => Direction::InitiatorToResponder,
            Role::Responder => Direction::ResponderToInitiator,
        }
    }

    fn inbound(self) -> Direction {
        match self {
            Role::Initiator => Direction::ResponderToInitiator,
            Role::Responder => Direction::InitiatorToResponder,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Initiator => "initiator",
            Role::Responder => "responder",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of one session. `Closed` is terminal.
///
/// The channel tracks the state up to `Established`, or `Closed` if the
/// handshake fails. After [`EncryptedChannel::into_split`] the session's
/// supervisor owns its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Transport open, handshake not started.
    Connecting,
    AwaitingHandshake,
    KeyDerived,
    Established,
    Closed,
}

/// Framed channel plus the per-session ephemeral keys and ciphers.
pub struct EncryptedChannel<R, W> {
    reader: FrameReader<R>,
    writer: FrameWriter<W>,
    role: Role,
    state: SessionState,
    ephemeral: Option<EphemeralSecret>,
    ephemeral_public: PublicKey,
    remote_peer: Option<PeerId>,
    remote_ephemeral: Option<PublicKey>,
    sealing: Option<SealingCipher>,
    opening: Option<OpeningCipher>,
    key_fingerprint: Option<[u8; 32]>,
}

impl<R, W> EncryptedChannel<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Wrap a framed channel and generate a fresh ephemeral keypair for it.
    pub fn new(framed: FramedChannel<R, W>, role: Role) -> Self {
        let ephemeral = EphemeralSecret::random_from_rng(OsRng);
        let ephemeral_public = PublicKey::from(&ephemeral);
        let (reader, writer) = framed.into_parts();
        Self {
            reader,
            writer,
            role,
            state: SessionState::Connecting,
            ephemeral: Some(ephemeral),
            ephemeral_public,
            remote_peer: None,
            remote_ephemeral: None,
            sealing: None,
            opening: None,
            key_fingerprint: None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Remote identity, once its handshake has been verified.
    pub fn remote_peer(&self) -> Option<&PeerId> {
        self.remote_peer.as_ref()
    }

    /// Digest of the derived session key, for comparing both ends.
    pub fn key_fingerprint(&self) -> Option<[u8; 32]> {
        self.key_fingerprint
    }

    /// Run the handshake for this channel's role.
    ///
    /// `expected` is the identity the caller believes sits at the other end
    /// (from discovery or configuration). `peers` is consulted so that an
    /// identity with a live session is refused before it is ever admitted.
    pub async fn handshake(
        &mut self,
        keypair: &Keypair,
        expected: Option<&PeerId>,
        peers: &PeerRegistry,
    ) -> Result<PeerId, WireError> {
        if self.state != SessionState::Connecting {
            return Err(WireError::Handshake(format!(
                "handshake already attempted (state {:?})",
                self.state
            )));
        }
        self.state = SessionState::AwaitingHandshake;
        let result = match self.role {
            Role::Initiator => self.run_initiator(keypair, expected, peers).await,
            Role::Responder => self.run_responder(keypair, expected, peers).await,
        };
        if result.is_err() {
            self.state = SessionState::Closed;
        }
        result
    }

    async fn run_initiator(
        &mut self,
        keypair: &Keypair,
        expected: Option<&PeerId>,
        peers: &PeerRegistry,
    ) -> Result<PeerId, WireError> {
        let hello = self.local_handshake(keypair);
        self.writer.send(&hello).await?;

        let reply = self.receive_handshake().await?;
        let peer_id = self.verify_remote(&reply, keypair.peer_id(), expected, peers)?;
        self.derive_key()?;

        self.send_message(&Envelope::heartbeat(HANDSHAKE_CONFIRMATION))
            .await?;
        self.state = SessionState::Established;
        debug!(peer = %peer_id.short(), role = %self.role, "Handshake established");
        Ok(peer_id)
    }

    async fn run_responder(
        &mut self,
        keypair: &Keypair,
        expected: Option<&PeerId>,
        peers: &PeerRegistry,
    ) -> Result<PeerId, WireError> {
        let hello = self.receive_handshake().await?;
        let peer_id = self.verify_remote(&hello, keypair.peer_id(), expected, peers)?;

        let hello = self.local_handshake(keypair);
        self.writer.send(&hello).await?;
        self.derive_key()?;

        match self.receive_message().await? {
            Envelope::Heartbeat(_) => {}
            other => {
                return Err(WireError::Handshake(format!(
                    "expected confirmation heartbeat, got {}",
                    other.kind()
                )));
            }
        }
        self.state = SessionState::Established;
        debug!(peer = %peer_id.short(), role = %self.role, "Handshake established");
        Ok(peer_id)
    }

    fn local_handshake(&self, keypair: &Keypair) -> Envelope {
        let public = self.ephemeral_public.as_bytes();
        Envelope::Handshake(Handshake {
            peer_id: keypair.peer_id().to_string(),
            ephemeral_public_key: Bytes::copy_from_slice(public),
            signature: Bytes::copy_from_slice(&keypair.sign(public)),
        })
    }

    async fn receive_handshake(&mut self) -> Result<Handshake, WireError> {
        match self.reader.receive().await? {
            Envelope::Handshake(hs) => Ok(hs),
            other => Err(WireError::Handshake(format!(
                "expected handshake, got {}",
                other.kind()
            ))),
        }
    }

    /// Check the remote handshake and remember its identity and ephemeral key.
    fn verify_remote(
        &mut self,
        hs: &Handshake,
        local: &PeerId,
        expected: Option<&PeerId>,
        peers: &PeerRegistry,
    ) -> Result<PeerId, WireError> {
        let peer_id = PeerId::parse(&hs.peer_id)
            .map_err(|e| WireError::Handshake(format!("malformed peer id: {e}")))?;

        peer_id
            .verify(&hs.ephemeral_public_key, &hs.signature)
            .map_err(|e| WireError::Handshake(e.to_string()))?;

        let remote_key: [u8; EPHEMERAL_KEY_LENGTH] = hs
            .ephemeral_public_key
            .as_ref()
            .try_into()
            .map_err(|_| {
                WireError::Handshake(format!(
                    "ephemeral key must be {EPHEMERAL_KEY_LENGTH} bytes, got {}",
                    hs.ephemeral_public_key.len()
                ))
            })?;

        if &peer_id == local {
            return Err(WireError::Handshake("connected to ourselves".into()));
        }
        if let Some(expected) = expected {
            if expected != &peer_id {
                return Err(WireError::Handshake(format!(
                    "peer id mismatch: expected {}, got {}",
                    expected.short(),
                    peer_id.short()
                )));
            }
        }
        if !peers.would_admit(local, &peer_id, self.role) {
            return Err(WireError::Handshake(format!(
                "already connected to peer {}",
                peer_id.short()
            )));
        }

        self.remote_ephemeral = Some(PublicKey::from(remote_key));
        self.remote_peer = Some(peer_id.clone());
        Ok(peer_id)
    }

    fn derive_key(&mut self) -> Result<(), WireError> {
        let secret = self
            .ephemeral
            .take()
            .ok_or_else(|| WireError::Handshake("ephemeral key already consumed".into()))?;
        let remote = self
            .remote_ephemeral
            .ok_or_else(|| WireError::Handshake("remote ephemeral key unknown".into()))?;

        let key = SessionKey::derive(secret, &remote)?;
        self.key_fingerprint = Some(key.fingerprint());
        self.sealing = Some(SealingCipher::new(key.clone(), self.role.outbound()));
        self.opening = Some(OpeningCipher::new(key, self.role.inbound()));
        self.state = SessionState::KeyDerived;
        Ok(())
    }

    /// Seal and send one envelope. Only valid once the key is derived.
    pub async fn send_message(&mut self, envelope: &Envelope) -> Result<(), WireError> {
        let sealing = self
            .sealing
            .as_mut()
            .ok_or_else(|| WireError::Handshake("no session key yet".into()))?;
        let sealed = seal_envelope(sealing, envelope)?;
        self.writer.send(&sealed).await
    }

    /// Receive and open one envelope. Only valid once the key is derived.
    pub async fn receive_message(&mut self) -> Result<Envelope, WireError> {
        let opening = self
            .opening
            .as_mut()
            .ok_or_else(|| WireError::Handshake("no session key yet".into()))?;
        let envelope = self.reader.receive().await?;
        open_envelope(opening, envelope)
    }

    /// Split an established channel into independently owned halves.
    pub fn into_split(self) -> Result<(EncryptedReader<R>, EncryptedWriter<W>), WireError> {
        if self.state != SessionState::Established {
            return Err(WireError::Handshake(format!(
                "cannot split channel in state {:?}",
                self.state
            )));
        }
        match (self.opening, self.sealing) {
            (Some(opening), Some(sealing)) => Ok((
                EncryptedReader {
                    reader: self.reader,
                    opening,
                },
                EncryptedWriter {
                    writer: self.writer,
                    sealing,
                },
            )),
            _ => Err(WireError::Handshake("session key missing".into())),
        }
    }
}

/// Receiving half of an established session.
pub struct EncryptedReader<R> {
    reader: FrameReader<R>,
    opening: OpeningCipher,
}

impl<R: AsyncRead + Unpin> EncryptedReader<R> {
    pub async fn receive_message(&mut self) -> Result<Envelope, WireError> {
        let envelope = self.reader.receive().await?;
        open_envelope(&mut self.opening, envelope)
    }
}

/// Sending half of an established session.
pub struct EncryptedWriter<W> {
    writer: FrameWriter<W>,
    sealing: SealingCipher,
}

impl<W: AsyncWrite + Unpin> EncryptedWriter<W> {
    pub async fn send_message(&mut self, envelope: &Envelope) -> Result<(), WireError> {
        let sealed = seal_envelope(&mut self.sealing, envelope)?;
        self.writer.send(&sealed).await
    }

    pub async fn shutdown(&mut self) -> Result<(), WireError> {
        self.writer.shutdown().await
    }
}

fn seal_envelope(sealing: &mut SealingCipher, envelope: &Envelope) -> Result<Envelope, WireError> {
    let plaintext = encode_envelope(envelope)?;
    let (ciphertext, nonce) = sealing.seal(&plaintext)?;
    Ok(Envelope::EncryptedPayload(EncryptedPayload {
        ciphertext: Bytes::from(ciphertext),
        nonce: Bytes::copy_from_slice(&nonce),
    }))
}

fn open_envelope(opening: &mut OpeningCipher, envelope: Envelope) -> Result<Envelope, WireError> {
    match envelope {
        Envelope::EncryptedPayload(payload) => {
            let plaintext = opening.open(&payload.nonce, &payload.ciphertext)?;
            decode_envelope(&plaintext)
        }
        other => Err(WireError::Decrypt(format!(
            "unencrypted {} after key derivation",
            other.kind()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, split, DuplexStream, ReadHalf, WriteHalf};

    type TestChannel = EncryptedChannel<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

    fn channel_pair() -> (TestChannel, TestChannel) {
        let (a, b) = duplex(64 * 1024);
        let (ar, aw) = split(a);
        let (br, bw) = split(b);
        (
            EncryptedChannel::new(FramedChannel::with_default_limit(ar, aw), Role::Initiator),
            EncryptedChannel::new(FramedChannel::with_default_limit(br, bw), Role::Responder),
        )
    }

    #[tokio::test]
    async fn test_handshake_establishes_both_sides() {
        let (mut init, mut resp) = channel_pair();
        let alice = Keypair::generate();
        let bob = Keypair::generate();
        let peers_a = PeerRegistry::new();
        let peers_b = PeerRegistry::new();

        let (ra, rb) = tokio::join!(
            init.handshake(&alice, None, &peers_a),
            resp.handshake(&bob, None, &peers_b)
        );
        assert_eq!(&ra.unwrap(), bob.peer_id());
        assert_eq!(&rb.unwrap(), alice.peer_id());

        assert_eq!(init.state(), SessionState::Established);
        assert_eq!(resp.state(), SessionState::Established);
        assert!(init.key_fingerprint().is_some());
        assert_eq!(init.key_fingerprint(), resp.key_fingerprint());
        assert_eq!(init.remote_peer(), Some(bob.peer_id()));
    }

    #[tokio::test]
    async fn test_messages_flow_both_ways_after_handshake() {
        let (mut init, mut resp) = channel_pair();
        let alice = Keypair::generate();
        let bob = Keypair::generate();
        let peers = PeerRegistry::new();
        let (ra, rb) = tokio::join!(
            init.handshake(&alice, None, &peers),
            resp.handshake(&bob, None, &peers)
        );
        ra.unwrap();
        rb.unwrap();

        init.send_message(&Envelope::data(&b"ping"[..])).await.unwrap();
        assert_eq!(
            resp.receive_message().await.unwrap(),
            Envelope::data(&b"ping"[..])
        );
        resp.send_message(&Envelope::heartbeat("pong")).await.unwrap();
        assert_eq!(
            init.receive_message().await.unwrap(),
            Envelope::heartbeat("pong")
        );
    }

    #[tokio::test]
    async fn test_tampered_signature_rejected() {
        let (mut forger, mut resp) = channel_pair();
        let mallory = Keypair::generate();
        let bob = Keypair::generate();
        let peers = PeerRegistry::new();

        let mut hello = match forger.local_handshake(&mallory) {
            Envelope::Handshake(hs) => hs,
            _ => unreachable!(),
        };
        let mut sig = hello.signature.to_vec();
        sig[10] ^= 0x01;
        hello.signature = Bytes::from(sig);
        forger
            .writer
            .send(&Envelope::Handshake(hello))
            .await
            .unwrap();

        let err = resp.handshake(&bob, None, &peers).await.unwrap_err();
        assert!(matches!(err, WireError::Handshake(_)), "got {err:?}");
        assert_eq!(resp.state(), SessionState::Closed);
        assert!(resp.remote_peer().is_none());
        assert!(peers.is_empty());
    }

    #[tokio::test]
    async fn test_substituted_ephemeral_key_rejected() {
        let (mut forger, mut resp) = channel_pair();
        let alice = Keypair::generate();
        let bob = Keypair::generate();

        // Signature from alice, but the ephemeral key swapped by a middleman.
        let mut hello = match forger.local_handshake(&alice) {
            Envelope::Handshake(hs) => hs,
            _ => unreachable!(),
        };
        let other = EphemeralSecret::random_from_rng(OsRng);
        hello.ephemeral_public_key = Bytes::copy_from_slice(PublicKey::from(&other).as_bytes());
        forger
            .writer
            .send(&Envelope::Handshake(hello))
            .await
            .unwrap();

        let err = resp
            .handshake(&bob, None, &PeerRegistry::new())
            .await
            .unwrap_err();
        assert!(matches!(err, WireError::Handshake(_)));
    }

    #[tokio::test]
    async fn test_malformed_peer_id_rejected() {
        let (mut forger, mut resp) = channel_pair();
        let alice = Keypair::generate();
        let bob = Keypair::generate();

        let mut hello = match forger.local_handshake(&alice) {
            Envelope::Handshake(hs) => hs,
            _ => unreachable!(),
        };
        hello.peer_id = "not-a-key".to_string();
        forger
            .writer
            .send(&Envelope::Handshake(hello))
            .await
            .unwrap();

        let err = resp
            .handshake(&bob, None, &PeerRegistry::new())
            .await
            .unwrap_err();
        match err {
            WireError::Handshake(msg) => assert!(msg.contains("malformed peer id")),
            other => panic!("Expected Handshake error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_non_handshake_first_message_rejected() {
        let (mut forger, mut resp) = channel_pair();
        forger
            .writer
            .send(&Envelope::heartbeat("skip the handshake"))
            .await
            .unwrap();

        let err = resp
            .handshake(&Keypair::generate(), None, &PeerRegistry::new())
            .await
            .unwrap_err();
        match err {
            WireError::Handshake(msg) => assert!(msg.contains("expected handshake")),
            other => panic!("Expected Handshake error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_expected_identity_mismatch_rejected() {
        let (mut init, mut resp) = channel_pair();
        let alice = Keypair::generate();
        let bob = Keypair::generate();
        let someone_else = Keypair::generate();

        let responder =
            tokio::spawn(async move { resp.handshake(&bob, None, &PeerRegistry::new()).await });

        let err = init
            .handshake(&alice, Some(someone_else.peer_id()), &PeerRegistry::new())
            .await
            .unwrap_err();
        match err {
            WireError::Handshake(msg) => assert!(msg.contains("mismatch")),
            other => panic!("Expected Handshake error, got {other:?}"),
        }
        assert_eq!(init.state(), SessionState::Closed);

        // The responder never sees a confirmation.
        drop(init);
        assert!(responder.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_live_peer_rejected_by_responder() {
        let (mut init, mut resp) = channel_pair();
        let alice = Keypair::generate();
        let bob = Keypair::generate();

        let peers_b = PeerRegistry::new();
        let (tx, _rx) = tokio::sync::mpsc::channel(1);
        assert!(peers_b.try_add(crate::registry::PeerSession::new(
            alice.peer_id().clone(),
            "127.0.0.1:1".parse().unwrap(),
            Role::Responder,
            1,
            tx,
        )));

        let initiator =
            tokio::spawn(async move { init.handshake(&alice, None, &PeerRegistry::new()).await });

        match resp.handshake(&bob, None, &peers_b).await.unwrap_err() {
            WireError::Handshake(msg) => assert!(msg.contains("already connected")),
            other => panic!("Expected Handshake error, got {other:?}"),
        }
        assert_eq!(peers_b.len(), 1);

        drop(resp);
        assert!(initiator.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_self_connection_rejected() {
        let (mut init, mut resp) = channel_pair();
        let me = Keypair::generate();
        let same = me.clone();

        let initiator =
            tokio::spawn(async move { init.handshake(&same, None, &PeerRegistry::new()).await });

        match resp.handshake(&me, None, &PeerRegistry::new()).await {
            Err(WireError::Handshake(msg)) => assert!(msg.contains("ourselves")),
            other => panic!("Expected Handshake error, got {other:?}"),
        }

        drop(resp);
        assert!(initiator.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_plaintext_after_handshake_rejected() {
        let (mut init, mut resp) = channel_pair();
        let alice = Keypair::generate();
        let bob = Keypair::generate();
        let peers = PeerRegistry::new();
        let (ra, rb) = tokio::join!(
            init.handshake(&alice, None, &peers),
            resp.handshake(&bob, None, &peers)
        );
        ra.unwrap();
        rb.unwrap();

        init.writer.send(&Envelope::heartbeat("clear")).await.unwrap();
        assert!(matches!(
            resp.receive_message().await,
            Err(WireError::Decrypt(_))
        ));
    }

    #[tokio::test]
    async fn test_send_before_key_derivation_fails() {
        let (mut init, _resp) = channel_pair();
        assert!(init.send_message(&Envelope::heartbeat("early")).await.is_err());
        assert_eq!(init.state(), SessionState::Connecting);
    }

    #[tokio::test]
    async fn test_handshake_runs_once() {
        let (mut init, mut resp) = channel_pair();
        assert_eq!(init.state(), SessionState::Connecting);
        let alice = Keypair::generate();
        let bob = Keypair::generate();
        let peers = PeerRegistry::new();
        let (ra, rb) = tokio::join!(
            init.handshake(&alice, None, &peers),
            resp.handshake(&bob, None, &peers)
        );
        ra.unwrap();
        rb.unwrap();

        match init.handshake(&alice, None, &peers).await {
            Err(WireError::Handshake(msg)) => assert!(msg.contains("already attempted")),
            other => panic!("Expected Handshake error, got {other:?}"),
        }
        assert_eq!(init.state(), SessionState::Established);
    }

    #[tokio::test]
    async fn test_failed_handshake_cannot_be_retried() {
        let (mut forger, mut resp) = channel_pair();
        forger
            .writer
            .send(&Envelope::heartbeat("skip the handshake"))
            .await
            .unwrap();

        let bob = Keypair::generate();
        assert!(resp.handshake(&bob, None, &PeerRegistry::new()).await.is_err());
        assert_eq!(resp.state(), SessionState::Closed);
        assert!(resp
            .handshake(&bob, None, &PeerRegistry::new())
            .await
            .is_err());
        assert_eq!(resp.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_crossed_dial_winner_passes_live_peer_check() {
        let (mut init, mut resp) = channel_pair();
        let a = Keypair::generate();
        let b = Keypair::generate();
        let (low, high) = if a.peer_id() < b.peer_id() { (a, b) } else { (b, a) };

        // The higher node already holds its own outbound session to the
        // lower one; the lower node's dial still gets through.
        let peers_high = PeerRegistry::new();
        let (tx, _rx) = tokio::sync::mpsc::channel(1);
        assert!(peers_high.try_add(crate::registry::PeerSession::new(
            low.peer_id().clone(),
            "127.0.0.1:1".parse().unwrap(),
            Role::Initiator,
            1,
            tx,
        )));

        let peers_low = PeerRegistry::new();
        let (rl, rh) = tokio::join!(
            init.handshake(&low, None, &peers_low),
            resp.handshake(&high, None, &peers_high)
        );
        assert_eq!(&rl.unwrap(), high.peer_id());
        assert_eq!(&rh.unwrap(), low.peer_id());
    }

    #[tokio::test]
    async fn test_split_halves_keep_nonce_sequence() {
        let (mut init, mut resp) = channel_pair();
        let alice = Keypair::generate();
        let bob = Keypair::generate();
        let peers = PeerRegistry::new();
        let (ra, rb) = tokio::join!(
            init.handshake(&alice, None, &peers),
            resp.handshake(&bob, None, &peers)
        );
        ra.unwrap();
        rb.unwrap();

        let (_ir, mut iw) = init.into_split().unwrap();
        let (mut rr, _rw) = resp.into_split().unwrap();
        for i in 0..5 {
            iw.send_message(&Envelope::heartbeat(format!("beat {i}")))
                .await
                .unwrap();
        }
        for i in 0..5 {
            assert_eq!(
                rr.receive_message().await.unwrap(),
                Envelope::heartbeat(format!("beat {i}"))
            );
        }
    }
}
