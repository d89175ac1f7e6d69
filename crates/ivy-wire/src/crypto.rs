//! Session key derivation and AEAD sealing.
//!
//! The session key is SHA-256 over a domain tag and the X25519 shared secret
//! of the two ephemeral keys. Both directions share the key, so the nonce
//! carries a direction byte next to a per-direction counter:
//!
//! ```text
//! byte 0      direction (0x01 initiator->responder, 0x02 responder->initiator)
//! bytes 1..16 zero
//! bytes 16..24 big-endian u64 message counter
//! ```
//!
//! A nonce is never produced twice for one key. The receiver accepts only the
//! exact next nonce of the remote direction, which also rejects replayed and
//! reordered frames.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use sha2::{Digest, Sha256};
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::Zeroizing;

use crate::error::WireError;

/// Length of an XChaCha20-Poly1305 nonce.
pub const NONCE_LENGTH: usize = 24;

/// Length of the derived session key.
pub const KEY_LENGTH: usize = 32;

/// Length of an X25519 public key.
pub const EPHEMERAL_KEY_LENGTH: usize = 32;

const KEY_DOMAIN: &[u8] = b"ivy-session-v1";
const FINGERPRINT_DOMAIN: &[u8] = b"ivy-key-fingerprint-v1";

/// Which way a sealed message travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    InitiatorToResponder,
    ResponderToInitiator,
}

impl Direction {
    fn tag(self) -> u8 {
        match self {
            Direction::InitiatorToResponder => 0x01,
            Direction::ResponderToInitiator => 0x02,
        }
    }
}

/// Symmetric key shared by the two ends of one session. Zeroed on drop.
#[derive(Clone)]
pub struct SessionKey(Zeroizing<[u8; KEY_LENGTH]>);

impl SessionKey {
    /// Run X25519 between our ephemeral secret and the peer's ephemeral public
    /// key and hash the result into a session key.
    ///
    /// Consumes the secret: an ephemeral key is used for exactly one exchange.
    pub fn derive(secret: EphemeralSecret, remote: &PublicKey) -> Result<Self, WireError> {
        let shared = secret.diffie_hellman(remote);
        if !shared.was_contributory() {
            return Err(WireError::Handshake(
                "non-contributory key exchange (low-order public key)".into(),
            ));
        }
        let mut hasher = Sha256::new();
        hasher.update(KEY_DOMAIN);
        hasher.update(shared.as_bytes());
        let mut key = Zeroizing::new([0u8; KEY_LENGTH]);
        key.copy_from_slice(&hasher.finalize());
        Ok(Self(key))
    }

    #[cfg(test)]
    pub(crate) fn from_bytes(bytes: [u8; KEY_LENGTH]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// One-way digest of the key, safe to compare or log.
    pub fn fingerprint(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(FINGERPRINT_DOMAIN);
        hasher.update(&self.0[..]);
        hasher.finalize().into()
    }

    fn cipher(&self) -> XChaCha20Poly1305 {
        XChaCha20Poly1305::new(Key::from_slice(&self.0[..]))
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// Monotonic nonce counter for one direction.
#[derive(Debug, Clone)]
struct NonceSequence {
    direction: Direction,
    next: Option<u64>,
}

impl NonceSequence {
    fn new(direction: Direction) -> Self {
        Self {
            direction,
            next: Some(0),
        }
    }

    fn current(&self) -> Result<[u8; NONCE_LENGTH], WireError> {
        let counter = self.next.ok_or(WireError::NonceExhausted)?;
        let mut nonce = [0u8; NONCE_LENGTH];
        nonce[0] = self.direction.tag();
        nonce[16..].copy_from_slice(&counter.to_be_bytes());
        Ok(nonce)
    }

    // Stops at None instead of wrapping back to zero.
    fn advance(&mut self) {
        self.next = self.next.and_then(|n| n.checked_add(1));
    }
}

/// Seals outbound messages of one session.
#[derive(Debug)]
pub struct SealingCipher {
    key: SessionKey,
    nonces: NonceSequence,
}

impl SealingCipher {
    pub fn new(key: SessionKey, direction: Direction) -> Self {
        Self {
            key,
            nonces: NonceSequence::new(direction),
        }
    }

    /// Encrypt `plaintext` under the next unused nonce.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<(Vec<u8>, [u8; NONCE_LENGTH]), WireError> {
        let nonce = self.nonces.current()?;
        let ciphertext = self
            .key
            .cipher()
            .encrypt(XNonce::from_slice(&nonce), plaintext)
            .map_err(|_| WireError::Decrypt("encryption failed".into()))?;
        self.nonces.advance();
        Ok((ciphertext, nonce))
    }
}

/// Opens inbound messages of one session.
#[derive(Debug)]
pub struct OpeningCipher {
    key: SessionKey,
    nonces: NonceSequence,
}

impl OpeningCipher {
    pub fn new(key: SessionKey, direction: Direction) -> Self {
        Self {
            key,
            nonces: NonceSequence::new(direction),
        }
    }

    /// Authenticate and decrypt. Nothing of an unauthenticated message is
    /// returned, and the expected nonce only advances on success.
    pub fn open(&mut self, nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, WireError> {
        let expected = self.nonces.current()?;
        if nonce != expected.as_slice() {
            return Err(WireError::Decrypt(
                "unexpected nonce (replayed, reordered or wrong direction)".into(),
            ));
        }
        let plaintext = self
            .key
            .cipher()
            .decrypt(XNonce::from_slice(&expected), ciphertext)
            .map_err(|_| WireError::Decrypt("authentication failed".into()))?;
        self.nonces.advance();
        Ok(plaintext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;
    use std::collections::HashSet;

    fn pair(key: [u8; KEY_LENGTH]) -> (SealingCipher, OpeningCipher) {
        (
            SealingCipher::new(SessionKey::from_bytes(key), Direction::InitiatorToResponder),
            OpeningCipher::new(SessionKey::from_bytes(key), Direction::InitiatorToResponder),
        )
    }

    #[test]
    fn test_both_sides_derive_same_key() {
        let a = EphemeralSecret::random_from_rng(OsRng);
        let b = EphemeralSecret::random_from_rng(OsRng);
        let a_pub = PublicKey::from(&a);
        let b_pub = PublicKey::from(&b);

        let ka = SessionKey::derive(a, &b_pub).unwrap();
        let kb = SessionKey::derive(b, &a_pub).unwrap();
        assert_eq!(ka.fingerprint(), kb.fingerprint());
    }

    #[test]
    fn test_low_order_point_rejected() {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let zero = PublicKey::from([0u8; EPHEMERAL_KEY_LENGTH]);
        assert!(matches!(
            SessionKey::derive(secret, &zero),
            Err(WireError::Handshake(_))
        ));
    }

    #[test]
    fn test_seal_open_round_trip() {
        let (mut seal, mut open) = pair([7u8; KEY_LENGTH]);
        for msg in [&b"first"[..], b"", b"third message"] {
            let (ct, nonce) = seal.seal(msg).unwrap();
            assert_eq!(open.open(&nonce, &ct).unwrap(), msg);
        }
    }

    #[test]
    fn test_wrong_key_fails() {
        let mut seal = SealingCipher::new(
            SessionKey::from_bytes([1u8; KEY_LENGTH]),
            Direction::InitiatorToResponder,
        );
        let mut open = OpeningCipher::new(
            SessionKey::from_bytes([2u8; KEY_LENGTH]),
            Direction::InitiatorToResponder,
        );
        let (ct, nonce) = seal.seal(b"secret").unwrap();
        assert!(matches!(open.open(&nonce, &ct), Err(WireError::Decrypt(_))));
    }

    #[test]
    fn test_flipped_ciphertext_byte_fails() {
        let (mut seal, mut open) = pair([3u8; KEY_LENGTH]);
        let (mut ct, nonce) = seal.seal(b"tamper with me").unwrap();
        ct[0] ^= 0x01;
        assert!(matches!(open.open(&nonce, &ct), Err(WireError::Decrypt(_))));
    }

    #[test]
    fn test_failed_open_does_not_advance() {
        let (mut seal, mut open) = pair([4u8; KEY_LENGTH]);
        let (ct, nonce) = seal.seal(b"payload").unwrap();
        let mut bad = ct.clone();
        let last = bad.len() - 1;
        bad[last] ^= 0xFF;
        assert!(open.open(&nonce, &bad).is_err());
        assert_eq!(open.open(&nonce, &ct).unwrap(), b"payload");
    }

    #[test]
    fn test_replay_rejected() {
        let (mut seal, mut open) = pair([5u8; KEY_LENGTH]);
        let (ct, nonce) = seal.seal(b"once").unwrap();
        open.open(&nonce, &ct).unwrap();
        assert!(matches!(open.open(&nonce, &ct), Err(WireError::Decrypt(_))));
    }

    #[test]
    fn test_wrong_direction_rejected() {
        let key = [6u8; KEY_LENGTH];
        let mut seal = SealingCipher::new(
            SessionKey::from_bytes(key),
            Direction::ResponderToInitiator,
        );
        let mut open = OpeningCipher::new(
            SessionKey::from_bytes(key),
            Direction::InitiatorToResponder,
        );
        let (ct, nonce) = seal.seal(b"reflected").unwrap();
        assert!(open.open(&nonce, &ct).is_err());
    }

    #[test]
    fn test_sequential_nonces_never_repeat() {
        let key = [8u8; KEY_LENGTH];
        let mut forward = SealingCipher::new(
            SessionKey::from_bytes(key),
            Direction::InitiatorToResponder,
        );
        let mut backward = SealingCipher::new(
            SessionKey::from_bytes(key),
            Direction::ResponderToInitiator,
        );
        let mut seen = HashSet::new();
        for _ in 0..1_000 {
            let (_, n1) = forward.seal(b"same plaintext").unwrap();
            let (_, n2) = backward.seal(b"same plaintext").unwrap();
            assert!(seen.insert(n1), "nonce reused: {n1:?}");
            assert!(seen.insert(n2), "nonce reused: {n2:?}");
        }
        assert!(!seen.contains(&[0u8; NONCE_LENGTH]));
    }

    #[test]
    fn test_counter_never_wraps() {
        let mut seq = NonceSequence::new(Direction::InitiatorToResponder);
        seq.next = Some(u64::MAX);
        let last = seq.current().unwrap();
        assert_eq!(&last[16..], &u64::MAX.to_be_bytes());
        seq.advance();
        assert!(matches!(seq.current(), Err(WireError::NonceExhausted)));
        seq.advance();
        assert!(seq.next.is_none());
    }
}
