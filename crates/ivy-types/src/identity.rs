//! Long-term node identity.
//!
//! Every Ivy node owns an Ed25519 signing keypair. The public half, encoded
//! with standard base64, is the node's [`PeerId`]. A `PeerId` is never
//! assigned independently of a key: the only ways to obtain one are from a
//! [`Keypair`] or by parsing a string that decodes to a valid Ed25519 point.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use tracing::info;
use zeroize::Zeroizing;

use crate::error::{IvyError, IvyResult};

/// Length of an Ed25519 public key in bytes.
pub const PUBLIC_KEY_LENGTH: usize = 32;

/// Length of an Ed25519 secret seed in bytes.
pub const SECRET_KEY_LENGTH: usize = 32;

/// Length of an Ed25519 signature in bytes.
pub const SIGNATURE_LENGTH: usize = 64;

/// Base64-encoded Ed25519 public key identifying a peer.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerId(String);

impl PeerId {
    /// Derive the identifier of a public key.
    pub fn from_public_key(key: &VerifyingKey) -> Self {
        Self(STANDARD.encode(key.as_bytes()))
    }

    /// Parse a base64 identifier, rejecting anything that is not a 32-byte
    /// Ed25519 point.
    pub fn parse(s: &str) -> IvyResult<Self> {
        let key = decode_verifying_key(s)?;
        Ok(Self::from_public_key(&key))
    }

    /// The public key this identifier encodes.
    pub fn verifying_key(&self) -> IvyResult<VerifyingKey> {
        decode_verifying_key(&self.0)
    }

    /// Check `signature` over `message` against this identity.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> IvyResult<()> {
        let key = self.verifying_key()?;
        let signature = Signature::from_slice(signature).map_err(|_| {
            IvyError::Identity(format!(
                "invalid signature length (expected {SIGNATURE_LENGTH} bytes)"
            ))
        })?;
        key.verify(message, &signature)
            .map_err(|e| IvyError::Identity(format!("signature verification failed: {e}")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight characters, for log lines.
    pub fn short(&self) -> &str {
        let end = self.0.len().min(8);
        &self.0[..end]
    }
}

fn decode_verifying_key(s: &str) -> IvyResult<VerifyingKey> {
    let raw = STANDARD
        .decode(s)
        .map_err(|e| IvyError::Identity(format!("peer id is not base64: {e}")))?;
    let bytes: [u8; PUBLIC_KEY_LENGTH] = raw.as_slice().try_into().map_err(|_| {
        IvyError::Identity(format!(
            "invalid public key length {} (expected {PUBLIC_KEY_LENGTH} bytes)",
            raw.len()
        ))
    })?;
    VerifyingKey::from_bytes(&bytes)
        .map_err(|e| IvyError::Identity(format!("invalid public key: {e}")))
}

impl TryFrom<String> for PeerId {
    type Error = IvyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PeerId> for String {
    fn from(id: PeerId) -> Self {
        id.0
    }
}

impl std::str::FromStr for PeerId {
    type Err = IvyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.short())
    }
}

/// Long-term Ed25519 signing keypair of the local node.
#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
    peer_id: PeerId,
}

impl Keypair {
    /// Generate a fresh keypair from the OS RNG.
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    /// Rebuild a keypair from its 32-byte secret seed.
    pub fn from_secret_bytes(seed: &[u8]) -> IvyResult<Self> {
        let seed: Zeroizing<[u8; SECRET_KEY_LENGTH]> =
            Zeroizing::new(seed.try_into().map_err(|_| {
                IvyError::Identity(format!(
                    "invalid secret key length {} (expected {SECRET_KEY_LENGTH} bytes)",
                    seed.len()
                ))
            })?);
        Ok(Self::from_signing_key(SigningKey::from_bytes(&seed)))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let peer_id = PeerId::from_public_key(&signing_key.verifying_key());
        Self {
            signing_key,
            peer_id,
        }
    }

    /// Load the seed stored at `path`, or generate a new keypair and store it
    /// there (owner-only permissions on unix).
    ///
    /// A file that exists but does not hold a valid seed is an error; it is
    /// never silently replaced.
    pub fn load_or_generate(path: &Path) -> IvyResult<Self> {
        if path.exists() {
            let contents = Zeroizing::new(std::fs::read_to_string(path)?);
            let seed = Zeroizing::new(STANDARD.decode(contents.trim()).map_err(|e| {
                IvyError::Config(format!("key file {} is not base64: {e}", path.display()))
            })?);
            let keypair = Self::from_secret_bytes(&seed)
                .map_err(|e| IvyError::Config(format!("key file {}: {e}", path.display())))?;
            info!(path = %path.display(), peer = %keypair.peer_id.short(), "Loaded identity");
            return Ok(keypair);
        }

        let keypair = Self::generate();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let encoded = Zeroizing::new(STANDARD.encode(keypair.signing_key.to_bytes()));
        let mut file = create_secret_file(path)?;
        file.write_all(encoded.as_bytes())?;
        file.sync_all()?;
        info!(path = %path.display(), peer = %keypair.peer_id.short(), "Generated new identity");
        Ok(keypair)
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Sign `message` with the long-term key.
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LENGTH] {
        self.signing_key.sign(message).to_bytes()
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("peer_id", &self.peer_id)
            .finish_non_exhaustive()
    }
}

/// Create `path` for a secret, owner-only from the moment it exists.
#[cfg(unix)]
fn create_secret_file(path: &Path) -> std::io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn create_secret_file(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().write(true).create_new(true).open(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_round_trips_through_string() {
        let keypair = Keypair::generate();
        let parsed = PeerId::parse(keypair.peer_id().as_str()).unwrap();
        assert_eq!(&parsed, keypair.peer_id());
        assert_eq!(parsed.verifying_key().unwrap(), keypair.verifying_key());
    }

    #[test]
    fn test_peer_id_rejects_garbage() {
        assert!(PeerId::parse("not base64 at all!").is_err());
        // Valid base64, wrong length.
        assert!(PeerId::parse(&STANDARD.encode([7u8; 16])).is_err());
    }

    #[test]
    fn test_sign_and_verify() {
        let keypair = Keypair::generate();
        let sig = keypair.sign(b"ephemeral");
        assert!(keypair.peer_id().verify(b"ephemeral", &sig).is_ok());
        assert!(keypair.peer_id().verify(b"other", &sig).is_err());
    }

    #[test]
    fn test_wrong_key_fails() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        let sig = a.sign(b"msg");
        assert!(b.peer_id().verify(b"msg", &sig).is_err());
    }

    #[test]
    fn test_truncated_signature_rejected() {
        let keypair = Keypair::generate();
        let sig = keypair.sign(b"msg");
        let err = keypair.peer_id().verify(b"msg", &sig[..63]).unwrap_err();
        assert!(err.to_string().contains("signature length"));
    }

    #[test]
    fn test_peer_id_serde_validates() {
        let keypair = Keypair::generate();
        let quoted = format!("\"{}\"", keypair.peer_id());
        let parsed: PeerId = peer_id_from_toml(&quoted).unwrap();
        assert_eq!(&parsed, keypair.peer_id());

        assert!(peer_id_from_toml("\"AAAA\"").is_err());
    }

    fn peer_id_from_toml(quoted: &str) -> Result<PeerId, toml::de::Error> {
        #[derive(Deserialize)]
        struct Wrapper {
            id: PeerId,
        }
        let doc = format!("id = {quoted}");
        toml::from_str::<Wrapper>(&doc).map(|w| w.id)
    }

    #[test]
    fn test_load_or_generate_persists_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("identity.key");

        let first = Keypair::load_or_generate(&path).unwrap();
        assert!(path.exists());
        let second = Keypair::load_or_generate(&path).unwrap();
        assert_eq!(first.peer_id(), second.peer_id());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_secret_file_is_private_before_any_write() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.key");

        let _file = create_secret_file(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o077, 0);
        assert!(create_secret_file(&path).is_err());
    }

    #[test]
    fn test_load_rejects_corrupt_key_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.key");
        std::fs::write(&path, "definitely-not-a-key").unwrap();
        let err = Keypair::load_or_generate(&path).unwrap_err();
        assert!(matches!(err, IvyError::Config(_)));
    }
}
