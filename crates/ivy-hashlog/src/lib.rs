//! Tamper-evident, hash-chained log of signed entries.
//!
//! Each [`Entry`] commits to its predecessor's id, its position, its content
//! and its signer:
//!
//! ```text
//! data_hash = SHA-256(previous || decimal(sequence) || content || signer)
//! signature = base64(Ed25519-sign(data_hash))
//! id        = base64(SHA-256(data_hash || signature))
//! ```
//!
//! Editing any field of any entry changes its id and breaks every later
//! `previous` link. The log is independent of the network layer; it only
//! shares the identity primitives from `ivy-types`.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use ivy_types::{IvyError, Keypair, PeerId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HashLogError {
    #[error("Entry {sequence}: id does not match its contents")]
    IdMismatch { sequence: u64 },
    #[error("Entry {sequence}: bad signature: {reason}")]
    BadSignature { sequence: u64, reason: String },
    #[error("Entry {sequence}: previous link broken")]
    BrokenLink { sequence: u64 },
    #[error("Sequence gap: expected {expected}, found {found}")]
    SequenceGap { expected: u64, found: u64 },
    #[error("Identity error: {0}")]
    Identity(#[from] IvyError),
}

/// The signed part of an entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryData {
    /// Id of the previous entry; empty for the first one.
    pub previous: String,
    pub sequence: u64,
    pub content: Vec<u8>,
    /// Base64 public key of the signer (a [`PeerId`] string).
    pub signer: String,
}

impl EntryData {
    /// SHA-256 over the fields, the sequence number in decimal.
    pub fn hash(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.previous.as_bytes());
        hasher.update(self.sequence.to_string().as_bytes());
        hasher.update(&self.content);
        hasher.update(self.signer.as_bytes());
        hasher.finalize().into()
    }
}

/// One log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub id: String,
    #[serde(flatten)]
    pub data: EntryData,
    pub signature: String,
}

fn entry_id(data_hash: &[u8], signature: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data_hash);
    hasher.update(signature.as_bytes());
    STANDARD.encode(hasher.finalize())
}

impl Entry {
    /// Build and sign an entry.
    pub fn new(previous: &str, sequence: u64, content: Vec<u8>, keypair: &Keypair) -> Self {
        let data = EntryData {
            previous: previous.to_string(),
            sequence,
            content,
            signer: keypair.peer_id().to_string(),
        };
        let data_hash = data.hash();
        let signature = STANDARD.encode(keypair.sign(&data_hash));
        Self {
            id: entry_id(&data_hash, &signature),
            data,
            signature,
        }
    }

    /// Check the id and the signature. Says nothing about the chain.
    pub fn verify(&self) -> Result<(), HashLogError> {
        let sequence = self.data.sequence;
        let data_hash = self.data.hash();
        if entry_id(&data_hash, &self.signature) != self.id {
            return Err(HashLogError::IdMismatch { sequence });
        }

        let signer = PeerId::parse(&self.data.signer)?;
        let signature = STANDARD
            .decode(&self.signature)
            .map_err(|e| HashLogError::BadSignature {
                sequence,
                reason: e.to_string(),
            })?;
        signer
            .verify(&data_hash, &signature)
            .map_err(|e| HashLogError::BadSignature {
                sequence,
                reason: e.to_string(),
            })
    }

    pub fn is_valid(&self) -> bool {
        self.verify().is_ok()
    }
}

/// Append-only sequence of entries, each linked to the one before.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashLog {
    entries: Vec<Entry>,
}

impl HashLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap existing entries. Call [`HashLog::verify_chain`] before trusting them.
    pub fn from_entries(entries: Vec<Entry>) -> Self {
        Self { entries }
    }

    /// Sign `content` as the next entry.
    pub fn append(&mut self, content: Vec<u8>, keypair: &Keypair) -> &Entry {
        let (previous, sequence) = match self.entries.last() {
            Some(last) => (last.id.clone(), last.data.sequence + 1),
            None => (String::new(), 0),
        };
        self.entries
            .push(Entry::new(&previous, sequence, content, keypair));
        &self.entries[self.entries.len() - 1]
    }

    /// Verify every entry, that sequences run 0, 1, 2, … and that each
    /// `previous` is the id of the entry before it.
    pub fn verify_chain(&self) -> Result<(), HashLogError> {
        let mut previous = "";
        for (index, entry) in self.entries.iter().enumerate() {
            let expected = index as u64;
            if entry.data.sequence != expected {
                return Err(HashLogError::SequenceGap {
                    expected,
                    found: entry.data.sequence,
                });
            }
            if entry.data.previous != previous {
                return Err(HashLogError::BrokenLink { sequence: expected });
            }
            entry.verify()?;
            previous = &entry.id;
        }
        Ok(())
    }

    pub fn head(&self) -> Option<&Entry> {
        self.entries.last()
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
