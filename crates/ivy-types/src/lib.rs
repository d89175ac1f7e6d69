//! Core types for the Ivy peer-to-peer node.
//!
//! This crate defines the shared data structures used by the wire protocol,
//! the hash-chained log and the command-line node. It performs no networking.

pub mod config;
pub mod error;
pub mod identity;

pub use error::{IvyError, IvyResult};
pub use identity::{Keypair, PeerId};
