//! Node configuration types.
//!
//! Every section carries `#[serde(default)]` so a partial `config.toml` (or
//! none at all) yields a working node.

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{IvyError, IvyResult};
use crate::identity::PeerId;

/// Default service tag advertised and expected during discovery.
pub const DEFAULT_SERVICE: &str = "ivy";

/// Default maximum frame size (16 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: u64 = 16 * 1024 * 1024;

/// Top-level node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Address the session listener binds. Port 0 lets the OS choose.
    pub listen_addr: SocketAddr,
    /// File holding the long-term identity seed. `None` means `~/.ivy/identity.key`.
    pub key_path: Option<PathBuf>,
    /// Default tracing filter when `RUST_LOG` is unset.
    pub log_level: String,
    pub session: SessionConfig,
    pub discovery: DiscoveryConfig,
    /// Statically known peers, dialed on every discovery cycle.
    pub bootstrap: Vec<BootstrapPeer>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            key_path: None,
            log_level: "info".to_string(),
            session: SessionConfig::default(),
            discovery: DiscoveryConfig::default(),
            bootstrap: Vec::new(),
        }
    }
}

impl NodeConfig {
    /// Reject values the node cannot run with.
    pub fn validate(&self) -> IvyResult<()> {
        if self.session.connect_timeout_secs == 0 {
            return Err(IvyError::Config(
                "session.connect_timeout_secs must be greater than zero".into(),
            ));
        }
        if self.session.handshake_timeout_secs == 0 {
            return Err(IvyError::Config(
                "session.handshake_timeout_secs must be greater than zero".into(),
            ));
        }
        if self.session.max_message_size == 0 {
            return Err(IvyError::Config(
                "session.max_message_size must be greater than zero".into(),
            ));
        }
        if self.session.outbound_queue == 0 {
            return Err(IvyError::Config(
                "session.outbound_queue must be greater than zero".into(),
            ));
        }
        if self.session.heartbeat_interval_secs > 0
            && self.session.idle_timeout_secs > 0
            && self.session.idle_timeout_secs <= self.session.heartbeat_interval_secs
        {
            return Err(IvyError::Config(format!(
                "session.idle_timeout_secs ({}) must exceed session.heartbeat_interval_secs ({})",
                self.session.idle_timeout_secs, self.session.heartbeat_interval_secs
            )));
        }
        if self.discovery.enabled {
            if self.discovery.interval_secs == 0 || self.discovery.query_window_secs == 0 {
                return Err(IvyError::Config(
                    "discovery.interval_secs and discovery.query_window_secs must be greater than zero"
                        .into(),
                ));
            }
            if !is_service_name(&self.discovery.service) {
                return Err(IvyError::Config(format!(
                    "discovery.service {:?} must be 1-15 lowercase letters, digits or hyphens",
                    self.discovery.service
                )));
            }
        }
        Ok(())
    }

    /// Resolved identity key path.
    pub fn key_path(&self) -> PathBuf {
        self.key_path
            .clone()
            .unwrap_or_else(|| ivy_home().join("identity.key"))
    }
}

/// Per-session timing and sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub connect_timeout_secs: u64,
    pub handshake_timeout_secs: u64,
    /// Interval between outbound heartbeats. 0 disables heartbeats.
    pub heartbeat_interval_secs: u64,
    /// Close a session that has been silent this long. 0 disables.
    pub idle_timeout_secs: u64,
    pub max_message_size: u64,
    /// Capacity of each session's outbound message queue.
    pub outbound_queue: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 5,
            handshake_timeout_secs: 10,
            heartbeat_interval_secs: 15,
            idle_timeout_secs: 45,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            outbound_queue: 64,
        }
    }
}

impl SessionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_interval_secs > 0).then(|| Duration::from_secs(self.heartbeat_interval_secs))
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }
}

/// Local-network discovery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub enabled: bool,
    /// Service tag, advertised as the DNS-SD type `_<service>._tcp.local.`.
    pub service: String,
    /// Seconds between query cycles.
    pub interval_secs: u64,
    /// Seconds each query collects answers for.
    pub query_window_secs: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            service: DEFAULT_SERVICE.to_string(),
            interval_secs: 10,
            query_window_secs: 2,
        }
    }
}

impl DiscoveryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn query_window(&self) -> Duration {
        Duration::from_secs(self.query_window_secs)
    }
}

/// DNS-SD service names: at most 15 characters of `[a-z0-9-]`, starting
/// with a letter and not ending with a hyphen.
fn is_service_name(name: &str) -> bool {
    name.len() <= 15
        && name.starts_with(|c: char| c.is_ascii_lowercase())
        && !name.ends_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// A statically configured peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapPeer {
    pub addr: SocketAddr,
    /// Identity expected at `addr`, if known.
    #[serde(default)]
    pub peer_id: Option<PeerId>,
}

/// The Ivy home directory (`~/.ivy`).
pub fn ivy_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".ivy")
}

/// Default config file path (`~/.ivy/config.toml`).
pub fn default_config_path() -> PathBuf {
    ivy_home().join("config.toml")
}
