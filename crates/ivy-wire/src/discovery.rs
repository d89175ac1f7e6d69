//! Peer discovery.
//!
//! A [`Discovery`] source returns a finite batch of [`Candidate`]s per query.
//! The [`DiscoveryDriver`] queries every source on a fixed interval, each
//! query in its own task bounded by the query window, filters out other
//! services and ourselves, and asks the [`PeerNode`] to dial what is left.
//!
//! [`LanDiscovery`] advertises and browses `_ivy._tcp.local.` over mDNS,
//! with the peer id in a TXT record. [`StaticDiscovery`] replays the
//! configured bootstrap list.

use async_trait::async_trait;
use ivy_types::config::{BootstrapPeer, DiscoveryConfig};
use ivy_types::PeerId;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::WireError;
use crate::peer::PeerNode;

/// A network address that may host a peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Candidate {
    /// Identity hint from the source, if it has one.
    pub peer_id: Option<PeerId>,
    pub addr: SocketAddr,
    /// Service tag the candidate advertised. `None` for sources without tags.
    pub service: Option<String>,
}

impl Candidate {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            peer_id: None,
            addr,
            service: None,
        }
    }
}

/// A source of dial candidates.
#[async_trait]
pub trait Discovery: Send + Sync + 'static {
    /// Short name for log lines.
    fn name(&self) -> &'static str;

    /// Collect candidates for at most `window`.
    async fn query(&self, window: Duration) -> Result<Vec<Candidate>, WireError>;
}

/// Fixed candidate list, typically from `[[bootstrap]]` configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    candidates: Vec<Candidate>,
}

impl StaticDiscovery {
    pub fn new(candidates: Vec<Candidate>) -> Self {
        Self { candidates }
    }

    pub fn from_bootstrap(peers: &[BootstrapPeer]) -> Self {
        Self::new(
            peers
                .iter()
                .map(|p| Candidate {
                    peer_id: p.peer_id.clone(),
                    addr: p.addr,
                    service: None,
                })
                .collect(),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn query(&self, _window: Duration) -> Result<Vec<Candidate>, WireError> {
        Ok(self.candidates.clone())
    }
}

/// TXT key carrying the advertiser's [`PeerId`].
pub const TXT_PEER_ID: &str = "peer_id";

/// TXT key carrying the service tag.
pub const TXT_SERVICE: &str = "service";

/// Local-network discovery over mDNS (DNS-SD).
///
/// Each node registers `_<service>._tcp.local.` with its session port and
/// TXT records for its service tag and peer id, and browses the same type for
/// others. The mDNS daemon shares UDP 5353 with other responders, so several
/// nodes can run on one host.
#[derive(Clone)]
pub struct LanDiscovery {
    daemon: ServiceDaemon,
    service: String,
    service_type: String,
    peer_id: PeerId,
    session_port: u16,
}

impl LanDiscovery {
    /// Start an mDNS daemon. `session_port` is the TCP port advertised.
    pub fn new(
        config: &DiscoveryConfig,
        peer_id: PeerId,
        session_port: u16,
    ) -> Result<Self, WireError> {
        let daemon = ServiceDaemon::new().map_err(discovery_error)?;
        Ok(Self {
            daemon,
            service: config.service.clone(),
            service_type: service_type(&config.service),
            peer_id,
            session_port,
        })
    }

    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    /// Register this node and keep it registered until shutdown, when the
    /// record is withdrawn and the daemon stopped.
    pub fn advertise(
        &self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<JoinHandle<()>, WireError> {
        let record = service_record(
            &self.service_type,
            &self.service,
            &self.peer_id,
            self.session_port,
        )?;
        let fullname = record.get_fullname().to_string();
        self.daemon.register(record).map_err(discovery_error)?;
        info!(
            name = %fullname,
            port = self.session_port,
            "Advertising on the local network"
        );

        let daemon = self.daemon.clone();
        Ok(tokio::spawn(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
            match daemon.unregister(&fullname) {
                Ok(status) => {
                    let _ = tokio::time::timeout(Duration::from_secs(1), status.recv_async()).await;
                }
                Err(e) => debug!(error = %e, "Could not withdraw mDNS record"),
            }
            let _ = daemon.shutdown();
            debug!("Local network advertisement withdrawn");
        }))
    }
}

impl std::fmt::Debug for LanDiscovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LanDiscovery")
            .field("service_type", &self.service_type)
            .field("peer_id", &self.peer_id)
            .field("session_port", &self.session_port)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Discovery for LanDiscovery {
    fn name(&self) -> &'static str {
        "lan"
    }

    async fn query(&self, window: Duration) -> Result<Vec<Candidate>, WireError> {
        let events = self
            .daemon
            .browse(&self.service_type)
            .map_err(discovery_error)?;
        let deadline = tokio::time::Instant::now() + window;
        let mut found = Vec::new();
        loop {
            match tokio::time::timeout_at(deadline, events.recv_async()).await {
                Ok(Ok(ServiceEvent::ServiceResolved(record))) => {
                    match candidate_from_record(&record) {
                        Some(candidate) => found.push(candidate),
                        None => debug!(
                            name = %record.get_fullname(),
                            "Ignoring service without a usable peer id or address"
                        ),
                    }
                }
                Ok(Ok(_)) => {}
                Ok(Err(_)) | Err(_) => break,
            }
        }
        let _ = self.daemon.stop_browse(&self.service_type);
        Ok(found)
    }
}

fn discovery_error(e: mdns_sd::Error) -> WireError {
    WireError::Discovery(e.to_string())
}

/// DNS-SD service type for a service tag.
pub fn service_type(service: &str) -> String {
    format!("_{service}._tcp.local.")
}

/// Instance label for a node: the service tag plus the first alphanumeric
/// characters of its peer id.
fn instance_name(service: &str, peer_id: &PeerId) -> String {
    let tag: String = peer_id
        .as_str()
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .take(16)
        .collect();
    format!("{service}-{tag}")
}

/// The record a node registers: its session port, with the service tag and
/// peer id in TXT. Addresses are filled in by the daemon per interface.
fn service_record(
    service_type: &str,
    service: &str,
    peer_id: &PeerId,
    port: u16,
) -> Result<ServiceInfo, WireError> {
    let instance = instance_name(service, peer_id);
    let host = format!("{instance}.local.");
    let properties = [(TXT_SERVICE, service), (TXT_PEER_ID, peer_id.as_str())];
    ServiceInfo::new(service_type, &instance, &host, "", port, &properties[..])
        .map(ServiceInfo::enable_addr_auto)
        .map_err(discovery_error)
}

/// Turn a resolved service into a candidate. Records without a valid peer
/// id or without an address yield `None`; IPv4 is preferred.
fn candidate_from_record(record: &ServiceInfo) -> Option<Candidate> {
    let peer_id = PeerId::parse(record.get_property_val_str(TXT_PEER_ID)?).ok()?;
    let addresses = record.get_addresses();
    let ip = addresses
        .iter()
        .filter(|ip| ip.is_ipv4())
        .min()
        .or_else(|| addresses.iter().min())?;
    Some(Candidate {
        peer_id: Some(peer_id),
        addr: SocketAddr::new(*ip, record.get_port()),
        service: record.get_property_val_str(TXT_SERVICE).map(str::to_string),
    })
}

/// Periodically queries discovery sources and dials new candidates.
pub struct DiscoveryDriver {
    node: Arc<PeerNode>,
    sources: Vec<Arc<dyn Discovery>>,
    service: String,
    interval: Duration,
    window: Duration,
}

impl DiscoveryDriver {
    pub fn new(node: Arc<PeerNode>, config: &DiscoveryConfig) -> Self {
        Self {
            node,
            sources: Vec::new(),
            service: config.service.clone(),
            interval: config.interval(),
            window: config.query_window(),
        }
    }

    pub fn with_source(mut self, source: Arc<dyn Discovery>) -> Self {
        self.sources.push(source);
        self
    }

    /// Drop candidates advertising another service, candidates that are
    /// ourselves, and duplicates within the batch.
    pub fn filter(&self, candidates: Vec<Candidate>) -> Vec<Candidate> {
        let mut seen = HashSet::new();
        candidates
            .into_iter()
            .filter(|c| c.service.as_deref().map_or(true, |s| s == self.service))
            .filter(|c| c.peer_id.as_ref() != Some(self.node.peer_id()))
            .filter(|c| seen.insert(c.addr))
            .collect()
    }

    /// Run query cycles until the node shuts down.
    pub fn spawn(self) -> JoinHandle<()> {
        let driver = Arc::new(self);
        tokio::spawn(async move {
            let mut shutdown = driver.node.subscribe_shutdown();
            let busy: Vec<Arc<AtomicBool>> = driver
                .sources
                .iter()
                .map(|_| Arc::new(AtomicBool::new(false)))
                .collect();
            info!(
                sources = driver.sources.len(),
                interval_secs = driver.interval.as_secs(),
                "Starting discovery"
            );

            loop {
                if *shutdown.borrow() {
                    break;
                }
                for (source, busy) in driver.sources.iter().zip(&busy) {
                    // Skip a source whose previous query is still running.
                    if busy
                        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                        .is_err()
                    {
                        debug!(source = source.name(), "Discovery: skipping tick (busy)");
                        continue;
                    }
                    let driver = Arc::clone(&driver);
                    let source = Arc::clone(source);
                    let busy = Arc::clone(busy);
                    tokio::spawn(async move {
                        driver.run_query(source.as_ref()).await;
                        busy.store(false, Ordering::SeqCst);
                    });
                }

                tokio::select! {
                    _ = tokio::time::sleep(driver.interval) => {}
                    _ = shutdown.changed() => {
                        info!("Discovery: shutdown signal received");
                        break;
                    }
                }
            }
        })
    }

    async fn run_query(&self, source: &dyn Discovery) {
        // The window bounds collection; the extra second bounds a source
        // that ignores it.
        let limit = self.window + Duration::from_secs(1);
        let candidates = match tokio::time::timeout(limit, source.query(self.window)).await {
            Ok(Ok(found)) => found,
            Ok(Err(e)) => {
                warn!(source = source.name(), error = %e, "Discovery query failed");
                return;
            }
            Err(_) => {
                warn!(source = source.name(), "Discovery query timed out");
                return;
            }
        };

        for candidate in self.filter(candidates) {
            let node = Arc::clone(&self.node);
            tokio::spawn(async move {
                match node.dial_candidate(&candidate).await {
                    Ok(()) => {}
                    Err(WireError::RegistryConflict(reason)) => {
                        debug!(addr = %candidate.addr, reason = %reason, "Candidate already connected");
                    }
                    Err(e) => {
                        warn!(addr = %candidate.addr, error = %e, "Could not connect to candidate");
                    }
                }
            });
        }
    }
}
