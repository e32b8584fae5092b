//! The node: ties peer links, the directory session and dissemination
//! together.
//!
//! `Node::run` owns three long-lived tasks:
//!
//!   1. the directory loop (this task): register, renew, find peers, sleep;
//!   2. the dispatcher, fed by every peer read loop over one channel;
//!   3. the pruner, which sweeps both registries once a minute.
//!
//! Everything else (accept loop, per-link loops, keepalives) hangs off the
//! registries.

mod cycle;
mod dispatch;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use epsp_core::config::EpspConfig;
use epsp_core::crypto::TrustAnchors;
use epsp_core::region::RegionCounts;
use epsp_core::wire::{Agent, Frame};

use crate::error::NodeError;
use crate::identity::{IdentityStore, NodeIdentity};
use crate::peer::{Direction, PeerConnection, PeerHost, PeerSnapshot};
use crate::registry::PeerRegistry;

pub use cycle::backoff;
pub use dispatch::Disposition;

/// Registries are swept this often.
const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

// ── Configuration ─────────────────────────────────────────────────────────────

/// Runtime settings, resolved from `EpspConfig`.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub servers: Vec<String>,
    /// Listen port. 0 picks a free port.
    pub port: u16,
    pub region: String,
    pub incoming: u64,
    pub agent: Agent,
    pub trust: TrustAnchors,
}

impl NodeConfig {
    pub fn from_config(config: &EpspConfig) -> Result<Self, NodeError> {
        let trust = TrustAnchors::from_pem(&config.trust.server_key, &config.trust.peer_key)?;
        Ok(Self {
            servers: config.network.servers.clone(),
            port: config.network.port,
            region: config.network.region.clone(),
            incoming: config.network.incoming,
            agent: config.agent.clone(),
            trust,
        })
    }
}

// ── Application callback ──────────────────────────────────────────────────────

/// A verified frame delivered to the application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub code: String,
    pub hops: u64,
    pub fields: Vec<String>,
}

impl Message {
    fn from_frame(frame: &Frame) -> Self {
        Self {
            code: frame.code.clone(),
            hops: frame.hop_count().unwrap_or_default(),
            fields: frame.payload_fields().into_iter().map(str::to_string).collect(),
        }
    }
}

/// Receives verified application data. Called inline by the dispatcher, so
/// implementations must return quickly.
pub trait MessageHandler: Send + Sync + 'static {
    fn on_message(&self, message: &Message);
}

// ── Shared state ──────────────────────────────────────────────────────────────

type Relayed = (Arc<PeerConnection>, Frame);

pub(crate) struct Shared {
    config: NodeConfig,
    agent: RwLock<Agent>,
    identity: RwLock<NodeIdentity>,
    /// Data signatures already accepted.
    seen: DashSet<String>,
    /// Trace nonce → the link that first brought the probe.
    traces: DashMap<String, Arc<PeerConnection>>,
    inbound: Arc<PeerRegistry>,
    outbound: Arc<PeerRegistry>,
    handler: Arc<dyn MessageHandler>,
    store: Arc<dyn IdentityStore>,
    relay_tx: mpsc::UnboundedSender<Relayed>,
}

impl Shared {
    fn identity(&self) -> RwLockReadGuard<'_, NodeIdentity> {
        self.identity.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn identity_mut(&self) -> RwLockWriteGuard<'_, NodeIdentity> {
        self.identity.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn connected_count(&self) -> u64 {
        self.inbound.connected_count() + self.outbound.connected_count()
    }

    fn connected_peer_ids(&self) -> Vec<String> {
        let mut ids = self.inbound.connected_peer_ids();
        ids.extend(self.outbound.connected_peer_ids());
        ids
    }

    /// Write the identity and the peers worth keeping.
    fn persist(&self) {
        let stored = self
            .identity()
            .to_stored(self.outbound.candidates_worth_saving());
        if let Err(e) = self.store.save(&stored) {
            tracing::warn!(error = %e, "failed to persist identity");
        }
    }
}

impl PeerHost for Shared {
    fn local_peer_id(&self) -> String {
        self.identity().peer_id.clone()
    }

    fn agent(&self) -> Agent {
        self.agent
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn connected_triples(&self) -> Vec<String> {
        let mut triples = self.inbound.connected_triples();
        triples.extend(self.outbound.connected_triples());
        triples
    }

    fn is_connected(&self, peer_id: &str) -> bool {
        self.inbound.find(peer_id).is_some() || self.outbound.find(peer_id).is_some()
    }

    fn relay(&self, from: Arc<PeerConnection>, frame: Frame) {
        if self.relay_tx.send((from, frame)).is_err() {
            tracing::debug!("dispatcher gone, dropping relayed frame");
        }
    }
}

// ── Node ──────────────────────────────────────────────────────────────────────

pub struct Node {
    shared: Arc<Shared>,
    relay_rx: Mutex<Option<mpsc::UnboundedReceiver<Relayed>>>,
    /// Saved peers to dial on the first directory cycle.
    pending: Mutex<Vec<String>>,
    listener_started: AtomicBool,
    listen_port: AtomicU16,
}

impl Node {
    /// Build a node, restoring any persisted identity from `store`.
    pub fn new(
        config: NodeConfig,
        store: Arc<dyn IdentityStore>,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Self, NodeError> {
        if config.servers.is_empty() {
            return Err(NodeError::NoServers);
        }

        let mut identity = NodeIdentity::new(config.region.clone(), config.incoming);
        let mut pending = Vec::new();
        match store.load() {
            Ok(Some(stored)) => {
                tracing::info!(
                    peer_id = %stored.peer_id,
                    key_expiry = stored.key.as_ref().map(|k| k.expiry.as_str()).unwrap_or("-"),
                    saved_peers = stored.peers.len(),
                    "identity restored"
                );
                identity.restore(&stored);
                pending = stored.peers;
            }
            Ok(None) => tracing::info!("no saved identity, starting fresh"),
            Err(e) => tracing::warn!(error = %e, "saved identity unreadable, starting fresh"),
        }

        let (relay_tx, relay_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            agent: RwLock::new(config.agent.clone()),
            config,
            identity: RwLock::new(identity),
            seen: DashSet::new(),
            traces: DashMap::new(),
            inbound: PeerRegistry::new(Direction::Inbound),
            outbound: PeerRegistry::new(Direction::Outbound),
            handler,
            store,
            relay_tx,
        });

        Ok(Self {
            shared,
            relay_rx: Mutex::new(Some(relay_rx)),
            pending: Mutex::new(pending),
            listener_started: AtomicBool::new(false),
            listen_port: AtomicU16::new(0),
        })
    }

    /// Run until `cancel` fires or every directory server is unreachable with
    /// no peers left. Live links are closed on return.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), NodeError> {
        let rx = self
            .relay_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(NodeError::AlreadyRunning)?;

        // Stops our own tasks on any exit path without touching the caller's token.
        let cancel = cancel.child_token();

        let dispatcher = tokio::spawn(dispatch::run(self.shared.clone(), rx, cancel.clone()));
        let pruner = tokio::spawn(prune_loop(self.shared.clone(), cancel.clone()));

        let result = self.reconnect_loop(&cancel).await;

        cancel.cancel();
        let _ = dispatcher.await;
        let _ = pruner.await;
        self.shared.inbound.close_all();
        self.shared.outbound.close_all();
        self.shared.persist();

        match &result {
            Ok(()) => tracing::info!("node stopped"),
            Err(e) => tracing::error!(error = %e, "node stopped"),
        }
        result
    }

    /// Bind the peer listener. Returns the bound address.
    pub async fn start_listener(&self, cancel: &CancellationToken) -> Result<SocketAddr, NodeError> {
        let port = self.shared.config.port;
        let addr = self
            .shared
            .inbound
            .listen(port, self.host(), cancel.clone())
            .await
            .map_err(|source| NodeError::Listen { port, source })?;
        self.listen_port.store(addr.port(), Ordering::Relaxed);
        self.listener_started.store(true, Ordering::Relaxed);
        Ok(addr)
    }

    /// Dial `candidates` (`host,port,peer-id`). Returns new link count.
    pub async fn connect_peers(&self, candidates: &[String], cancel: &CancellationToken) -> usize {
        self.shared
            .outbound
            .connect(candidates, self.host(), self.shared.config.incoming, cancel)
            .await
    }

    /// Originate a frame from this node. Signed data is marked seen so its
    /// echo is not relayed back. Returns the number of links written to.
    pub fn publish(&self, frame: &Frame) -> usize {
        if frame.is_signed_data() {
            if let Some(signature) = frame.payload_fields().first() {
                self.shared.seen.insert(signature.to_string());
            }
        }
        let sent = self.shared.inbound.broadcast_except(None, frame)
            + self.shared.outbound.broadcast_except(None, frame);
        tracing::debug!(code = %frame.code, peers = sent, "published");
        sent
    }

    pub fn snapshot(&self) -> NodeSnapshot {
        let identity = self.shared.identity();
        NodeSnapshot {
            peer_id: identity.peer_id.clone(),
            registered: identity.registered,
            agent: self.shared.agent().to_string(),
            reachable: identity.reachable,
            swarm_size: identity.swarm_size(),
            region_counts: identity.region_counts.clone(),
            clock_skew_ms: identity.clock_skew.map(|d| d.num_milliseconds()),
            key_expiry: identity.key.as_ref().map(|k| k.expiry.clone()),
            inbound: self.shared.inbound.snapshot(),
            outbound: self.shared.outbound.snapshot(),
        }
    }

    pub fn peer_id(&self) -> String {
        self.shared.local_peer_id()
    }

    pub fn identity(&self) -> NodeIdentity {
        self.shared.identity().clone()
    }

    pub fn connected_count(&self) -> u64 {
        self.shared.connected_count()
    }

    pub fn inbound(&self) -> &Arc<PeerRegistry> {
        &self.shared.inbound
    }

    pub fn outbound(&self) -> &Arc<PeerRegistry> {
        &self.shared.outbound
    }

    fn host(&self) -> Arc<dyn PeerHost> {
        self.shared.clone()
    }
}

async fn prune_loop(shared: Arc<Shared>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(PRUNE_INTERVAL);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                let incoming = shared.config.incoming;
                shared.inbound.prune(incoming);
                shared.outbound.prune(incoming);
                tracing::debug!(
                    inbound = shared.inbound.connected_count(),
                    outbound = shared.outbound.connected_count(),
                    "registries pruned"
                );
            }
        }
    }
}

// ── Monitoring ────────────────────────────────────────────────────────────────

/// Read-only view of the node for monitoring collaborators.
#[derive(Debug, Clone, Serialize)]
pub struct NodeSnapshot {
    pub peer_id: String,
    pub registered: bool,
    pub agent: String,
    pub reachable: bool,
    pub swarm_size: u64,
    pub region_counts: RegionCounts,
    pub clock_skew_ms: Option<i64>,
    pub key_expiry: Option<String>,
    pub inbound: Vec<PeerSnapshot>,
    pub outbound: Vec<PeerSnapshot>,
}
