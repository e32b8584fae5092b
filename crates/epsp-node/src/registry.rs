//! Peer registry: the open links in one direction.
//!
//! A node keeps two: inbound links accepted by the listener and outbound
//! links it dialed. Entries are appended when a link comes up and removed
//! only by `prune`, a minute after they close, so monitoring still sees a
//! link that just dropped.
//!
//! The lock is a plain `std::sync::Mutex` and is never held across an await.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use epsp_core::wire::{Candidate, Frame};

use crate::peer::{Direction, PeerConnection, PeerHost, PeerSnapshot};

/// How long a closed link stays listed.
pub const CLOSED_GRACE: Duration = Duration::from_secs(60);

/// Duplicate payloads an inbound link may deliver before it is judged.
const INBOUND_DUPLICATE_THRESHOLD: u64 = 100;
/// Same for outbound links.
const OUTBOUND_DUPLICATE_THRESHOLD: u64 = 10;

/// Saved-candidate filter: below this best unique count every peer is kept.
const USEFUL_UNIQUE_FLOOR: u64 = 10;

pub struct PeerRegistry {
    direction: Direction,
    peers: Mutex<Vec<Arc<PeerConnection>>>,
}

impl PeerRegistry {
    pub fn new(direction: Direction) -> Arc<Self> {
        Arc::new(Self {
            direction,
            peers: Mutex::new(Vec::new()),
        })
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    // ── Inbound ───────────────────────────────────────────────────────────────

    /// Bind `0.0.0.0:port` and accept peers until `cancel` fires.
    /// Returns the bound address.
    pub async fn listen(
        self: &Arc<Self>,
        port: u16,
        host: Arc<dyn PeerHost>,
        cancel: CancellationToken,
    ) -> std::io::Result<SocketAddr> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let local = listener.local_addr()?;
        tracing::info!(addr = %local, "listening for peers");

        let registry = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::info!("peer listener shutting down");
                        return;
                    }
                    result = listener.accept() => {
                        let (stream, addr) = match result {
                            Ok(r) => r,
                            Err(e) => {
                                tracing::warn!(error = %e, "accept failed");
                                continue;
                            }
                        };
                        let registry = registry.clone();
                        let host = host.clone();
                        let cancel = cancel.clone();
                        tokio::spawn(async move {
                            match PeerConnection::accept(stream, &host.agent()).await {
                                Ok(peer) => {
                                    registry.add(peer.clone());
                                    let _ = peer.run(host, cancel).await;
                                }
                                Err(e) => tracing::warn!(%addr, error = %e, "inbound handshake failed"),
                            }
                        });
                    }
                }
            }
        });

        Ok(local)
    }

    // ── Outbound ──────────────────────────────────────────────────────────────

    /// Dial every usable candidate concurrently, then prune.
    ///
    /// Skips entries that do not parse, our own ID, IDs already linked
    /// anywhere in the node and repeats within the batch. Returns the number
    /// of links that came up.
    pub async fn connect(
        self: &Arc<Self>,
        candidates: &[String],
        host: Arc<dyn PeerHost>,
        incoming: u64,
        cancel: &CancellationToken,
    ) -> usize {
        let own_id = host.local_peer_id();
        let agent = host.agent();
        let mut batch = HashSet::new();

        let mut targets = Vec::new();
        for raw in candidates {
            let candidate: Candidate = match raw.parse() {
                Ok(c) => c,
                Err(e) => {
                    tracing::debug!(error = %e, "skipping candidate");
                    continue;
                }
            };
            if candidate.peer_id == own_id
                || host.is_connected(&candidate.peer_id)
                || !batch.insert(candidate.peer_id.clone())
            {
                tracing::trace!(peer = %candidate.peer_id, "candidate already linked");
                continue;
            }
            targets.push(candidate);
        }

        let dials = targets
            .iter()
            .map(|candidate| PeerConnection::dial(candidate, &agent, cancel));
        let results = join_all(dials).await;

        let mut linked = 0;
        for (candidate, result) in targets.iter().zip(results) {
            match result {
                Ok(peer) => {
                    self.add(peer.clone());
                    tokio::spawn(peer.run(host.clone(), cancel.clone()));
                    linked += 1;
                }
                Err(e) => {
                    tracing::debug!(peer = %candidate.peer_id, addr = %candidate.address(), error = %e, "dial failed")
                }
            }
        }

        tracing::info!(tried = targets.len(), linked, "outbound batch done");
        self.prune(incoming);
        linked
    }

    // ── Maintenance ───────────────────────────────────────────────────────────

    pub fn add(&self, peer: Arc<PeerConnection>) {
        self.lock().push(peer);
    }

    pub fn prune(&self, incoming: u64) {
        self.prune_with(incoming, CLOSED_GRACE);
    }

    /// Drop links closed longer than `grace`, and close open links that
    /// mostly deliver duplicates.
    pub fn prune_with(&self, incoming: u64, grace: Duration) {
        let threshold = match self.direction {
            Direction::Inbound => INBOUND_DUPLICATE_THRESHOLD,
            Direction::Outbound => OUTBOUND_DUPLICATE_THRESHOLD,
        };

        let mut peers = self.lock();
        peers.retain(|peer| match peer.connection().closed_for() {
            Some(closed) => closed <= grace,
            None => true,
        });

        for peer in peers.iter().filter(|p| p.is_open()) {
            let conn = peer.connection();
            let duplicate = conn.counters().duplicate;
            let redundancy = conn.redundancy();
            if duplicate > threshold && redundancy > incoming / 2 {
                tracing::info!(
                    peer = %peer.label(),
                    duplicate,
                    redundancy,
                    "closing redundant link"
                );
                peer.close();
            }
        }
    }

    /// Write `frame` to every open link except `from`, one task per link.
    /// Returns how many writes were started.
    pub fn broadcast_except(&self, from: Option<&Arc<PeerConnection>>, frame: &Frame) -> usize {
        let targets: Vec<_> = self
            .open_peers()
            .into_iter()
            .filter(|peer| !from.is_some_and(|f| Arc::ptr_eq(f, peer)))
            .collect();

        for peer in &targets {
            let peer = peer.clone();
            let frame = frame.clone();
            tokio::spawn(async move {
                if let Err(e) = peer.send_frame(&frame).await {
                    tracing::warn!(peer = %peer.label(), error = %e, "relay write failed");
                }
            });
        }
        targets.len()
    }

    pub fn close_all(&self) {
        for peer in self.lock().iter() {
            peer.close();
        }
    }

    // ── Queries ───────────────────────────────────────────────────────────────

    pub fn peers(&self) -> Vec<Arc<PeerConnection>> {
        self.lock().clone()
    }

    pub fn open_peers(&self) -> Vec<Arc<PeerConnection>> {
        self.lock().iter().filter(|p| p.is_open()).cloned().collect()
    }

    pub fn connected_count(&self) -> u64 {
        self.lock().iter().filter(|p| p.is_open()).count() as u64
    }

    pub fn connected_peer_ids(&self) -> Vec<String> {
        self.lock()
            .iter()
            .filter(|p| p.is_open())
            .filter_map(|p| p.peer_id())
            .collect()
    }

    pub fn connected_triples(&self) -> Vec<String> {
        self.lock()
            .iter()
            .filter(|p| p.is_open())
            .map(|p| p.triple())
            .collect()
    }

    pub fn find(&self, peer_id: &str) -> Option<Arc<PeerConnection>> {
        self.lock()
            .iter()
            .find(|p| p.is_open() && p.peer_id().as_deref() == Some(peer_id))
            .cloned()
    }

    pub fn snapshot(&self) -> Vec<PeerSnapshot> {
        self.lock().iter().map(|p| p.snapshot()).collect()
    }

    /// Links worth re-dialing next start, as `host,port,peer-id`.
    ///
    /// If the best link has delivered fewer than ten unique payloads every
    /// link is kept. Otherwise only links at or below a tenth of the best.
    pub fn candidates_worth_saving(&self) -> Vec<String> {
        let peers = self.lock().clone();
        let best = peers
            .iter()
            .map(|p| p.connection().counters().unique)
            .max()
            .unwrap_or(0);
        peers
            .iter()
            .filter(|p| p.peer_id().is_some())
            .filter(|p| {
                best < USEFUL_UNIQUE_FLOOR || p.connection().counters().unique <= best / 10
            })
            .map(|p| p.triple())
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Arc<PeerConnection>>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
