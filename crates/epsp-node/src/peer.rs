//! Peer links: handshake, keepalive and the per-link read loop.
//!
//! Both sides announce their version (`614`) as soon as the socket is up and
//! answer the other's announcement with `634`. Until the remote peer ID is
//! known we keep asking for it (`612`) after every frame. Relayed frames
//! (`5xx`, `615`, `635`) are handed to the node through `PeerHost::relay`;
//! everything link-local is answered here.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use epsp_core::wire::{code, Agent, Candidate, Frame, NO_HOP};

use crate::conn::{Connection, Counters};
use crate::error::{ConnError, PeerError};

/// Outbound dial timeout.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// A link that has been silent this long gets a ping.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerState {
    Connecting,
    AwaitingVersion,
    Established,
    Closed,
}

/// What a peer link needs from the node it belongs to.
pub trait PeerHost: Send + Sync + 'static {
    /// Our own peer ID (may change after registration).
    fn local_peer_id(&self) -> String;

    fn agent(&self) -> Agent;

    /// Every open link as `host,port,peer-id`.
    fn connected_triples(&self) -> Vec<String>;

    /// True if an open link already carries `peer_id`.
    fn is_connected(&self, peer_id: &str) -> bool;

    /// Hand a relayed frame to the dispatcher. Must not block.
    fn relay(&self, from: Arc<PeerConnection>, frame: Frame);
}

struct PeerInfo {
    peer_id: Option<String>,
    agent: Option<Agent>,
    state: PeerState,
}

pub struct PeerConnection {
    conn: Connection,
    direction: Direction,
    info: Mutex<PeerInfo>,
    version_replied: AtomicBool,
}

impl PeerConnection {
    fn new(conn: Connection, direction: Direction, peer_id: Option<String>) -> Self {
        Self {
            conn,
            direction,
            info: Mutex::new(PeerInfo {
                peer_id,
                agent: None,
                state: PeerState::Connecting,
            }),
            version_replied: AtomicBool::new(false),
        }
    }

    /// Take over an accepted socket and announce our version.
    pub async fn accept(stream: TcpStream, agent: &Agent) -> Result<Arc<Self>, PeerError> {
        let peer = Arc::new(Self::new(
            Connection::from_stream(stream),
            Direction::Inbound,
            None,
        ));
        tracing::info!(addr = %peer.conn.address(), "inbound peer accepted");
        peer.announce_version(agent).await?;
        Ok(peer)
    }

    /// Dial a candidate and announce our version. The candidate's peer ID is
    /// bound up front; the remote must confirm it.
    pub async fn dial(
        candidate: &Candidate,
        agent: &Agent,
        cancel: &CancellationToken,
    ) -> Result<Arc<Self>, PeerError> {
        let conn = Connection::connect(&candidate.address(), DIAL_TIMEOUT, cancel).await?;
        let peer = Arc::new(Self::new(
            conn,
            Direction::Outbound,
            Some(candidate.peer_id.clone()),
        ));
        tracing::info!(peer = %candidate.peer_id, addr = %peer.conn.address(), "outbound peer connected");
        peer.announce_version(agent).await?;
        Ok(peer)
    }

    async fn announce_version(&self, agent: &Agent) -> Result<(), PeerError> {
        self.send(code::VERSION_ANNOUNCE, Some(&agent.to_string())).await?;
        self.set_state(PeerState::AwaitingVersion);
        Ok(())
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn peer_id(&self) -> Option<String> {
        self.info().peer_id.clone()
    }

    pub fn agent(&self) -> Option<Agent> {
        self.info().agent.clone()
    }

    pub fn state(&self) -> PeerState {
        if self.conn.is_closed() {
            return PeerState::Closed;
        }
        self.info().state
    }

    pub fn is_open(&self) -> bool {
        !self.conn.is_closed()
    }

    /// Peer ID if known, else the remote address.
    pub fn label(&self) -> String {
        self.peer_id()
            .unwrap_or_else(|| self.conn.address().to_string())
    }

    /// `host,port,peer-id` as listed in `235` payloads.
    pub fn triple(&self) -> String {
        epsp_core::wire::address_triple(self.conn.address(), &self.peer_id().unwrap_or_default())
    }

    pub fn close(&self) {
        self.conn.close();
        self.set_state(PeerState::Closed);
    }

    pub fn snapshot(&self) -> PeerSnapshot {
        PeerSnapshot {
            address: self.conn.address().to_string(),
            peer_id: self.peer_id(),
            agent: self.agent().map(|a| a.to_string()),
            direction: self.direction,
            state: self.state(),
            counters: self.conn.counters(),
            rtt_ms: self.conn.rtt().map(|d| d.as_millis() as u64),
            connected_secs: self.conn.connected_for().as_secs(),
        }
    }

    // ── Sending ───────────────────────────────────────────────────────────────

    /// Send a link-local frame (hop field fixed at `1`).
    pub async fn send(&self, code: &str, payload: Option<&str>) -> Result<(), ConnError> {
        let hop = NO_HOP.to_string();
        let mut fields = vec![code, hop.as_str()];
        if let Some(payload) = payload {
            fields.push(payload);
        }
        self.conn.write(&fields).await?;
        tracing::trace!(peer = %self.label(), code, "sent");
        Ok(())
    }

    pub async fn send_frame(&self, frame: &Frame) -> Result<(), ConnError> {
        self.conn.write_frame(frame).await
    }

    async fn send_ping(&self) -> Result<(), ConnError> {
        self.send(code::PEER_PING, None).await?;
        self.conn.mark_ping_sent();
        Ok(())
    }

    async fn ping_if_first(&self) -> Result<(), ConnError> {
        if !self.conn.has_sent_ping() {
            self.send_ping().await?;
        }
        Ok(())
    }

    // ── Run loop ──────────────────────────────────────────────────────────────

    /// Drive the link until it closes, fails or `cancel` fires.
    pub async fn run(
        self: Arc<Self>,
        host: Arc<dyn PeerHost>,
        cancel: CancellationToken,
    ) -> Result<(), PeerError> {
        let keepalive = tokio::spawn(self.clone().keepalive(cancel.clone()));
        let result = self.read_loop(host.as_ref(), &cancel).await;
        self.close();
        keepalive.abort();
        match &result {
            Ok(()) => tracing::debug!(peer = %self.label(), "peer link stopped"),
            Err(e) => tracing::info!(peer = %self.label(), error = %e, "peer link closed"),
        }
        result
    }

    async fn read_loop(
        self: &Arc<Self>,
        host: &dyn PeerHost,
        cancel: &CancellationToken,
    ) -> Result<(), PeerError> {
        loop {
            let frame = match self.conn.read(cancel).await {
                Ok(frame) => frame,
                Err(ConnError::Malformed) => {
                    tracing::warn!(peer = %self.label(), "dropping non-UTF-8 line");
                    continue;
                }
                Err(ConnError::Cancelled) => return Ok(()),
                Err(e) => return Err(e.into()),
            };
            tracing::trace!(peer = %self.label(), line = %frame, "recv");

            self.handle(frame, host).await?;

            if self.peer_id().is_none() {
                self.send(code::PEER_ID_REQUEST, None).await?;
            }
        }
    }

    async fn handle(self: &Arc<Self>, frame: Frame, host: &dyn PeerHost) -> Result<(), PeerError> {
        if !frame.is_well_formed() {
            return Err(PeerError::MalformedFrame(frame.to_line()));
        }
        if frame.is_relayed() {
            host.relay(self.clone(), frame);
            return Ok(());
        }

        match frame.code.as_str() {
            code::PEER_LIST_REQUEST => {
                let triples = host.connected_triples().join(":");
                self.send(code::PEER_LIST_REPLY, Some(&triples)).await?;
            }
            code::VERSION_ANNOUNCE => {
                let theirs: Agent = frame.payload_str().parse().unwrap_or_else(|e| match e {});
                tracing::debug!(peer = %self.label(), agent = %theirs, "version announce");
                self.info().agent = Some(theirs);
                if self.version_replied.swap(true, Ordering::SeqCst) {
                    tracing::debug!(peer = %self.label(), "repeated version announce ignored");
                } else {
                    self.send(code::VERSION_REPLY, Some(&host.agent().to_string()))
                        .await?;
                }
                self.set_state(PeerState::Established);
            }
            code::VERSION_REPLY => {
                let theirs: Agent = frame.payload_str().parse().unwrap_or_else(|e| match e {});
                tracing::debug!(peer = %self.label(), agent = %theirs, "version reply");
                self.info().agent = Some(theirs);
                self.set_state(PeerState::Established);
            }
            code::PEER_PING => {
                self.conn.mark_ping_received();
                self.send(code::PEER_PONG, None).await?;
            }
            code::PEER_PONG => {
                self.conn.mark_pong_received();
                tracing::trace!(peer = %self.label(), rtt = ?self.conn.rtt(), "pong");
            }
            code::PEER_ID_REQUEST => {
                let own = host.local_peer_id();
                self.send(code::PEER_ID_REPLY, Some(&own)).await?;
                self.ping_if_first().await?;
            }
            code::PEER_ID_REPLY => {
                self.bind_peer_id(frame.payload_str(), host)?;
                self.ping_if_first().await?;
            }
            code::VERSION_INCOMPATIBLE => return Err(PeerError::IncompatibleVersion),
            other => {
                tracing::debug!(peer = %self.label(), code = other, "ignoring unknown frame");
            }
        }
        Ok(())
    }

    fn bind_peer_id(&self, id: &str, host: &dyn PeerHost) -> Result<(), PeerError> {
        if id.is_empty() {
            return Err(PeerError::MalformedFrame(format!("{} 1", code::PEER_ID_REPLY)));
        }
        let bound = self.peer_id();
        match bound {
            None => {
                if host.is_connected(id) {
                    return Err(PeerError::DuplicateIdentity(id.to_string()));
                }
                tracing::info!(peer = %id, addr = %self.conn.address(), "peer id learned");
                self.info().peer_id = Some(id.to_string());
                Ok(())
            }
            Some(bound) if bound == id => Ok(()),
            Some(bound) => Err(PeerError::IdentityMismatch {
                bound,
                got: id.to_string(),
            }),
        }
    }

    async fn keepalive(self: Arc<Self>, cancel: CancellationToken) {
        let start = tokio::time::Instant::now() + KEEPALIVE_INTERVAL;
        let mut ticker = tokio::time::interval_at(start, KEEPALIVE_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = self.conn.closed() => return,
                _ = ticker.tick() => {
                    if self.conn.received_within(KEEPALIVE_INTERVAL) {
                        continue;
                    }
                    if let Err(e) = self.send_ping().await {
                        tracing::debug!(peer = %self.label(), error = %e, "keepalive ping failed");
                        self.close();
                        return;
                    }
                }
            }
        }
    }

    fn set_state(&self, state: PeerState) {
        self.info().state = state;
    }

    fn info(&self) -> MutexGuard<'_, PeerInfo> {
        self.info.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("label", &self.label())
            .field("direction", &self.direction)
            .field("state", &self.state())
            .finish()
    }
}

/// Read-only view of one link for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct PeerSnapshot {
    pub address: String,
    pub peer_id: Option<String>,
    pub agent: Option<String>,
    pub direction: Direction,
    pub state: PeerState,
    pub counters: Counters,
    pub rtt_ms: Option<u64>,
    pub connected_secs: u64,
}
