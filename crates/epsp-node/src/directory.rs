//! Directory server session.
//!
//! A short sequential conversation: connect, negotiate versions, run a few
//! request/reply pairs, close. Every reply code is checked; anything other
//! than the expected code is `UnexpectedReply`.

use std::time::Duration;

use chrono::{DateTime, FixedOffset, Utc};
use tokio_util::sync::CancellationToken;

use epsp_core::region::RegionCounts;
use epsp_core::wire::{code, parse_protocol_time, Agent, Candidate, Frame, NO_HOP};

use crate::conn::Connection;
use crate::error::{ConnError, DirectoryError};
use crate::identity::SigningKey;
use crate::registry::PeerRegistry;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
pub const ECHO_TIMEOUT: Duration = Duration::from_secs(10);
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Result of a key request.
#[derive(Debug)]
pub enum KeyOutcome {
    /// The current key is not near expiry; nothing was sent.
    NotDue,
    /// The server issued a new key.
    Issued(SigningKey),
    /// The server says a key is already assigned to us.
    AlreadyAssigned,
}

pub struct DirectoryClient {
    server: String,
    conn: Connection,
    cancel: CancellationToken,
}

impl DirectoryClient {
    /// Connect and negotiate versions. `agent` drops to the server's
    /// protocol version if that sorts lower.
    pub async fn connect(
        server: &str,
        agent: &mut Agent,
        cancel: &CancellationToken,
    ) -> Result<Self, DirectoryError> {
        let conn = Connection::connect(server, CONNECT_TIMEOUT, cancel).await?;
        tracing::debug!(server, "directory connected");
        let client = Self {
            server: server.to_string(),
            conn,
            cancel: cancel.clone(),
        };
        match tokio::time::timeout(CONNECT_TIMEOUT, client.negotiate_version(agent)).await {
            Ok(Ok(())) => Ok(client),
            Ok(Err(e)) => {
                client.conn.close();
                Err(e)
            }
            Err(_) => {
                client.conn.close();
                Err(DirectoryError::Timeout)
            }
        }
    }

    async fn negotiate_version(&self, agent: &mut Agent) -> Result<(), DirectoryError> {
        loop {
            let frame = self.conn.read(&self.cancel).await?;
            match frame.code.as_str() {
                code::SERVER_VERSION_REQUEST => {
                    self.send(code::CLIENT_VERSION, Some(&agent.to_string()))
                        .await?;
                }
                code::SERVER_VERSION => {
                    let theirs: Agent = frame.payload_str().parse().unwrap_or_else(|e| match e {});
                    if agent.adopt_lower_version(&theirs) {
                        tracing::info!(server = %self.server, agent = %agent, "adopted server protocol version");
                    }
                    tracing::debug!(server = %self.server, server_agent = %theirs, "version negotiated");
                    return Ok(());
                }
                _ => return Err(unexpected("211/212", &frame)),
            }
        }
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    // ── Requests ──────────────────────────────────────────────────────────────

    pub async fn get_temporary_id(&self) -> Result<String, DirectoryError> {
        let reply = self
            .request(code::TEMP_ID_REQUEST, None, &[code::TEMP_ID_REPLY])
            .await?;
        let id = reply.payload_str();
        if id.is_empty() {
            return Err(DirectoryError::Malformed(reply.to_line()));
        }
        tracing::debug!(server = %self.server, peer_id = id, "temporary id assigned");
        Ok(id.to_string())
    }

    /// Candidate peers as raw `host,port,peer-id` entries.
    pub async fn get_peers(&self, peer_id: &str) -> Result<Vec<String>, DirectoryError> {
        let reply = self
            .request(code::PEER_LIST_REQUEST, Some(peer_id), &[code::PEER_LIST_REPLY])
            .await?;
        let peers: Vec<String> = Candidate::parse_list(reply.payload_str())
            .iter()
            .map(Candidate::to_string)
            .collect();
        tracing::debug!(server = %self.server, count = peers.len(), "candidate peers received");
        Ok(peers)
    }

    /// Full registration. Returns the swarm size the server reports, if any.
    pub async fn register(
        &self,
        peer_id: &str,
        port: u16,
        region: &str,
        connected: u64,
        incoming: u64,
    ) -> Result<Option<u64>, DirectoryError> {
        let payload = format!("{peer_id}:{port}:{region}:{connected}:{incoming}");
        let reply = self
            .request(code::REGISTER_REQUEST, Some(&payload), &[code::REGISTER_REPLY])
            .await?;
        let swarm = reply.payload_str().parse().ok();
        tracing::info!(server = %self.server, peer_id, ?swarm, "registered");
        Ok(swarm)
    }

    pub async fn check_port_open(&self, peer_id: &str, port: u16) -> Result<bool, DirectoryError> {
        let payload = format!("{peer_id}:{port}");
        let reply = self
            .request(code::PORT_CHECK_REQUEST, Some(&payload), &[code::PORT_CHECK_REPLY])
            .await?;
        let open = reply.payload_str() == "1";
        tracing::info!(server = %self.server, port, open, "port check");
        Ok(open)
    }

    /// Request a key if `current` is missing or within the renewal margin.
    ///
    /// With `renew` and an existing key the request is `124 id+secret`,
    /// otherwise `117 id`.
    pub async fn get_or_renew_key(
        &self,
        peer_id: &str,
        current: Option<&SigningKey>,
        renew: bool,
        now: DateTime<Utc>,
    ) -> Result<KeyOutcome, DirectoryError> {
        if current.is_some_and(|k| !k.needs_refresh(now)) {
            return Ok(KeyOutcome::NotDue);
        }

        let expected = [code::KEY_REPLY, code::KEY_RENEW_REPLY, code::KEY_ALREADY_ASSIGNED];
        let reply = match current.filter(|_| renew) {
            Some(key) => {
                let payload = format!("{peer_id}+{}", key.secret);
                self.request(code::KEY_RENEW_REQUEST, Some(&payload), &expected)
                    .await?
            }
            None => {
                self.request(code::KEY_REQUEST, Some(peer_id), &expected)
                    .await?
            }
        };

        if reply.code == code::KEY_ALREADY_ASSIGNED {
            tracing::debug!(server = %self.server, "key already assigned");
            return Ok(KeyOutcome::AlreadyAssigned);
        }
        let key = SigningKey::from_reply(reply.payload_str())
            .ok_or_else(|| DirectoryError::Malformed(reply.code.clone()))?;
        tracing::info!(server = %self.server, expiry = %key.expiry, "signing key issued");
        Ok(KeyOutcome::Issued(key))
    }

    /// Keepalive for a registered peer. `299` means the server saw us from
    /// a different address and we must re-register.
    pub async fn echo(&self, peer_id: &str, connected: u64) -> Result<(), DirectoryError> {
        let payload = format!("{peer_id}:{connected}");
        self.conn.mark_ping_sent();
        let reply = tokio::time::timeout(
            ECHO_TIMEOUT,
            self.request(
                code::ECHO_REQUEST,
                Some(&payload),
                &[code::ECHO_REPLY, code::ADDRESS_CHANGED],
            ),
        )
        .await
        .map_err(|_| DirectoryError::Timeout)??;

        if reply.code == code::ADDRESS_CHANGED {
            return Err(DirectoryError::AddressChanged);
        }
        self.conn.mark_pong_received();
        tracing::debug!(server = %self.server, rtt = ?self.conn.rtt(), "echo");
        Ok(())
    }

    pub async fn region_peer_counts(&self) -> Result<RegionCounts, DirectoryError> {
        let reply = self
            .request(code::REGION_COUNT_REQUEST, None, &[code::REGION_COUNT_REPLY])
            .await?;
        let counts = RegionCounts::parse(reply.payload_str());
        tracing::debug!(server = %self.server, total = counts.total(), "region counts");
        Ok(counts)
    }

    /// The server's clock, in its fixed zone.
    pub async fn protocol_time(&self) -> Result<DateTime<FixedOffset>, DirectoryError> {
        let reply = self
            .request(code::TIME_REQUEST, None, &[code::TIME_REPLY])
            .await?;
        parse_protocol_time(reply.payload_str())
            .map_err(|e| DirectoryError::Malformed(e.to_string()))
    }

    /// Report which of the offered `candidates` we actually linked to.
    /// Nothing is sent if none are. Returns the reported IDs.
    pub async fn tell_peers(
        &self,
        registry: &PeerRegistry,
        candidates: &[String],
    ) -> Result<Vec<String>, DirectoryError> {
        let connected = registry.connected_peer_ids();
        let linked: Vec<String> = candidates
            .iter()
            .filter_map(|c| c.rsplit(',').next())
            .filter(|id| connected.iter().any(|c| c == id))
            .map(str::to_string)
            .collect();

        if !linked.is_empty() {
            self.send(code::CONNECTED_PEERS_REPORT, Some(&linked.join(":")))
                .await?;
            tracing::debug!(server = %self.server, count = linked.len(), "reported linked peers");
        }
        Ok(linked)
    }

    /// Ask the server to end the session, then drop the socket regardless.
    pub async fn close(self) {
        let graceful = async {
            self.send(code::CLOSE_REQUEST, None).await?;
            let reply = self.conn.read(&self.cancel).await?;
            if reply.code != code::CLOSE_REPLY {
                return Err(unexpected(code::CLOSE_REPLY, &reply));
            }
            Ok::<(), DirectoryError>(())
        };
        match tokio::time::timeout(CLOSE_TIMEOUT, graceful).await {
            Ok(Ok(())) => tracing::debug!(server = %self.server, "directory session closed"),
            Ok(Err(e)) => tracing::debug!(server = %self.server, error = %e, "directory close not acknowledged"),
            Err(_) => tracing::debug!(server = %self.server, "directory close timed out"),
        }
        self.conn.close();
    }

    // ── Plumbing ──────────────────────────────────────────────────────────────

    async fn send(&self, code: &str, payload: Option<&str>) -> Result<(), ConnError> {
        let hop = NO_HOP.to_string();
        let mut fields = vec![code, hop.as_str()];
        if let Some(payload) = payload {
            fields.push(payload);
        }
        tracing::trace!(server = %self.server, code, "directory send");
        self.conn.write(&fields).await
    }

    async fn request(
        &self,
        code: &str,
        payload: Option<&str>,
        expected: &[&str],
    ) -> Result<Frame, DirectoryError> {
        self.send(code, payload).await?;
        let reply = self.conn.read(&self.cancel).await?;
        tracing::trace!(server = %self.server, line = %reply, "directory reply");
        if !expected.contains(&reply.code.as_str()) {
            return Err(unexpected(&expected.join("/"), &reply));
        }
        Ok(reply)
    }
}

fn unexpected(expected: &str, got: &Frame) -> DirectoryError {
    DirectoryError::UnexpectedReply {
        expected: expected.to_string(),
        got: got.to_line(),
    }
}
