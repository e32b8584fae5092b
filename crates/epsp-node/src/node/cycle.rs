//! Directory reconnect loop.

use std::sync::atomic::Ordering;
use std::sync::PoisonError;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::directory::{DirectoryClient, KeyOutcome};
use crate::error::{DirectoryError, NodeError};

use super::Node;

/// Sleep used when the computed interval is too long or unusable.
const MAX_INTERVAL: Duration = Duration::from_secs(10 * 60);
/// Intervals above this are replaced with `MAX_INTERVAL`.
const CLAMP_ABOVE: Duration = Duration::from_secs(60);
const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Time between directory cycles: ten minutes scaled by connected links
/// over the inbound target.
pub fn backoff(connected: u64, incoming: u64) -> Duration {
    if incoming == 0 {
        return MAX_INTERVAL;
    }
    let millis = MAX_INTERVAL.as_millis() as u64 * connected / incoming;
    let interval = Duration::from_millis(millis);
    if interval > CLAMP_ABOVE {
        MAX_INTERVAL
    } else {
        interval.max(MIN_INTERVAL)
    }
}

/// Whether the peer counts call for more outbound links.
fn wants_more_peers(inbound: u64, outbound: u64, incoming: u64) -> bool {
    if inbound > 0 {
        outbound * 3 < incoming
    } else {
        outbound * 3 < incoming * 2
    }
}

impl Node {
    pub(super) async fn reconnect_loop(&self, cancel: &CancellationToken) -> Result<(), NodeError> {
        let servers = self.shared.config.servers.clone();
        let mut next = 0usize;
        let mut failures = 0usize;

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            let server = &servers[next % servers.len()];
            next = next.wrapping_add(1);

            match self.cycle(server, cancel).await {
                Ok(()) => failures = 0,
                Err(e) => {
                    if cancel.is_cancelled() {
                        return Ok(());
                    }
                    failures += 1;
                    tracing::warn!(server = %server, error = %e, failures, "directory cycle failed");
                    if failures <= servers.len() {
                        continue;
                    }
                    if self.shared.connected_count() == 0 {
                        return Err(NodeError::DirectoryUnavailable);
                    }
                    tracing::warn!(
                        peers = self.shared.connected_count(),
                        "all directory servers failed, continuing on peer links"
                    );
                    failures = 0;
                }
            }

            let wait = backoff(self.shared.connected_count(), self.shared.config.incoming);
            tracing::debug!(?wait, "next directory cycle");
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    async fn cycle(&self, server: &str, cancel: &CancellationToken) -> Result<(), DirectoryError> {
        let mut agent = self.shared.agent.read().unwrap_or_else(PoisonError::into_inner).clone();
        let client = DirectoryClient::connect(server, &mut agent, cancel).await?;
        *self.shared.agent.write().unwrap_or_else(PoisonError::into_inner) = agent;

        let result = self.cycle_steps(&client, cancel).await;
        client.close().await;
        self.shared.persist();
        result
    }

    async fn cycle_steps(
        &self,
        client: &DirectoryClient,
        cancel: &CancellationToken,
    ) -> Result<(), DirectoryError> {
        let shared = &self.shared;
        let (registered, peer_id) = {
            let identity = shared.identity();
            (identity.registered, identity.peer_id.clone())
        };

        let fresh = !registered;
        let peer_id = if registered {
            if let Err(e) = client.echo(&peer_id, shared.connected_count()).await {
                shared.identity_mut().registered = false;
                return Err(e);
            }
            self.refresh_key(client, &peer_id, true).await?;
            peer_id
        } else {
            let id = client.get_temporary_id().await?;
            shared.identity_mut().peer_id = id.clone();
            tracing::info!(peer_id = %id, "temporary peer id assigned");
            id
        };

        let pending = std::mem::take(&mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner));
        if !pending.is_empty() {
            tracing::info!(count = pending.len(), "dialing saved peers");
            self.connect_peers(&pending, cancel).await;
        }

        if !self.listener_started.load(Ordering::Relaxed) {
            if let Err(e) = self.start_listener(cancel).await {
                tracing::warn!(error = %e, "peer listener not started");
            }
            if fresh {
                let port = self.listen_port.load(Ordering::Relaxed);
                match client.check_port_open(&peer_id, port).await {
                    Ok(open) => shared.identity_mut().reachable = open,
                    Err(e) => tracing::warn!(error = %e, "port check failed"),
                }
            }
        }

        let incoming = shared.config.incoming;
        let inbound = shared.inbound.connected_count();
        let outbound = shared.outbound.connected_count();
        if fresh || wants_more_peers(inbound, outbound, incoming) {
            let candidates = client.get_peers(&peer_id).await?;
            self.connect_peers(&candidates, cancel).await;
            client.tell_peers(&shared.outbound, &candidates).await?;
        }

        if fresh {
            let reachable = shared.identity().reachable;
            let target = if reachable { incoming } else { 0 };
            let port = self.listen_port.load(Ordering::Relaxed);
            let region = shared.config.region.clone();
            client
                .register(&peer_id, port, &region, shared.connected_count(), target)
                .await?;
            shared.identity_mut().registered = true;
            self.refresh_key(client, &peer_id, false).await?;
            shared.persist();

            let (no_counts, no_skew) = {
                let identity = shared.identity();
                (identity.region_counts.is_empty(), identity.clock_skew.is_none())
            };
            if no_counts || no_skew {
                match client.region_peer_counts().await {
                    Ok(counts) => shared.identity_mut().region_counts = counts,
                    Err(e) => tracing::warn!(error = %e, "region counts unavailable"),
                }
            }
            if no_skew {
                match client.protocol_time().await {
                    Ok(server_time) => {
                        let skew = server_time.with_timezone(&Utc) - Utc::now();
                        tracing::info!(skew_ms = skew.num_milliseconds(), "clock skew measured");
                        shared.identity_mut().clock_skew = Some(skew);
                    }
                    Err(e) => tracing::warn!(error = %e, "protocol time unavailable"),
                }
            }
        }

        tracing::info!(
            server = %client.server(),
            peer_id = %peer_id,
            inbound = shared.inbound.connected_count(),
            outbound = shared.outbound.connected_count(),
            "directory cycle complete"
        );
        Ok(())
    }

    async fn refresh_key(
        &self,
        client: &DirectoryClient,
        peer_id: &str,
        renew: bool,
    ) -> Result<(), DirectoryError> {
        let current = self.shared.identity().key.clone();
        match client
            .get_or_renew_key(peer_id, current.as_ref(), renew, Utc::now())
            .await?
        {
            KeyOutcome::Issued(key) => self.shared.identity_mut().key = Some(key),
            KeyOutcome::NotDue | KeyOutcome::AlreadyAssigned => {}
        }
        Ok(())
    }
}
