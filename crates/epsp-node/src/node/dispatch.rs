//! Relayed-frame dispatch: dedup, signature checks, trace-echo and flooding.
//!
//! Every `5xx`, `615` and `635` frame read by any link lands here through one
//! channel, so the seen set and the trace map have a single writer path.
//! The dispatcher never awaits a socket: unicast replies run on their own
//! tasks, like the flood writes in `PeerRegistry::broadcast_except`.

use std::sync::Arc;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use epsp_core::crypto::{self, Scheme, TrustAnchors};
use epsp_core::region::RegionCounts;
use epsp_core::wire::{code, parse_utc_time, Frame};

use crate::error::DispatchError;
use crate::peer::{PeerConnection, PeerHost};

use super::{Message, Relayed, Shared};

/// What happened to an accepted frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Signature already seen; dropped.
    Duplicate,
    /// Written to `peers` links with the hop count bumped.
    Flooded { peers: usize },
    /// Trace reply handed back along the path it came from.
    ReturnedToOrigin,
    /// Addressed to us, or nothing left to do.
    Consumed,
}

pub(super) async fn run(
    shared: Arc<Shared>,
    mut rx: mpsc::UnboundedReceiver<Relayed>,
    cancel: CancellationToken,
) {
    loop {
        let (from, frame) = tokio::select! {
            _ = cancel.cancelled() => return,
            next = rx.recv() => match next {
                Some(next) => next,
                None => return,
            },
        };

        match dispatch(&shared, &from, &frame) {
            Ok(disposition) => {
                tracing::trace!(peer = %from.label(), code = %frame.code, ?disposition, "dispatched");
            }
            Err(e @ (DispatchError::Expired(_) | DispatchError::HopLimitExceeded { .. })) => {
                tracing::debug!(peer = %from.label(), code = %frame.code, error = %e, "frame dropped");
            }
            Err(e) => {
                tracing::warn!(peer = %from.label(), code = %frame.code, error = %e, "frame rejected");
            }
        }
    }
}

pub(super) fn dispatch(
    shared: &Arc<Shared>,
    from: &Arc<PeerConnection>,
    frame: &Frame,
) -> Result<Disposition, DispatchError> {
    let hops = frame
        .hop_count()
        .map_err(|_| DispatchError::Malformed(frame.to_line()))?;
    let fields = frame.payload_fields();

    if frame.is_signed_data() {
        if fields.len() < 3 {
            return Err(DispatchError::Malformed(frame.to_line()));
        }
        let expiry = parse_utc_time(fields[1])
            .map_err(|_| DispatchError::Malformed(frame.to_line()))?;
        if Utc::now() > expiry {
            return Err(DispatchError::Expired(fields[1].to_string()));
        }
        if !shared.seen.insert(fields[0].to_string()) {
            from.connection().mark_duplicate();
            return Ok(Disposition::Duplicate);
        }
        from.connection().mark_unique();
        verify(&shared.config.trust, frame, &fields)?;
    }

    match frame.code.as_str() {
        code::REGION_COUNT_UPDATE => {
            let counts = RegionCounts::parse(fields[2]);
            tracing::debug!(total = counts.total(), "region counts updated");
            shared.identity_mut().region_counts = counts;
            shared.persist();
        }
        code::TRACE_PROBE => {
            let [origin, nonce, ..] = fields.as_slice() else {
                return Err(DispatchError::Malformed(frame.to_line()));
            };
            let own = shared.local_peer_id();
            if *origin == own {
                return Ok(Disposition::Consumed);
            }
            let first_sighting = match shared.traces.entry(nonce.to_string()) {
                Entry::Occupied(_) => false,
                Entry::Vacant(slot) => {
                    slot.insert(from.clone());
                    true
                }
            };
            if first_sighting {
                let reply = format!(
                    "{}:{}:{}:{}",
                    frame.payload_str(),
                    own,
                    shared.connected_peer_ids().join(","),
                    hops
                );
                let from = from.clone();
                let nonce = nonce.to_string();
                tokio::spawn(async move {
                    match from.send(code::TRACE_REPLY, Some(&reply)).await {
                        Ok(()) => {
                            tracing::debug!(peer = %from.label(), nonce = %nonce, "trace probe answered")
                        }
                        Err(e) => {
                            from.close();
                            let e = DispatchError::TraceReplyFailed(e);
                            tracing::warn!(peer = %from.label(), nonce = %nonce, error = %e, "closing link");
                        }
                    }
                });
            }
        }
        code::TRACE_REPLY => {
            let [asker, nonce, ..] = fields.as_slice() else {
                return Err(DispatchError::Malformed(frame.to_line()));
            };
            if *asker == shared.local_peer_id() {
                shared.handler.on_message(&Message::from_frame(frame));
                return Ok(Disposition::Consumed);
            }
            let Some(origin) = shared.traces.get(*nonce).map(|entry| entry.value().clone()) else {
                return Ok(Disposition::Consumed);
            };
            if origin.is_open() {
                let shared = shared.clone();
                let from = from.clone();
                let frame = frame.clone();
                tokio::spawn(async move {
                    if let Err(e) = origin.send_frame(&frame).await {
                        tracing::debug!(peer = %origin.label(), error = %e, "trace origin gone, flooding reply");
                        if let Err(e) = flood(&shared, &from, &frame, hops) {
                            tracing::debug!(code = %frame.code, error = %e, "trace reply dropped");
                        }
                    }
                });
                return Ok(Disposition::ReturnedToOrigin);
            }
            tracing::debug!(peer = %origin.label(), "trace origin closed, flooding reply");
        }
        _ => shared.handler.on_message(&Message::from_frame(frame)),
    }

    flood(shared, from, frame, hops)
}

/// Check the signature chain of a `5xx` frame. `fields` has at least three
/// entries.
fn verify(trust: &TrustAnchors, frame: &Frame, fields: &[&str]) -> Result<(), DispatchError> {
    match Scheme::for_code(&frame.code) {
        Some(Scheme::Server) => {
            crypto::verify_data_signature(&trust.server, fields[0], fields[1], fields[2])
                .map_err(DispatchError::BadServerSignature)
        }
        Some(Scheme::Peer) => {
            let [signature, expiry, public_key, key_signature, key_expiry, body, ..] = fields else {
                return Err(DispatchError::Malformed(frame.to_line()));
            };
            let key = crypto::verify_key_certificate(
                &trust.peer,
                public_key,
                key_signature,
                key_expiry,
                Utc::now(),
            )
            .map_err(DispatchError::BadPeerCertificate)?;
            crypto::verify_data_signature(&key, signature, expiry, body)
                .map_err(DispatchError::BadPeerSignature)
        }
        None => Err(DispatchError::UnknownScheme(frame.code.clone())),
    }
}

/// Relay to every other link with the hop count bumped, unless the frame
/// has already travelled as far as the swarm is large.
fn flood(
    shared: &Shared,
    from: &Arc<PeerConnection>,
    frame: &Frame,
    hops: u64,
) -> Result<Disposition, DispatchError> {
    let next = hops.saturating_add(1);
    let swarm = shared.identity().swarm_size();
    if swarm < next {
        return Err(DispatchError::HopLimitExceeded { swarm, hops });
    }
    let relayed = frame.with_hop(next);
    let peers = shared.inbound.broadcast_except(Some(from), &relayed)
        + shared.outbound.broadcast_except(Some(from), &relayed);
    tracing::debug!(code = %frame.code, hops = next, peers, "flooded");
    Ok(Disposition::Flooded { peers })
}
