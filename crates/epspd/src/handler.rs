//! Application side of the daemon: log what the swarm delivers.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use epsp_node::{Message, MessageHandler};

/// What one trace reply told us about the swarm layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceReport {
    pub hops: u64,
    pub connected: Vec<String>,
}

/// Logs verified data and keeps the latest trace reply per reporting peer.
#[derive(Default)]
pub struct LogHandler {
    topology: Mutex<BTreeMap<String, TraceReport>>,
}

impl LogHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Peers that have answered a trace probe.
    pub fn topology(&self) -> BTreeMap<String, TraceReport> {
        self.topology
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    // `asker:nonce:reporter:id,id,…:hops`
    fn record_trace(&self, fields: &[String]) {
        let [_, _, reporter, connected, hops, ..] = fields else {
            tracing::debug!(fields = fields.len(), "short trace reply");
            return;
        };
        let Ok(hops) = hops.parse::<u64>() else {
            return;
        };
        let connected: Vec<String> = connected
            .split(',')
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .collect();
        tracing::info!(reporter = %reporter, hops, links = connected.len(), "trace reply");
        self.topology
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(reporter.clone(), TraceReport { hops, connected });
    }
}

impl MessageHandler for LogHandler {
    fn on_message(&self, message: &Message) {
        let field = |i: usize| message.fields.get(i).map(String::as_str).unwrap_or("");
        match message.code.as_str() {
            "551" => tracing::info!(
                expiry = field(1),
                outline = field(2),
                detail = field(3),
                hops = message.hops,
                "earthquake report"
            ),
            "552" => tracing::info!(expiry = field(1), body = field(2), hops = message.hops, "tsunami report"),
            "555" => tracing::info!(
                expiry = field(1),
                public_key = field(2),
                body = field(5),
                hops = message.hops,
                "user detection report"
            ),
            "635" => self.record_trace(&message.fields),
            other => tracing::info!(
                code = other,
                hops = message.hops,
                payload = %message.fields.join(":"),
                "unrecognised data"
            ),
        }
    }
}
