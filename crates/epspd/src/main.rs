//! epspd: EPSP swarm daemon.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use epsp_core::config::EpspConfig;
use epsp_node::{JsonFileStore, Node, NodeConfig};

mod handler;

use handler::LogHandler;

const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = EpspConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = EpspConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        EpspConfig::default()
    });

    let key_file = config.key_file();
    tracing::info!(
        servers = ?config.network.servers,
        port = config.network.port,
        region = %config.network.region,
        incoming = config.network.incoming,
        key_file = %key_file.display(),
        "epspd starting"
    );

    let node_config = NodeConfig::from_config(&config).context("invalid trust anchors")?;
    let store = Arc::new(JsonFileStore::new(key_file));
    let handler = Arc::new(LogHandler::new());
    let node = Arc::new(Node::new(node_config, store, handler.clone())?);

    // ── Shutdown ─────────────────────────────────────────────────────────────
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            cancel.cancel();
        });
    }

    // ── Snapshot logging ─────────────────────────────────────────────────────
    let snapshot_printer = {
        let node = node.clone();
        let handler = handler.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SNAPSHOT_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = interval.tick() => {}
                }
                let snapshot = node.snapshot();
                tracing::info!(
                    peer_id = %snapshot.peer_id,
                    registered = snapshot.registered,
                    reachable = snapshot.reachable,
                    swarm = snapshot.swarm_size,
                    regions = %snapshot.region_counts,
                    inbound = snapshot.inbound.len(),
                    outbound = snapshot.outbound.len(),
                    traced = handler.topology().len(),
                    "node snapshot"
                );
                match serde_json::to_string(&snapshot) {
                    Ok(json) => tracing::debug!(snapshot = %json, "node snapshot detail"),
                    Err(e) => tracing::warn!(error = %e, "snapshot not serialisable"),
                }
            }
        })
    };

    // ── Run ──────────────────────────────────────────────────────────────────
    let result = node.run(cancel.clone()).await;
    cancel.cancel();
    let _ = snapshot_printer.await;

    result.context("node exited")
}
