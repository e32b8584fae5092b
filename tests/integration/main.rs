//! EPSP integration test harness.
//!
//! Every test runs real nodes over loopback TCP against an in-process
//! directory server. Nothing outside the test process is touched, so the
//! tests can run in parallel.
//!
//!   cargo test --test integration

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use anyhow::{bail, Result};
use chrono::{TimeDelta, Utc};
use rsa::RsaPrivateKey;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use epsp_core::crypto::{self, TrustAnchors};
use epsp_core::wire::{format_time, protocol_zone, Agent, Frame};
use epsp_node::{IdentityStore, MemoryStore, Message, MessageHandler, Node, NodeConfig};

mod gossip;
mod registration;
mod trace;

// ── Keys ──────────────────────────────────────────────────────────────────────

/// Trust anchor private halves, shared by every test in the process.
pub struct Keys {
    pub server: RsaPrivateKey,
    pub peer_anchor: RsaPrivateKey,
}

pub fn keys() -> &'static Keys {
    static KEYS: OnceLock<Keys> = OnceLock::new();
    KEYS.get_or_init(|| {
        let mut rng = rand::thread_rng();
        Keys {
            server: RsaPrivateKey::new(&mut rng, 1024).unwrap(),
            peer_anchor: RsaPrivateKey::new(&mut rng, 1024).unwrap(),
        }
    })
}

pub fn trust() -> TrustAnchors {
    let k = keys();
    TrustAnchors {
        server: k.server.to_public_key(),
        peer: k.peer_anchor.to_public_key(),
    }
}

/// A `5x1`/`5x2` frame signed with the server anchor, valid for a day.
pub fn server_signed(code: &str, body: &str) -> Frame {
    let expiry = format_time(&(Utc::now() + TimeDelta::days(1)));
    let signature = crypto::sign_data(&keys().server, &expiry, body).unwrap();
    Frame::new(code, 0).with_payload(format!("{signature}:{expiry}:{body}"))
}

// ── Directory server ──────────────────────────────────────────────────────────

#[derive(Default)]
struct DirectoryState {
    next_id: u64,
    /// `host,port,peer-id` of every registered node.
    registered: Vec<String>,
    /// Request lines, one list per session.
    sessions: Vec<Vec<String>>,
}

/// An in-process directory server that assigns IDs, remembers
/// registrations and hands every node the others as candidates.
pub struct FakeDirectory {
    pub addr: String,
    state: Arc<Mutex<DirectoryState>>,
}

impl FakeDirectory {
    pub async fn start(region_counts: &str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let state = Arc::new(Mutex::new(DirectoryState {
            next_id: 1000,
            ..DirectoryState::default()
        }));
        let counts = region_counts.to_string();

        let shared = state.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(serve_session(stream, shared.clone(), counts.clone()));
            }
        });

        Self { addr, state }
    }

    /// Request lines of every session so far.
    pub fn sessions(&self) -> Vec<Vec<String>> {
        self.state.lock().unwrap().sessions.clone()
    }

    pub fn registered(&self) -> Vec<String> {
        self.state.lock().unwrap().registered.clone()
    }
}

async fn serve_session(
    stream: tokio::net::TcpStream,
    state: Arc<Mutex<DirectoryState>>,
    region_counts: String,
) {
    let (r, mut w) = stream.into_split();
    let mut lines = BufReader::new(r).lines();
    let session = {
        let mut state = state.lock().unwrap();
        state.sessions.push(Vec::new());
        state.sessions.len() - 1
    };

    if w.write_all(b"211 1\r\n").await.is_err() {
        return;
    }
    while let Ok(Some(line)) = lines.next_line().await {
        let frame = Frame::parse(&line);
        let payload = frame.payload_str().to_string();
        state.lock().unwrap().sessions[session].push(line.clone());

        let reply = match frame.code.as_str() {
            "131" => Some("212 1 0.34:fake-directory".to_string()),
            "113" => {
                let mut state = state.lock().unwrap();
                state.next_id += 1;
                Some(format!("233 1 {}", state.next_id))
            }
            "114" => Some("234 1 1".to_string()),
            "115" => {
                let state = state.lock().unwrap();
                let others: Vec<&str> = state
                    .registered
                    .iter()
                    .filter(|t| !t.ends_with(&format!(",{payload}")))
                    .map(String::as_str)
                    .collect();
                Some(format!("235 1 {}", others.join(":")))
            }
            "116" => {
                let fields: Vec<&str> = payload.split(':').collect();
                let mut state = state.lock().unwrap();
                state
                    .registered
                    .push(format!("127.0.0.1,{},{}", fields[1], fields[0]));
                Some(format!("236 1 {}", state.registered.len()))
            }
            "117" | "124" => {
                let expiry = format_time(
                    &(Utc::now() + TimeDelta::hours(6)).with_timezone(&protocol_zone()),
                );
                let code = if frame.code == "117" { "237" } else { "244" };
                Some(format!("{code} 1 c2VjcmV0:cHVibGlj:{expiry}:c2ln"))
            }
            "118" => Some(format!(
                "238 1 {}",
                format_time(&Utc::now().with_timezone(&protocol_zone()))
            )),
            "123" => Some("243 1".to_string()),
            "127" => Some(format!("247 1 {region_counts}")),
            "155" => None,
            "119" => {
                let _ = w.write_all(b"239 1\r\n").await;
                return;
            }
            _ => Some("299 1".to_string()),
        };
        if let Some(reply) = reply {
            if w.write_all(format!("{reply}\r\n").as_bytes()).await.is_err() {
                return;
            }
        }
    }
}

// ── Nodes ─────────────────────────────────────────────────────────────────────

/// Collects every message a node delivers.
#[derive(Default)]
pub struct Inbox(Mutex<Vec<Message>>);

impl MessageHandler for Inbox {
    fn on_message(&self, message: &Message) {
        self.0.lock().unwrap().push(message.clone());
    }
}

impl Inbox {
    pub fn messages(&self) -> Vec<Message> {
        self.0.lock().unwrap().clone()
    }

    pub fn with_code(&self, code: &str) -> Vec<Message> {
        self.messages()
            .into_iter()
            .filter(|m| m.code == code)
            .collect()
    }
}

/// A running node and the handles a test needs.
pub struct TestNode {
    pub node: Arc<Node>,
    pub inbox: Arc<Inbox>,
    pub store: Arc<MemoryStore>,
    pub cancel: CancellationToken,
    pub task: tokio::task::JoinHandle<Result<(), epsp_node::NodeError>>,
}

pub fn node_config(servers: Vec<String>, incoming: u64) -> NodeConfig {
    NodeConfig {
        servers,
        port: 0,
        region: "250".into(),
        incoming,
        agent: Agent::default(),
        trust: trust(),
    }
}

pub fn spawn_node(config: NodeConfig, store: Arc<MemoryStore>) -> TestNode {
    let inbox = Arc::new(Inbox::default());
    let node = Arc::new(Node::new(config, store.clone(), inbox.clone()).unwrap());
    let cancel = CancellationToken::new();
    let task = {
        let node = node.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { node.run(cancel).await })
    };
    TestNode {
        node,
        inbox,
        store,
        cancel,
        task,
    }
}

impl TestNode {
    pub async fn stop(self) -> Result<(), epsp_node::NodeError> {
        self.cancel.cancel();
        self.task.await.unwrap()
    }

    pub fn peer_id(&self) -> String {
        self.node.peer_id()
    }

    pub fn registered(&self) -> bool {
        self.store
            .load()
            .unwrap()
            .is_some_and(|s| !s.peer_id.is_empty() && s.key.is_some())
    }

    /// IDs on open links in either direction.
    pub fn linked_ids(&self) -> BTreeSet<String> {
        let snapshot = self.node.snapshot();
        snapshot
            .inbound
            .iter()
            .chain(snapshot.outbound.iter())
            .filter(|p| p.state != epsp_node::PeerState::Closed)
            .filter_map(|p| p.peer_id.clone())
            .collect()
    }

    /// `(unique, duplicate)` summed over every link.
    pub fn payload_counts(&self) -> (u64, u64) {
        let snapshot = self.node.snapshot();
        snapshot
            .inbound
            .iter()
            .chain(snapshot.outbound.iter())
            .fold((0, 0), |(u, d), p| (u + p.counters.unique, d + p.counters.duplicate))
    }
}

/// Poll `cond` every 20 ms until it holds or `within` elapses.
pub async fn wait_for(within: Duration, what: &str, mut cond: impl FnMut() -> bool) -> Result<()> {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    if cond() {
        return Ok(());
    }
    bail!("timed out waiting for {what}")
}

pub fn ids<S: AsRef<str>>(list: &[S]) -> BTreeSet<String> {
    list.iter().map(|s| s.as_ref().to_string()).collect()
}
