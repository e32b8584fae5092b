//! Node identity and its persistence.
//!
//! The identity is what survives a restart: the peer ID, the signing key the
//! directory server issued, whether our port is reachable, the last region
//! counts and the peers worth re-dialing. It is written after every change
//! so a crash loses at most one directory cycle.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, FixedOffset, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use epsp_core::region::RegionCounts;
use epsp_core::wire::parse_protocol_time;

use crate::error::StoreError;

/// Renew the signing key this many minutes before it expires.
pub const KEY_RENEW_MARGIN_MINUTES: i64 = 30;

// ── Signing key ───────────────────────────────────────────────────────────────

/// Key material issued by the directory server (`237`/`244` replies).
///
/// All four fields are kept in wire form. `expiry` in particular is signed
/// as text, so it is never re-formatted.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct SigningKey {
    pub secret: String,
    pub public: String,
    pub expiry: String,
    pub signature: String,
}

impl SigningKey {
    /// Parse `secret:public:expiry:signature`.
    pub fn from_reply(payload: &str) -> Option<Self> {
        let fields: Vec<&str> = payload.split(':').collect();
        let [secret, public, expiry, signature] = fields.as_slice() else {
            return None;
        };
        parse_protocol_time(expiry).ok()?;
        Some(Self {
            secret: secret.to_string(),
            public: public.to_string(),
            expiry: expiry.to_string(),
            signature: signature.to_string(),
        })
    }

    pub fn expires_at(&self) -> Option<DateTime<FixedOffset>> {
        parse_protocol_time(&self.expiry).ok()
    }

    /// True once `now` is within the renewal margin of expiry, or if the
    /// stored expiry does not parse.
    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at() {
            Some(expiry) => now > expiry - TimeDelta::minutes(KEY_RENEW_MARGIN_MINUTES),
            None => true,
        }
    }
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey")
            .field("public", &self.public)
            .field("expiry", &self.expiry)
            .finish_non_exhaustive()
    }
}

// ── Identity ──────────────────────────────────────────────────────────────────

/// Live identity. Written by the directory task, read by dispatch.
#[derive(Debug, Clone, Default)]
pub struct NodeIdentity {
    /// Temporary until `registered`.
    pub peer_id: String,
    pub registered: bool,
    pub key: Option<SigningKey>,
    pub region: String,
    /// Target inbound link count.
    pub incoming: u64,
    /// Our listen port is reachable from the directory server.
    pub reachable: bool,
    pub region_counts: RegionCounts,
    /// Directory server clock minus ours, once measured.
    pub clock_skew: Option<TimeDelta>,
}

impl NodeIdentity {
    pub fn new(region: impl Into<String>, incoming: u64) -> Self {
        Self {
            region: region.into(),
            incoming,
            ..Self::default()
        }
    }

    /// Restore persisted fields. A stored peer ID counts as registered.
    pub fn restore(&mut self, stored: &StoredIdentity) {
        self.peer_id = stored.peer_id.clone();
        self.registered = !stored.peer_id.is_empty();
        self.key = stored.key.clone();
        self.reachable = stored.reachable;
        self.region_counts = stored.region_counts.clone();
    }

    /// Persisted form. A temporary ID is not saved, so a restart never
    /// mistakes it for a registered one.
    pub fn to_stored(&self, peers: Vec<String>) -> StoredIdentity {
        let peer_id = if self.registered {
            self.peer_id.clone()
        } else {
            String::new()
        };
        StoredIdentity {
            peer_id,
            key: self.key.clone(),
            reachable: self.reachable,
            region_counts: self.region_counts.clone(),
            peers,
        }
    }

    /// Known swarm size, the bound on relay hops.
    pub fn swarm_size(&self) -> u64 {
        self.region_counts.total()
    }
}

/// On-disk form of the identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoredIdentity {
    pub peer_id: String,
    pub key: Option<SigningKey>,
    pub reachable: bool,
    pub region_counts: RegionCounts,
    /// `host,port,peer-id` triples to dial on the next start.
    pub peers: Vec<String>,
}

// ── Stores ────────────────────────────────────────────────────────────────────

pub trait IdentityStore: Send + Sync {
    fn load(&self) -> Result<Option<StoredIdentity>, StoreError>;
    fn save(&self, identity: &StoredIdentity) -> Result<(), StoreError>;
}

/// A JSON key file.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }
}

impl IdentityStore for JsonFileStore {
    fn load(&self) -> Result<Option<StoredIdentity>, StoreError> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_error(e)),
        };
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|source| StoreError::Json {
                path: self.path.display().to_string(),
                source,
            })
    }

    fn save(&self, identity: &StoredIdentity) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        }
        let text = serde_json::to_string_pretty(identity).map_err(|source| StoreError::Json {
            path: self.path.display().to_string(),
            source,
        })?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, text).map_err(|e| self.io_error(e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| self.io_error(e))
    }
}

/// In-process store, for embedding and tests.
#[derive(Default)]
pub struct MemoryStore {
    slot: Mutex<Option<StoredIdentity>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(identity: StoredIdentity) -> Self {
        Self {
            slot: Mutex::new(Some(identity)),
        }
    }
}

impl IdentityStore for MemoryStore {
    fn load(&self) -> Result<Option<StoredIdentity>, StoreError> {
        Ok(self
            .slot
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone())
    }

    fn save(&self, identity: &StoredIdentity) -> Result<(), StoreError> {
        *self
            .slot
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(identity.clone());
        Ok(())
    }
}
