//! Configuration for an EPSP node.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $EPSP_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/epsp/config.toml
//!   3. ~/.config/epsp/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::wire::Agent;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EpspConfig {
    /// Version tokens advertised to peers and servers.
    pub agent: Agent,
    pub identity: IdentityConfig,
    pub network: NetworkConfig,
    pub trust: TrustConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// JSON file holding the peer ID, signing key and saved peers.
    /// Empty = derived from the first directory server.
    pub key_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Directory servers, `host:port`, tried round-robin.
    pub servers: Vec<String>,
    /// TCP port for inbound peer links.
    pub port: u16,
    /// Region code reported at registration.
    pub region: String,
    /// Target number of inbound peers.
    pub incoming: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustConfig {
    /// PEM public key the directory server signs data with.
    pub server_key: String,
    /// PEM public key the directory server certifies peer keys with.
    pub peer_key: String,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

const DEFAULT_SERVER_KEY: &str = "-----BEGIN PUBLIC KEY-----
MIGdMA0GCSqGSIb3DQEBAQUAA4GLADCBhwKBgQC8p/vth2yb/k9x2/PcXKdb6oI3gAbhvr
/HPTOwla5tQHB83LXNF4Y+Sv/Mu4Uu0tKWz02FrLgA5cuJZfba9QNULTZLTNUgUXIB0m/d
q5Rx17IyCfLQ2XngmfFkfnRdRSK7kGnIXvO2/LOKD50JsTf2vz0RQIdw6cEmdl+Aga7i8Q
IBEQ==
-----END PUBLIC KEY-----
";

const DEFAULT_PEER_KEY: &str = "-----BEGIN PUBLIC KEY-----
MIGdMA0GCSqGSIb3DQEBAQUAA4GLADCBhwKBgQDTJKLLO7wjCHz80kpnisqcPDQvA9voNY
5QuAA+bOWeqvl4gmPSiylzQZzldS+n/M5p4o1PRS24WAO+kPBHCf4ETAns8M02MFwxH/Fl
QnbvMfi9zutJkQAu3Hq4293rHz+iCQW/MWYB5IfzFBnWtEdjkhqHsGy6sZMMe+qx/F1rcQ
IBEQ==
-----END PUBLIC KEY-----
";

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            servers: vec![
                "www.p2pquake.net:6910".into(),
                "p2pquake.dnsalias.net:6910".into(),
                "p2pquake.dyndns.info:6910".into(),
                "p2pquake.ddo.jp:6910".into(),
            ],
            port: 6911,
            region: "250".into(),
            incoming: 20,
        }
    }
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            server_key: DEFAULT_SERVER_KEY.into(),
            peer_key: DEFAULT_PEER_KEY.into(),
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("epsp")
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("epsp")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl EpspConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            EpspConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("EPSP_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&EpspConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// The identity file actually used: the configured path, or one named
    /// after the first directory server (`host:port` → `hostPport.json`).
    pub fn key_file(&self) -> PathBuf {
        if !self.identity.key_file.as_os_str().is_empty() {
            return self.identity.key_file.clone();
        }
        let stem = self
            .network
            .servers
            .first()
            .map(|s| s.replace(':', "P"))
            .unwrap_or_else(|| "identity".into());
        data_dir().join(format!("{stem}.json"))
    }

    /// Apply EPSP_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("EPSP_NETWORK__SERVERS") {
            self.network.servers = parse_server_list(&v);
        }
        if let Ok(v) = std::env::var("EPSP_NETWORK__PORT") {
            if let Ok(p) = v.parse() {
                self.network.port = p;
            }
        }
        if let Ok(v) = std::env::var("EPSP_NETWORK__REGION") {
            self.network.region = v;
        }
        if let Ok(v) = std::env::var("EPSP_NETWORK__INCOMING") {
            if let Ok(n) = v.parse() {
                self.network.incoming = n;
            }
        }
        if let Ok(v) = std::env::var("EPSP_IDENTITY__KEY_FILE") {
            self.identity.key_file = PathBuf::from(v);
        }
    }
}

fn parse_server_list(v: &str) -> Vec<String> {
    v.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
