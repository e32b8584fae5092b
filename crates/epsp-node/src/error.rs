//! Error types for the node crate.

use std::io;

use epsp_core::crypto::CryptoError;

/// Transport errors on a single connection.
///
/// Every variant except `Malformed` leaves the connection closed.
#[derive(Debug, thiserror::Error)]
pub enum ConnError {
    #[error("connection is closed")]
    NotConnected,

    #[error("remote closed the connection")]
    Disconnected,

    #[error("cancelled")]
    Cancelled,

    #[error("write failed: {0}")]
    WriteFailed(io::Error),

    #[error("read failed: {0}")]
    ReadFailed(io::Error),

    #[error("line exceeds {0} bytes")]
    LineTooLong(usize),

    #[error("line is not valid UTF-8")]
    Malformed,

    #[error("connect to {addr} failed: {source}")]
    ConnectFailed { addr: String, source: io::Error },

    #[error("timed out")]
    Timeout,
}

/// Protocol errors on a peer link.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error(transparent)]
    Conn(#[from] ConnError),

    #[error("peer id {0} is already connected")]
    DuplicateIdentity(String),

    #[error("peer id changed from {bound} to {got}")]
    IdentityMismatch { bound: String, got: String },

    #[error("peer reports incompatible version")]
    IncompatibleVersion,

    #[error("malformed frame: {0:?}")]
    MalformedFrame(String),
}

/// Errors from a directory server session.
#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error(transparent)]
    Conn(#[from] ConnError),

    #[error("expected reply {expected}, got {got:?}")]
    UnexpectedReply { expected: String, got: String },

    #[error("directory server reports our address changed")]
    AddressChanged,

    #[error("malformed reply: {0}")]
    Malformed(String),

    #[error("directory server did not answer in time")]
    Timeout,
}

/// Reasons a relayed frame is rejected.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("data expired at {0}")]
    Expired(String),

    #[error("malformed relayed frame: {0}")]
    Malformed(String),

    #[error("server signature rejected: {0}")]
    BadServerSignature(CryptoError),

    #[error("peer key certificate rejected: {0}")]
    BadPeerCertificate(CryptoError),

    #[error("peer data signature rejected: {0}")]
    BadPeerSignature(CryptoError),

    #[error("no signature scheme for code {0}")]
    UnknownScheme(String),

    #[error("swarm size {swarm} is below hop count {hops}")]
    HopLimitExceeded { swarm: u64, hops: u64 },

    #[error("trace reply to origin failed: {0}")]
    TraceReplyFailed(ConnError),
}

/// Identity persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("identity file {path}: {source}")]
    Io { path: String, source: io::Error },

    #[error("identity file {path}: {source}")]
    Json {
        path: String,
        source: serde_json::Error,
    },
}

/// Fatal node errors.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("no directory servers configured")]
    NoServers,

    #[error("trust anchor: {0}")]
    TrustKey(#[from] CryptoError),

    #[error("every directory server failed and no peers are connected")]
    DirectoryUnavailable,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("listen on port {port}: {source}")]
    Listen { port: u16, source: io::Error },

    #[error("node is already running")]
    AlreadyRunning,
}
