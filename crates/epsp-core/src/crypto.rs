//! Signature verification for relayed EPSP data.
//!
//! Two signature schemes gate every `5xx` frame:
//!
//!   A. Server-signed: the directory server signs the data directly.
//!      Verified against the server trust anchor.
//!   B. Peer-signed: the directory server certifies a peer's public key,
//!      and the peer signs the data with the matching secret key.
//!      The certificate is verified against the peer trust anchor, then the
//!      data against the certified key.
//!
//! Both schemes sign the same digest:
//!
//!   data digest        = SHA1(expiry || MD5(body))
//!   certificate digest = SHA1(DER(public key) || key expiry)
//!
//! with RSA PKCS#1 v1.5. Signatures and keys travel base64-encoded.
//! SHA1 and MD5 are fixed by the protocol; nothing here chooses them.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use md5::Md5;
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey};
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha1::{Digest, Sha1};
use thiserror::Error;

use crate::wire::parse_protocol_time;

const PEM_HEADER: &str = "-----BEGIN PUBLIC KEY-----";
const PEM_FOOTER: &str = "-----END PUBLIC KEY-----";

// ── Trust anchors ─────────────────────────────────────────────────────────────

/// The two long-lived public keys every node trusts.
#[derive(Debug, Clone)]
pub struct TrustAnchors {
    /// Verifies data signed by the directory server (scheme A).
    pub server: RsaPublicKey,
    /// Verifies peer key certificates (scheme B).
    pub peer: RsaPublicKey,
}

impl TrustAnchors {
    pub fn from_pem(server_pem: &str, peer_pem: &str) -> Result<Self, CryptoError> {
        Ok(Self {
            server: decode_public_key_pem(server_pem)?,
            peer: decode_public_key_pem(peer_pem)?,
        })
    }
}

/// Decode a PEM `PUBLIC KEY` block holding an RSA key.
///
/// Body lines may be any width; the anchors published for the swarm are
/// wrapped at 70 columns.
pub fn decode_public_key_pem(pem: &str) -> Result<RsaPublicKey, CryptoError> {
    let mut lines = pem.lines().map(str::trim).filter(|l| !l.is_empty());
    match lines.next() {
        Some(PEM_HEADER) => {}
        Some(other) => return Err(CryptoError::BadKey(format!("unexpected PEM header {other:?}"))),
        None => return Err(CryptoError::BadKey("empty PEM".into())),
    }

    let mut body = String::new();
    let mut terminated = false;
    for line in lines {
        if line == PEM_FOOTER {
            terminated = true;
            break;
        }
        body.push_str(line);
    }
    if !terminated {
        return Err(CryptoError::BadKey("PEM footer missing".into()));
    }

    let der = STANDARD
        .decode(body)
        .map_err(|e| CryptoError::BadKey(e.to_string()))?;
    RsaPublicKey::from_public_key_der(&der).map_err(|e| CryptoError::BadKey(e.to_string()))
}

// ── Schemes ───────────────────────────────────────────────────────────────────

/// Which signature scheme a `5xx` command uses, by its third digit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// `5x1`, `5x2`: signed by the directory server.
    Server,
    /// `5x5`, `5x6`: signed by a peer holding a certified key.
    Peer,
}

impl Scheme {
    pub fn for_code(code: &str) -> Option<Self> {
        match code.as_bytes() {
            [b'5', _, b'1' | b'2'] => Some(Self::Server),
            [b'5', _, b'5' | b'6'] => Some(Self::Peer),
            _ => None,
        }
    }
}

// ── Verification ──────────────────────────────────────────────────────────────

/// Verify a peer key certificate and return the certified key.
///
/// Fails if the certificate signature does not verify under `anchor`, if the
/// key expiry is unparsable or already past `now`, or if the certified bytes
/// are not an RSA public key.
pub fn verify_key_certificate(
    anchor: &RsaPublicKey,
    public_key_b64: &str,
    key_signature_b64: &str,
    key_expiry: &str,
    now: DateTime<Utc>,
) -> Result<RsaPublicKey, CryptoError> {
    let signature = decode_b64(key_signature_b64)?;
    let der = decode_b64(public_key_b64)?;

    let digest = certificate_digest(&der, key_expiry);
    anchor
        .verify(Pkcs1v15Sign::new::<Sha1>(), &digest, &signature)
        .map_err(|_| CryptoError::SignatureMismatch)?;

    let expires = parse_protocol_time(key_expiry)
        .map_err(|_| CryptoError::BadExpiry(key_expiry.to_string()))?;
    if now > expires {
        return Err(CryptoError::CertificateExpired(key_expiry.to_string()));
    }

    RsaPublicKey::from_public_key_der(&der).map_err(|e| CryptoError::BadKey(e.to_string()))
}

/// Verify a data signature under `key`.
pub fn verify_data_signature(
    key: &RsaPublicKey,
    data_signature_b64: &str,
    expiry: &str,
    body: &str,
) -> Result<(), CryptoError> {
    let signature = decode_b64(data_signature_b64)?;
    let digest = data_digest(expiry, body);
    key.verify(Pkcs1v15Sign::new::<Sha1>(), &digest, &signature)
        .map_err(|_| CryptoError::SignatureMismatch)
}

// ── Signing ───────────────────────────────────────────────────────────────────

/// Sign data for relay. Returns the base64 signature.
pub fn sign_data(key: &RsaPrivateKey, expiry: &str, body: &str) -> Result<String, CryptoError> {
    let digest = data_digest(expiry, body);
    let signature = key
        .sign(Pkcs1v15Sign::new::<Sha1>(), &digest)
        .map_err(|e| CryptoError::Signing(e.to_string()))?;
    Ok(STANDARD.encode(signature))
}

/// Issue a key certificate. Returns `(public key, certificate signature)`,
/// both base64, in the form peers embed in scheme B payloads.
pub fn certify_key(
    anchor: &RsaPrivateKey,
    public: &RsaPublicKey,
    key_expiry: &str,
) -> Result<(String, String), CryptoError> {
    let der = public
        .to_public_key_der()
        .map_err(|e| CryptoError::BadKey(e.to_string()))?;
    let digest = certificate_digest(der.as_bytes(), key_expiry);
    let signature = anchor
        .sign(Pkcs1v15Sign::new::<Sha1>(), &digest)
        .map_err(|e| CryptoError::Signing(e.to_string()))?;
    Ok((STANDARD.encode(der.as_bytes()), STANDARD.encode(signature)))
}

// ── Digests ───────────────────────────────────────────────────────────────────

fn data_digest(expiry: &str, body: &str) -> Vec<u8> {
    let body_hash = Md5::digest(body.as_bytes());
    let mut hasher = Sha1::new();
    hasher.update(expiry.as_bytes());
    hasher.update(body_hash);
    hasher.finalize().to_vec()
}

fn certificate_digest(public_key_der: &[u8], key_expiry: &str) -> Vec<u8> {
    let mut hasher = Sha1::new();
    hasher.update(public_key_der);
    hasher.update(key_expiry.as_bytes());
    hasher.finalize().to_vec()
}

fn decode_b64(s: &str) -> Result<Vec<u8>, CryptoError> {
    STANDARD
        .decode(s)
        .map_err(|e| CryptoError::BadEncoding(e.to_string()))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("bad public key: {0}")]
    BadKey(String),

    #[error("bad base64: {0}")]
    BadEncoding(String),

    #[error("signature does not verify")]
    SignatureMismatch,

    #[error("bad key expiry: {0:?}")]
    BadExpiry(String),

    #[error("key certificate expired at {0}")]
    CertificateExpired(String),

    #[error("signing failed: {0}")]
    Signing(String),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
