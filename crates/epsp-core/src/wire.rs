//! EPSP wire format: frames, command codes, and the small value types
//! carried inside payloads.
//!
//! Every message on every EPSP link is one ASCII line:
//!
//!   <code> <hop> <payload>\r\n
//!
//! `code` is always three digits. `hop` is a decimal hop count on relayed
//! frames and a constant `1` everywhere else. `payload` is the remainder of
//! the line; the framing layer never splits it further. Protocol fields
//! inside a payload are separated by `:`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

// ── Command codes ─────────────────────────────────────────────────────────────

/// Command codes, grouped by the link they travel on.
pub mod code {
    // Peer ↔ peer, never relayed.
    pub const PEER_PING: &str = "611";
    pub const PEER_PONG: &str = "631";
    pub const PEER_ID_REQUEST: &str = "612";
    pub const PEER_ID_REPLY: &str = "632";
    pub const VERSION_ANNOUNCE: &str = "614";
    pub const VERSION_REPLY: &str = "634";
    pub const VERSION_INCOMPATIBLE: &str = "694";

    // Peer list. Served by the directory server and by every peer.
    pub const PEER_LIST_REQUEST: &str = "115";
    pub const PEER_LIST_REPLY: &str = "235";

    // Client → directory server.
    pub const TEMP_ID_REQUEST: &str = "113";
    pub const TEMP_ID_REPLY: &str = "233";
    pub const PORT_CHECK_REQUEST: &str = "114";
    pub const PORT_CHECK_REPLY: &str = "234";
    pub const REGISTER_REQUEST: &str = "116";
    pub const REGISTER_REPLY: &str = "236";
    pub const KEY_REQUEST: &str = "117";
    pub const KEY_RENEW_REQUEST: &str = "124";
    pub const KEY_REPLY: &str = "237";
    pub const KEY_RENEW_REPLY: &str = "244";
    pub const KEY_ALREADY_ASSIGNED: &str = "295";
    pub const TIME_REQUEST: &str = "118";
    pub const TIME_REPLY: &str = "238";
    pub const CLOSE_REQUEST: &str = "119";
    pub const CLOSE_REPLY: &str = "239";
    pub const ECHO_REQUEST: &str = "123";
    pub const ECHO_REPLY: &str = "243";
    pub const ADDRESS_CHANGED: &str = "299";
    pub const REGION_COUNT_REQUEST: &str = "127";
    pub const REGION_COUNT_REPLY: &str = "247";
    pub const CLIENT_VERSION: &str = "131";
    pub const SERVER_VERSION_REQUEST: &str = "211";
    pub const SERVER_VERSION: &str = "212";
    pub const CONNECTED_PEERS_REPORT: &str = "155";

    // Relayed through the swarm.
    pub const REGION_COUNT_UPDATE: &str = "561";
    pub const TRACE_PROBE: &str = "615";
    pub const TRACE_REPLY: &str = "635";
}

/// Length of every valid command code.
pub const CODE_LEN: usize = 3;

/// Flag value used in the hop field of frames that are never relayed.
pub const NO_HOP: u64 = 1;

// ── Frame ─────────────────────────────────────────────────────────────────────

/// One protocol line split into its three fields.
///
/// Missing trailing fields are `None`, so a parsed line re-encodes to exactly
/// the text it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub code: String,
    pub hop: Option<String>,
    pub payload: Option<String>,
}

impl Frame {
    /// A frame with a code and hop field and no payload.
    pub fn new(code: impl Into<String>, hop: u64) -> Self {
        Self {
            code: code.into(),
            hop: Some(hop.to_string()),
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    /// Split a line (without its terminator) into at most three fields.
    pub fn parse(line: &str) -> Self {
        let mut parts = line.splitn(3, ' ');
        Self {
            code: parts.next().unwrap_or_default().to_string(),
            hop: parts.next().map(str::to_string),
            payload: parts.next().map(str::to_string),
        }
    }

    /// The fields in wire order, for writing.
    pub fn fields(&self) -> Vec<&str> {
        let mut fields = vec![self.code.as_str()];
        if let Some(hop) = &self.hop {
            fields.push(hop);
            if let Some(payload) = &self.payload {
                fields.push(payload);
            }
        }
        fields
    }

    /// The line as written on the wire, without CRLF.
    pub fn to_line(&self) -> String {
        self.fields().join(" ")
    }

    /// A three-character code is the only structural requirement.
    pub fn is_well_formed(&self) -> bool {
        self.code.len() == CODE_LEN
    }

    /// Signed application data (`5xx`).
    pub fn is_signed_data(&self) -> bool {
        self.code.starts_with('5')
    }

    /// Frames the node relays through the swarm: signed data and trace-echo.
    pub fn is_relayed(&self) -> bool {
        self.is_signed_data() || self.code == code::TRACE_PROBE || self.code == code::TRACE_REPLY
    }

    /// Parse the hop field.
    pub fn hop_count(&self) -> Result<u64, WireError> {
        let raw = self.hop.as_deref().unwrap_or_default();
        raw.parse()
            .map_err(|_| WireError::BadHop(raw.to_string()))
    }

    /// The same frame with a different hop count.
    pub fn with_hop(&self, hop: u64) -> Self {
        Self {
            hop: Some(hop.to_string()),
            ..self.clone()
        }
    }

    /// Colon-separated payload fields. An absent payload yields one empty field.
    pub fn payload_fields(&self) -> Vec<&str> {
        self.payload.as_deref().unwrap_or_default().split(':').collect()
    }

    /// The raw payload, or the empty string.
    pub fn payload_str(&self) -> &str {
        self.payload.as_deref().unwrap_or_default()
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_line())
    }
}

// ── Agent ─────────────────────────────────────────────────────────────────────

/// Version tokens advertised in `614`/`634`/`131`/`212` frames.
///
/// The first token is the protocol version. The rest identify the software.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agent(Vec<String>);

impl Agent {
    pub fn protocol_version(&self) -> &str {
        self.0.first().map(String::as_str).unwrap_or_default()
    }

    /// Fall back to `other`'s protocol version if it sorts lower than ours.
    ///
    /// Returns true if our agent changed.
    pub fn adopt_lower_version(&mut self, other: &Agent) -> bool {
        let theirs = other.protocol_version();
        if theirs.is_empty() || self.protocol_version() <= theirs {
            return false;
        }
        match self.0.first_mut() {
            Some(first) => *first = theirs.to_string(),
            None => self.0.push(theirs.to_string()),
        }
        true
    }
}

impl Default for Agent {
    fn default() -> Self {
        Self(vec![
            "0.34r".to_string(),
            "epsp-rs".to_string(),
            env!("CARGO_PKG_VERSION").to_string(),
        ])
    }
}

impl FromStr for Agent {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.split(':').map(str::to_string).collect()))
    }
}

impl fmt::Display for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(":"))
    }
}

// ── Candidate peers ───────────────────────────────────────────────────────────

/// A dialable peer as listed by the directory server: `host,port,peer-id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Candidate {
    pub host: String,
    pub port: u16,
    pub peer_id: String,
}

impl Candidate {
    /// `host:port`, bracketing IPv6 literals.
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Parse a `235` payload. Entries that do not parse are skipped.
    pub fn parse_list(list: &str) -> Vec<Candidate> {
        list.split(':')
            .filter(|entry| !entry.is_empty())
            .filter_map(|entry| entry.parse().ok())
            .collect()
    }
}

impl FromStr for Candidate {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(',').collect();
        let [host, port, peer_id] = parts.as_slice() else {
            return Err(WireError::BadCandidate(s.to_string()));
        };
        let port = port
            .parse()
            .map_err(|_| WireError::BadCandidate(s.to_string()))?;
        if host.is_empty() || peer_id.is_empty() {
            return Err(WireError::BadCandidate(s.to_string()));
        }
        Ok(Self {
            host: host.to_string(),
            port,
            peer_id: peer_id.to_string(),
        })
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{}", self.host, self.port, self.peer_id)
    }
}

/// Render a connected peer as a `host,port,peer-id` triple from its socket
/// address string. The split is on the last `:`, so IPv6 addresses survive.
pub fn address_triple(address: &str, peer_id: &str) -> String {
    match address.rsplit_once(':') {
        Some((host, port)) => {
            let host = host.trim_start_matches('[').trim_end_matches(']');
            format!("{host},{port},{peer_id}")
        }
        None => format!("{address},,{peer_id}"),
    }
}

// ── Timestamps ────────────────────────────────────────────────────────────────

/// Timestamp layout used in every payload: `2024/01/31 23-59-59`.
pub const TIME_FORMAT: &str = "%Y/%m/%d %H-%M-%S";

/// The directory server's fixed zone (+09:00).
pub fn protocol_zone() -> FixedOffset {
    FixedOffset::east_opt(9 * 60 * 60).unwrap()
}

/// Parse a timestamp in the directory server's zone.
/// Used for key expiry and protocol time.
pub fn parse_protocol_time(s: &str) -> Result<DateTime<FixedOffset>, WireError> {
    let naive = NaiveDateTime::parse_from_str(s, TIME_FORMAT)
        .map_err(|_| WireError::BadTimestamp(s.to_string()))?;
    protocol_zone()
        .from_local_datetime(&naive)
        .single()
        .ok_or_else(|| WireError::BadTimestamp(s.to_string()))
}

/// Parse a timestamp with no zone information as UTC.
/// Used for the expiry embedded in relayed data.
pub fn parse_utc_time(s: &str) -> Result<DateTime<Utc>, WireError> {
    NaiveDateTime::parse_from_str(s, TIME_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|_| WireError::BadTimestamp(s.to_string()))
}

/// Format a timestamp in the payload layout, in whatever zone it carries.
pub fn format_time<Tz: TimeZone>(t: &DateTime<Tz>) -> String
where
    Tz::Offset: fmt::Display,
{
    t.format(TIME_FORMAT).to_string()
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("hop field is not a number: {0:?}")]
    BadHop(String),

    #[error("bad timestamp: {0:?}")]
    BadTimestamp(String),

    #[error("bad candidate peer: {0:?}")]
    BadCandidate(String),
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    #[test]
    fn parse_keeps_spaces_in_payload() {
        let frame = Frame::parse("551 3 sig:2024/01/01 00-00-00:body with spaces");
        assert_eq!(frame.code, "551");
        assert_eq!(frame.hop.as_deref(), Some("3"));
        assert_eq!(
            frame.payload.as_deref(),
            Some("sig:2024/01/01 00-00-00:body with spaces")
        );
        assert_eq!(frame.hop_count().unwrap(), 3);
    }

    #[test]
    fn parse_short_lines() {
        let frame = Frame::parse("611 1");
        assert_eq!(frame.code, "611");
        assert_eq!(frame.hop.as_deref(), Some("1"));
        assert!(frame.payload.is_none());

        let frame = Frame::parse("119");
        assert_eq!(frame.code, "119");
        assert!(frame.hop.is_none());
        assert_eq!(frame.to_line(), "119");
    }

    #[test]
    fn to_line_reproduces_parsed_text() {
        for line in ["614 1 0.34r:a:b", "611 1", "635 4 a:b:c d e", "2"] {
            assert_eq!(Frame::parse(line).to_line(), line);
        }
    }

    #[test]
    fn malformed_codes_are_detected() {
        assert!(Frame::parse("611 1").is_well_formed());
        assert!(!Frame::parse("61 1").is_well_formed());
        assert!(!Frame::parse("").is_well_formed());
    }

    #[test]
    fn classification() {
        assert!(Frame::parse("551 1 x").is_relayed());
        assert!(Frame::parse("615 1 x").is_relayed());
        assert!(Frame::parse("635 1 x").is_relayed());
        assert!(!Frame::parse("611 1").is_relayed());
        assert!(Frame::parse("561 1").is_signed_data());
    }

    #[test]
    fn bad_hop_is_an_error() {
        let err = Frame::parse("551 x payload").hop_count().unwrap_err();
        assert_eq!(err, WireError::BadHop("x".into()));
        assert!(Frame::parse("551").hop_count().is_err());
    }

    #[test]
    fn with_hop_replaces_only_the_hop() {
        let frame = Frame::parse("551 2 a:b");
        let next = frame.with_hop(3);
        assert_eq!(next.to_line(), "551 3 a:b");
    }

    #[test]
    fn candidate_parse_and_display() {
        let c: Candidate = "192.0.2.1,6911,42".parse().unwrap();
        assert_eq!(c.host, "192.0.2.1");
        assert_eq!(c.port, 6911);
        assert_eq!(c.peer_id, "42");
        assert_eq!(c.address(), "192.0.2.1:6911");
        assert_eq!(c.to_string(), "192.0.2.1,6911,42");

        assert!("192.0.2.1,6911".parse::<Candidate>().is_err());
        assert!("192.0.2.1,port,42".parse::<Candidate>().is_err());
        assert!("192.0.2.1,6911,".parse::<Candidate>().is_err());
    }

    #[test]
    fn candidate_list_skips_garbage() {
        let list = Candidate::parse_list("10.0.0.1,6911,1:junk:10.0.0.2,6912,2:");
        assert_eq!(list.len(), 2);
        assert_eq!(list[1].peer_id, "2");
    }

    #[test]
    fn ipv6_candidate_address_is_bracketed() {
        let c = Candidate {
            host: "2001:db8::1".into(),
            port: 6911,
            peer_id: "7".into(),
        };
        assert_eq!(c.address(), "[2001:db8::1]:6911");
    }

    #[test]
    fn address_triple_splits_on_last_colon() {
        assert_eq!(address_triple("10.0.0.1:6911", "5"), "10.0.0.1,6911,5");
        assert_eq!(address_triple("[2001:db8::1]:6911", "5"), "2001:db8::1,6911,5");
    }

    #[test]
    fn agent_version_fallback() {
        let mut ours: Agent = "0.35:me:1".parse().unwrap();
        let server: Agent = "0.34:server".parse().unwrap();
        assert!(ours.adopt_lower_version(&server));
        assert_eq!(ours.to_string(), "0.34:me:1");

        let newer: Agent = "0.40:server".parse().unwrap();
        assert!(!ours.adopt_lower_version(&newer));
        assert_eq!(ours.protocol_version(), "0.34");
    }

    #[test]
    fn protocol_time_is_fixed_zone() {
        let t = parse_protocol_time("2024/03/01 12-30-45").unwrap();
        assert_eq!(t.offset().local_minus_utc(), 9 * 3600);
        assert_eq!((t.year(), t.month(), t.day()), (2024, 3, 1));
        assert_eq!((t.hour(), t.minute(), t.second()), (12, 30, 45));
        assert_eq!(format_time(&t), "2024/03/01 12-30-45");
    }

    #[test]
    fn utc_time_parse() {
        let t = parse_utc_time("2024/03/01 12-30-45").unwrap();
        assert_eq!(t.hour(), 12);
        assert!(parse_utc_time("2024-03-01 12:30:45").is_err());
    }
}
