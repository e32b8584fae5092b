//! One line-framed TCP connection.
//!
//! Shared by peer links and directory sessions. Reads hand back one `Frame`
//! per LF-terminated line (a preceding CR is stripped). Writes join fields
//! with single spaces and append CRLF, serialised by an async mutex so lines
//! from concurrent writers never interleave.
//!
//! A connection closes exactly once. After `close()` every read and write
//! fails with `NotConnected`, and a read already waiting is woken.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use epsp_core::wire::Frame;

use crate::error::ConnError;

/// Longest line accepted from the wire, terminator excluded.
pub const MAX_LINE: usize = 64 * 1024;

/// A write that makes no progress for this long closes the connection.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Timestamps kept per connection.
#[derive(Debug, Clone, Default)]
pub struct Timing {
    pub connected: Option<Instant>,
    pub disconnected: Option<Instant>,
    pub ping_sent: Option<Instant>,
    pub pong_received: Option<Instant>,
    pub ping_received: Option<Instant>,
    pub last_data: Option<Instant>,
    pub rtt: Option<Duration>,
}

/// Frame and payload counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct Counters {
    pub sent: u64,
    pub received: u64,
    pub unique: u64,
    pub duplicate: u64,
}

pub struct Connection {
    address: String,
    reader: AsyncMutex<Option<BufReader<OwnedReadHalf>>>,
    writer: AsyncMutex<Option<OwnedWriteHalf>>,
    closed: CancellationToken,
    timing: Mutex<Timing>,
    sent: AtomicU64,
    received: AtomicU64,
    unique: AtomicU64,
    duplicate: AtomicU64,
}

impl Connection {
    /// Dial `addr`, giving up after `timeout` or when `cancel` fires.
    pub async fn connect(
        addr: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Self, ConnError> {
        let stream = tokio::select! {
            _ = cancel.cancelled() => return Err(ConnError::Cancelled),
            result = tokio::time::timeout(timeout, TcpStream::connect(addr)) => match result {
                Err(_) => return Err(ConnError::Timeout),
                Ok(Err(source)) => {
                    return Err(ConnError::ConnectFailed {
                        addr: addr.to_string(),
                        source,
                    })
                }
                Ok(Ok(stream)) => stream,
            },
        };
        let address = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| addr.to_string());
        Ok(Self::new(stream, address))
    }

    /// Wrap an already-established stream (an accepted socket).
    pub fn from_stream(stream: TcpStream) -> Self {
        let address = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        Self::new(stream, address)
    }

    fn new(stream: TcpStream, address: String) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            address,
            reader: AsyncMutex::new(Some(BufReader::new(read_half))),
            writer: AsyncMutex::new(Some(write_half)),
            closed: CancellationToken::new(),
            timing: Mutex::new(Timing {
                connected: Some(Instant::now()),
                ..Timing::default()
            }),
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
            unique: AtomicU64::new(0),
            duplicate: AtomicU64::new(0),
        }
    }

    /// Remote `ip:port`.
    pub fn address(&self) -> &str {
        &self.address
    }

    // ── Reading ───────────────────────────────────────────────────────────────

    /// Wait for the next line.
    pub async fn read(&self, cancel: &CancellationToken) -> Result<Frame, ConnError> {
        let mut guard = self.reader.lock().await;
        if self.is_closed() {
            guard.take();
            return Err(ConnError::NotConnected);
        }
        let Some(reader) = guard.as_mut() else {
            return Err(ConnError::NotConnected);
        };

        let mut buf = Vec::new();
        let mut limited = (&mut *reader).take(MAX_LINE as u64 + 2);
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(ConnError::Cancelled),
            _ = self.closed.cancelled() => Err(ConnError::NotConnected),
            result = limited.read_until(b'\n', &mut buf) => result.map_err(ConnError::ReadFailed),
        };

        let line = match result {
            Ok(0) => Err(ConnError::Disconnected),
            Ok(_) => strip_terminator(buf),
            Err(e) => Err(e),
        };

        match line {
            Ok(line) => {
                self.received.fetch_add(1, Ordering::Relaxed);
                self.timing().last_data = Some(Instant::now());
                match String::from_utf8(line) {
                    Ok(text) => Ok(Frame::parse(&text)),
                    Err(_) => Err(ConnError::Malformed),
                }
            }
            Err(e) => {
                self.close();
                guard.take();
                Err(e)
            }
        }
    }

    // ── Writing ───────────────────────────────────────────────────────────────

    /// Write one line made of `fields`.
    pub async fn write(&self, fields: &[&str]) -> Result<(), ConnError> {
        self.write_within(fields, WRITE_TIMEOUT).await
    }

    async fn write_within(&self, fields: &[&str], limit: Duration) -> Result<(), ConnError> {
        let mut line = fields.join(" ");
        line.push_str("\r\n");

        let mut guard = self.writer.lock().await;
        if self.is_closed() {
            guard.take();
            return Err(ConnError::NotConnected);
        }
        let Some(writer) = guard.as_mut() else {
            return Err(ConnError::NotConnected);
        };

        let result = tokio::select! {
            _ = self.closed.cancelled() => Err(ConnError::NotConnected),
            result = tokio::time::timeout(limit, writer.write_all(line.as_bytes())) => match result {
                Err(_) => Err(ConnError::Timeout),
                Ok(result) => result.map_err(ConnError::WriteFailed),
            },
        };

        match result {
            Ok(()) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.close();
                guard.take();
                Err(e)
            }
        }
    }

    pub async fn write_frame(&self, frame: &Frame) -> Result<(), ConnError> {
        self.write(&frame.fields()).await
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Close the connection. Safe to call any number of times.
    pub fn close(&self) {
        {
            let mut timing = self.timing();
            if timing.disconnected.is_some() {
                return;
            }
            timing.disconnected = Some(Instant::now());
        }
        self.closed.cancel();

        // Drop whichever halves are idle now; a busy half is dropped by its
        // holder once it observes the close.
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }
        if let Ok(mut reader) = self.reader.try_lock() {
            reader.take();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the connection is closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// How long ago the connection closed, if it has.
    pub fn closed_for(&self) -> Option<Duration> {
        self.timing().disconnected.map(|t| t.elapsed())
    }

    pub fn connected_for(&self) -> Duration {
        let timing = self.timing();
        match (timing.connected, timing.disconnected) {
            (Some(start), Some(end)) => end.saturating_duration_since(start),
            (Some(start), None) => start.elapsed(),
            _ => Duration::ZERO,
        }
    }

    // ── Keepalive bookkeeping ─────────────────────────────────────────────────

    pub fn mark_ping_sent(&self) {
        self.timing().ping_sent = Some(Instant::now());
    }

    pub fn mark_pong_received(&self) {
        let now = Instant::now();
        let mut timing = self.timing();
        timing.pong_received = Some(now);
        if let Some(sent) = timing.ping_sent {
            timing.rtt = Some(now.saturating_duration_since(sent));
        }
    }

    pub fn mark_ping_received(&self) {
        self.timing().ping_received = Some(Instant::now());
    }

    pub fn has_sent_ping(&self) -> bool {
        self.timing().ping_sent.is_some()
    }

    pub fn rtt(&self) -> Option<Duration> {
        self.timing().rtt
    }

    /// True if any line arrived within the last `period`.
    pub fn received_within(&self, period: Duration) -> bool {
        self.timing()
            .last_data
            .is_some_and(|t| t.elapsed() < period)
    }

    pub fn timing_snapshot(&self) -> Timing {
        self.timing().clone()
    }

    // ── Counters ──────────────────────────────────────────────────────────────

    pub fn mark_unique(&self) {
        self.unique.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_duplicate(&self) {
        self.duplicate.fetch_add(1, Ordering::Relaxed);
    }

    pub fn counters(&self) -> Counters {
        Counters {
            sent: self.sent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            unique: self.unique.load(Ordering::Relaxed),
            duplicate: self.duplicate.load(Ordering::Relaxed),
        }
    }

    /// Received payloads per useful payload: `(unique + duplicate) / unique`,
    /// or `u64::MAX` when nothing unique has arrived.
    pub fn redundancy(&self) -> u64 {
        let c = self.counters();
        if c.unique == 0 {
            return u64::MAX;
        }
        (c.unique + c.duplicate) / c.unique
    }

    fn timing(&self) -> MutexGuard<'_, Timing> {
        self.timing.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("address", &self.address)
            .field("closed", &self.is_closed())
            .field("counters", &self.counters())
            .finish()
    }
}

/// Remove the LF and a CR before it. A line without LF is the unterminated
/// tail of the stream, or a line that hit the length cap.
fn strip_terminator(mut buf: Vec<u8>) -> Result<Vec<u8>, ConnError> {
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    }
    if buf.len() > MAX_LINE {
        return Err(ConnError::LineTooLong(MAX_LINE));
    }
    Ok(buf)
}
