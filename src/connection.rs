//! Connected clients and the per-connection claim sets.
//!
//! A [`Connection`] owns both halves of a duplex byte stream. The read half sits
//! behind a buffered reader so the read engine can wait for input without
//! consuming it; the write half is locked per frame. Exclusive use of either half
//! is arbitrated by the engines' [`ClaimSet`]s, not by these locks.

use crate::error::ProtocolError;
use crate::frame::{read_frame, write_frame, Frame};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Opaque server-assigned session identifier, used for tracing only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// An open duplex connection to one client.
pub struct Connection {
    id: ConnectionId,
    peer: String,
    reader: tokio::sync::Mutex<BufReader<BoxedReader>>,
    writer: tokio::sync::Mutex<BoxedWriter>,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    /// Wrap separate read and write halves.
    pub fn from_parts<R, W>(reader: R, writer: W, peer: impl Into<String>) -> Arc<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Arc::new(Self {
            id: ConnectionId::new(),
            peer: peer.into(),
            reader: tokio::sync::Mutex::new(BufReader::new(Box::new(reader) as BoxedReader)),
            writer: tokio::sync::Mutex::new(Box::new(writer) as BoxedWriter),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        })
    }

    /// Wrap any duplex stream (in-memory pipes in tests, TLS streams, ...).
    pub fn new<S>(stream: S, peer: impl Into<String>) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::from_parts(reader, writer, peer)
    }

    /// Wrap an accepted TCP socket.
    pub fn from_tcp(stream: TcpStream) -> Arc<Self> {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let (reader, writer) = stream.into_split();
        Self::from_parts(reader, writer, peer)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Span that tags every event of this connection with its session id.
    pub fn span(&self) -> tracing::Span {
        tracing::info_span!("client", session = %self.id, peer = %self.peer)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Flag the connection as closed and wake everything waiting on it.
    ///
    /// Returns true only for the first caller, which then owns the teardown.
    pub fn mark_closed(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::SeqCst);
        self.shutdown.cancel();
        first
    }

    /// Resolves once [`Connection::mark_closed`] has been called.
    pub async fn closed(&self) {
        self.shutdown.cancelled().await
    }

    /// Wait until inbound bytes are buffered, without consuming them.
    ///
    /// Returns `Ok(false)` when the peer closed its side.
    pub async fn wait_readable(&self) -> io::Result<bool> {
        let mut reader = self.reader.lock().await;
        let buffered = reader.fill_buf().await?;
        Ok(!buffered.is_empty())
    }

    /// Decode the next frame.
    pub async fn read_frame(&self) -> Result<Frame, ProtocolError> {
        let mut reader = self.reader.lock().await;
        read_frame(&mut *reader).await
    }

    /// Encode and flush one frame.
    pub async fn send_frame(&self, frame: &Frame) -> Result<(), ProtocolError> {
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, frame).await
    }

    /// Write an already encoded frame (see [`Frame::to_bytes`]) and flush.
    pub async fn send_encoded(&self, bytes: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await?;
        writer.flush().await
    }

    /// Shut down the write half; the peer sees EOF.
    pub async fn shutdown(&self) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.shutdown().await
    }
}

/// Exclusivity markers: which connections currently have a read (or write) claimed.
///
/// Used purely for mutual exclusion; holding a claim confers no ownership.
#[derive(Debug, Default)]
pub struct ClaimSet {
    claimed: Mutex<HashSet<ConnectionId>>,
}

impl ClaimSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `id` if nobody holds it. Returns false when already claimed.
    pub fn try_claim(&self, id: ConnectionId) -> bool {
        self.claimed.lock().insert(id)
    }

    /// Claim every id in `targets` at once, but only if no connection other than
    /// `excluded` is claimed right now.
    pub fn try_claim_all_unless_busy(&self, excluded: ConnectionId, targets: &[ConnectionId]) -> bool {
        let mut claimed = self.claimed.lock();
        if claimed.iter().any(|id| *id != excluded) {
            return false;
        }
        claimed.extend(targets.iter().copied());
        true
    }

    /// Release `id`. Returns true if it was claimed.
    pub fn release(&self, id: ConnectionId) -> bool {
        self.claimed.lock().remove(&id)
    }

    pub fn release_all(&self, ids: &[ConnectionId]) {
        let mut claimed = self.claimed.lock();
        for id in ids {
            claimed.remove(id);
        }
    }

    pub fn is_claimed(&self, id: ConnectionId) -> bool {
        self.claimed.lock().contains(&id)
    }

    /// True if any connection other than `excluded` holds a claim.
    pub fn any_claimed_except(&self, excluded: ConnectionId) -> bool {
        self.claimed.lock().iter().any(|id| *id != excluded)
    }

    /// Currently claimed connections, in no particular order.
    pub fn snapshot(&self) -> Vec<ConnectionId> {
        self.claimed.lock().iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.claimed.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.claimed.lock().is_empty()
    }
}
