//! Session table for the relay side of the tunnel
//!
//! Maps session ids to the socket that talks to the real target. It is the
//! only place sessions are created, looked up or removed.
//!
//! Key properties:
//! - Structural changes (create/remove) take the write lock, lookups the read
//!   lock, so no reader ever sees a half-removed entry
//! - Each socket is split into a read half and a write half with their own
//!   locks: a Read waiting on an idle target never delays a Write
//! - Removing a session fires its close signal so in-flight readiness waits
//!   return immediately; the socket itself closes when the last request
//!   holding the session drops it
//! - Targets resolving to several addresses connect to the first IPv4 one,
//!   falling through addresses whose connect fails immediately
//! - Idle sessions are reaped after a configurable timeout; any Read or Write
//!   addressed to a session counts as activity

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::addr::Address;
use crate::error::TableError;
use crate::protocol::SessionId;

// ============================================================================
// Session
// ============================================================================

/// A relay session: one outbound socket owned on behalf of a client.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    target: Address,
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    closed: CancellationToken,
    created_at: Instant,
    /// Milliseconds after `created_at` of the last read or write
    last_activity_ms: AtomicU64,
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
}

impl Session {
    fn new(id: SessionId, target: Address, stream: TcpStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            id,
            target,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            closed: CancellationToken::new(),
            created_at: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
            bytes_up: AtomicU64::new(0),
            bytes_down: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn target(&self) -> &Address {
        &self.target
    }

    /// Fired when the session is removed from the table.
    pub fn closed(&self) -> &CancellationToken {
        &self.closed
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub(crate) fn reader(&self) -> &Mutex<OwnedReadHalf> {
        &self.reader
    }

    pub(crate) fn writer(&self) -> &Mutex<OwnedWriteHalf> {
        &self.writer
    }

    /// Update last activity timestamp
    pub fn touch(&self) {
        let now = self.created_at.elapsed().as_millis() as u64;
        self.last_activity_ms.store(now, Ordering::Relaxed);
    }

    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed));
        self.created_at.elapsed().saturating_sub(last)
    }

    /// Bytes written to the target.
    pub fn record_up(&self, n: usize) {
        self.bytes_up.fetch_add(n as u64, Ordering::Relaxed);
        self.touch();
    }

    /// Bytes read from the target.
    pub fn record_down(&self, n: usize) {
        self.bytes_down.fetch_add(n as u64, Ordering::Relaxed);
        self.touch();
    }

    pub fn bytes_up(&self) -> u64 {
        self.bytes_up.load(Ordering::Relaxed)
    }

    pub fn bytes_down(&self) -> u64 {
        self.bytes_down.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Table
// ============================================================================

/// Session table statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableStats {
    pub total_sessions: usize,
    pub bytes_up: u64,
    pub bytes_down: u64,
}

/// Authoritative mapping from session id to target socket.
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a socket to `target` and register it under `id`.
    ///
    /// The connect is started but not awaited: the entry is stored while the
    /// handshake is still in flight and connect failures surface on the first
    /// read or write. Only resolution and socket allocation fail here.
    pub async fn create(
        &self,
        id: SessionId,
        target: Address,
    ) -> Result<Arc<Session>, TableError> {
        if self.sessions.read().await.contains_key(&id) {
            return Err(TableError::DuplicateSession(id));
        }

        let candidates = target.resolve().await.map_err(|e| TableError::Resolve {
            target: target.to_string(),
            reason: format!("{:#}", e),
        })?;

        let (addr, stream) =
            connect_first(&prefer_ipv4(candidates)).map_err(|source| TableError::Socket {
                target: target.to_string(),
                source,
            })?;

        let session = Arc::new(Session::new(id.clone(), target, stream));

        match self.sessions.write().await.entry(id) {
            Entry::Occupied(entry) => Err(TableError::DuplicateSession(entry.key().clone())),
            Entry::Vacant(entry) => {
                info!("Created session {} -> {} ({})", session.id, session.target, addr);
                entry.insert(Arc::clone(&session));
                Ok(session)
            }
        }
    }

    pub async fn lookup(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Remove a session and signal its close. Returns false if it was absent.
    pub async fn remove(&self, id: &SessionId) -> bool {
        let removed = self.sessions.write().await.remove(id);
        match removed {
            Some(session) => {
                session.closed.cancel();
                info!(
                    "Closed session {} -> {}, {} bytes up, {} bytes down",
                    id,
                    session.target,
                    session.bytes_up(),
                    session.bytes_down()
                );
                true
            }
            None => {
                debug!("Close for unknown session {}", id);
                false
            }
        }
    }

    /// Remove every session idle for longer than `timeout`.
    pub async fn reap_idle(&self, timeout: Duration) -> Vec<SessionId> {
        let expired: Vec<SessionId> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| s.idle_for() > timeout)
            .map(|s| s.id.clone())
            .collect();

        for id in &expired {
            self.remove(id).await;
        }

        if !expired.is_empty() {
            info!("Reaped {} idle sessions", expired.len());
        }

        expired
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    pub async fn stats(&self) -> TableStats {
        let sessions = self.sessions.read().await;
        sessions.values().fold(
            TableStats {
                total_sessions: sessions.len(),
                ..TableStats::default()
            },
            |mut stats, s| {
                stats.bytes_up += s.bytes_up();
                stats.bytes_down += s.bytes_down();
                stats
            },
        )
    }
}

/// IPv4 results first, keeping resolver order within each family.
fn prefer_ipv4(mut addrs: Vec<SocketAddr>) -> Vec<SocketAddr> {
    addrs.sort_by_key(|addr| addr.is_ipv6());
    addrs
}

/// Start a connect to the first candidate that does not fail immediately.
fn connect_first(candidates: &[SocketAddr]) -> std::io::Result<(SocketAddr, TcpStream)> {
    let mut last_err = None;
    for &addr in candidates {
        match connect_nonblocking(addr) {
            Ok(stream) => return Ok((addr, stream)),
            Err(e) => {
                debug!("Connect to {} failed: {}", addr, e);
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses to connect to")
    }))
}

/// Start a non-blocking connect and hand the socket to tokio without waiting
/// for the handshake. Refusals that arrive later surface on the first I/O.
fn connect_nonblocking(addr: SocketAddr) -> std::io::Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    socket.set_nodelay(true)?;

    match socket.connect(&addr.into()) {
        Ok(()) => {}
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(e),
    }

    TcpStream::from_std(socket.into())
}
