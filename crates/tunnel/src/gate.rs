//! Readiness-gated socket I/O for relay sessions
//!
//! Turns a protocol Read or Write into a non-blocking operation on the
//! session's socket, bounded by a readiness timeout, and classifies what
//! happened. Nothing here returns an error: every socket outcome maps to a
//! [`ReadOutcome`] or [`WriteOutcome`].
//!
//! A `Timeout` write outcome means no byte of the payload reached the socket.
//! Once part of a payload is out, the write keeps waiting for the target to
//! drain and only a socket error or the session closing ends it early. A
//! write ended by the session closing reports `UnknownSession` and may have
//! been partly applied; the socket is gone at that point.
//!
//! Every lookup that finds the session counts as activity for idle reaping,
//! whether or not bytes move.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use log::{debug, warn};

use crate::protocol::{ReadOutcome, SessionId, WriteOutcome, BUFFER_SIZE, READ_TIMEOUT, WRITE_TIMEOUT};
use crate::table::{Session, SessionTable};

/// Performs bounded reads and writes against sessions in a [`SessionTable`].
#[derive(Debug, Clone)]
pub struct SocketGate {
    table: Arc<SessionTable>,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl SocketGate {
    pub fn new(table: Arc<SessionTable>) -> Self {
        Self {
            table,
            read_timeout: READ_TIMEOUT,
            write_timeout: WRITE_TIMEOUT,
        }
    }

    pub fn with_timeouts(mut self, read_timeout: Duration, write_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self.write_timeout = write_timeout;
        self
    }

    pub fn table(&self) -> &Arc<SessionTable> {
        &self.table
    }

    /// Wait up to the read timeout for data and return at most one buffer.
    pub async fn read(&self, id: &SessionId) -> ReadOutcome {
        let Some(session) = self.table.lookup(id).await else {
            debug!("Read for unknown session {}", id);
            return ReadOutcome::UnknownSession;
        };
        session.touch();

        tokio::select! {
            _ = session.closed().cancelled() => ReadOutcome::UnknownSession,
            result = tokio::time::timeout(self.read_timeout, read_ready(&session)) => {
                result.unwrap_or(ReadOutcome::NoData)
            }
        }
    }

    /// Send the whole payload, waiting up to the write timeout for each stall.
    pub async fn write(&self, id: &SessionId, payload: &[u8]) -> WriteOutcome {
        let Some(session) = self.table.lookup(id).await else {
            debug!("Write for unknown session {}", id);
            return WriteOutcome::UnknownSession;
        };
        session.touch();
        if payload.len() > BUFFER_SIZE {
            warn!(
                "Write of {} bytes to session {} exceeds {} byte limit",
                payload.len(),
                id,
                BUFFER_SIZE
            );
            return WriteOutcome::TooLarge;
        }

        tokio::select! {
            _ = session.closed().cancelled() => WriteOutcome::UnknownSession,
            outcome = write_all(&session, payload, self.write_timeout) => outcome,
        }
    }
}

async fn read_ready(session: &Session) -> ReadOutcome {
    let reader = session.reader().lock().await;
    let mut buf = BytesMut::zeroed(BUFFER_SIZE);

    loop {
        if let Err(e) = reader.readable().await {
            warn!("Session {} readiness error: {}", session.id(), e);
            return ReadOutcome::IoError;
        }

        match reader.try_read(&mut buf) {
            Ok(0) => {
                debug!("Target of session {} closed the connection", session.id());
                return ReadOutcome::Eof;
            }
            Ok(n) => {
                buf.truncate(n);
                session.record_down(n);
                return ReadOutcome::Data(buf.freeze());
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => {
                warn!("Error reading from target of session {}: {}", session.id(), e);
                return ReadOutcome::IoError;
            }
        }
    }
}

async fn write_all(session: &Session, payload: &[u8], stall_timeout: Duration) -> WriteOutcome {
    let writer = match tokio::time::timeout(stall_timeout, session.writer().lock()).await {
        Ok(writer) => writer,
        Err(_) => return WriteOutcome::Timeout,
    };

    let mut sent = 0;
    while sent < payload.len() {
        let ready = if sent == 0 {
            match tokio::time::timeout(stall_timeout, writer.writable()).await {
                Ok(ready) => ready,
                Err(_) => {
                    debug!("Target of session {} not writable", session.id());
                    return WriteOutcome::Timeout;
                }
            }
        } else {
            // Part of the payload is out, so the wait is unbounded after a warning.
            match tokio::time::timeout(stall_timeout, writer.writable()).await {
                Ok(ready) => ready,
                Err(_) => {
                    warn!(
                        "Target of session {} stalled after {} of {} bytes, still waiting",
                        session.id(),
                        sent,
                        payload.len()
                    );
                    writer.writable().await
                }
            }
        };
        if let Err(e) = ready {
            warn!("Session {} readiness error: {}", session.id(), e);
            return WriteOutcome::IoError;
        }

        match writer.try_write(&payload[sent..]) {
            Ok(0) => {
                warn!("Target of session {} accepted no bytes", session.id());
                return WriteOutcome::IoError;
            }
            Ok(n) => {
                sent += n;
                session.record_up(n);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => {
                warn!("Error sending to target of session {}: {}", session.id(), e);
                return WriteOutcome::IoError;
            }
        }
    }

    session.touch();
    WriteOutcome::Written
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::Address;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    const SHORT: Duration = Duration::from_millis(200);

    async fn setup() -> (SocketGate, SessionId, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let table = Arc::new(SessionTable::new());
        let id = SessionId::generate();
        table
            .create(id.clone(), Address::new("127.0.0.1", port))
            .await
            .unwrap();
        let (peer, _) = listener.accept().await.unwrap();
        let gate = SocketGate::new(table).with_timeouts(SHORT, SHORT);
        (gate, id, peer)
    }

    /// Poll until `len` bytes arrived, skipping empty polls.
    async fn read_exactly(gate: &SocketGate, id: &SessionId, len: usize) -> Vec<u8> {
        let mut out = Vec::new();
        while out.len() < len {
            match gate.read(id).await {
                ReadOutcome::Data(data) => out.extend_from_slice(&data),
                ReadOutcome::NoData => {}
                other => panic!("unexpected read outcome {:?}", other),
            }
        }
        out
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let gate = SocketGate::new(Arc::new(SessionTable::new()));
        let id = SessionId::generate();
        assert_eq!(gate.read(&id).await, ReadOutcome::UnknownSession);
        assert_eq!(gate.write(&id, b"x").await, WriteOutcome::UnknownSession);
    }

    #[tokio::test]
    async fn test_read_and_write_after_close_are_unknown() {
        let (gate, id, _peer) = setup().await;
        assert!(gate.table().remove(&id).await);
        assert_eq!(gate.read(&id).await, ReadOutcome::UnknownSession);
        assert_eq!(gate.write(&id, b"x").await, WriteOutcome::UnknownSession);
    }

    #[tokio::test]
    async fn test_read_returns_target_data() {
        let (gate, id, mut peer) = setup().await;
        peer.write_all(b"hello").await.unwrap();
        assert_eq!(read_exactly(&gate, &id, 5).await, b"hello");
    }

    #[tokio::test]
    async fn test_read_without_data_times_out() {
        let (gate, id, _peer) = setup().await;
        let started = std::time::Instant::now();
        assert_eq!(gate.read(&id).await, ReadOutcome::NoData);
        assert!(started.elapsed() >= SHORT);
    }

    #[tokio::test]
    async fn test_read_after_target_close_is_eof() {
        let (gate, id, peer) = setup().await;
        drop(peer);
        let outcome = loop {
            match gate.read(&id).await {
                ReadOutcome::NoData => continue,
                other => break other,
            }
        };
        assert_eq!(outcome, ReadOutcome::Eof);
        assert_eq!(ReadOutcome::Eof.status(), hyper::StatusCode::OK);
    }

    #[tokio::test]
    async fn test_remove_interrupts_pending_read() {
        let (gate, id, _peer) = setup().await;
        let gate = gate.with_timeouts(Duration::from_secs(30), SHORT);

        let reader = {
            let gate = gate.clone();
            let id = id.clone();
            tokio::spawn(async move { gate.read(&id).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        gate.table().remove(&id).await;

        let outcome = tokio::time::timeout(Duration::from_secs(2), reader)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, ReadOutcome::UnknownSession);
    }

    #[tokio::test]
    async fn test_chunked_writes_arrive_in_order() {
        let (gate, id, mut peer) = setup().await;
        let payload: Vec<u8> = (0..3 * BUFFER_SIZE + 123).map(|i| (i % 251) as u8).collect();

        let receiver = tokio::spawn(async move {
            let mut received = Vec::new();
            peer.read_to_end(&mut received).await.unwrap();
            received
        });

        for chunk in payload.chunks(BUFFER_SIZE) {
            assert_eq!(gate.write(&id, chunk).await, WriteOutcome::Written);
        }
        gate.table().remove(&id).await;

        assert_eq!(receiver.await.unwrap(), payload);
    }

    #[tokio::test]
    async fn test_oversized_write_rejected() {
        let (gate, id, _peer) = setup().await;
        let payload = vec![0u8; BUFFER_SIZE + 1];
        assert_eq!(gate.write(&id, &payload).await, WriteOutcome::TooLarge);
        let session = gate.table().lookup(&id).await.unwrap();
        assert_eq!(session.bytes_up(), 0);
    }

    #[tokio::test]
    async fn test_write_timeout_applies_nothing() {
        // The peer never reads, so the socket buffers eventually fill up.
        let (gate, id, _peer) = setup().await;
        let session = gate.table().lookup(&id).await.unwrap();
        let chunk = vec![7u8; BUFFER_SIZE];

        for _ in 0..4000 {
            match tokio::time::timeout(Duration::from_secs(1), gate.write(&id, &chunk)).await {
                Ok(WriteOutcome::Written) => {}
                Ok(WriteOutcome::Timeout) => break,
                Ok(other) => panic!("unexpected write outcome {:?}", other),
                // Partly sent and waiting for the peer: the socket is full.
                Err(_) => break,
            }
        }

        let before = session.bytes_up();
        assert_eq!(gate.write(&id, &chunk).await, WriteOutcome::Timeout);
        assert_eq!(session.bytes_up(), before);
    }

    #[tokio::test]
    async fn test_stalled_target_receives_exactly_acknowledged_writes() {
        let (gate, id, mut peer) = setup().await;

        let writer = {
            let gate = gate.clone();
            let id = id.clone();
            tokio::spawn(async move {
                let mut acked = Vec::new();
                for i in 0..400usize {
                    let chunk = vec![(i % 251) as u8; BUFFER_SIZE];
                    match gate.write(&id, &chunk).await {
                        WriteOutcome::Written => acked.extend_from_slice(&chunk),
                        WriteOutcome::Timeout => {}
                        other => panic!("unexpected write outcome {:?}", other),
                    }
                }
                gate.table().remove(&id).await;
                acked
            })
        };

        // Stay away for several write timeouts before draining.
        tokio::time::sleep(SHORT * 5).await;
        let mut received = Vec::new();
        tokio::time::timeout(Duration::from_secs(30), peer.read_to_end(&mut received))
            .await
            .unwrap()
            .unwrap();

        let acked = writer.await.unwrap();
        assert_eq!(received.len(), acked.len());
        assert!(received == acked);
    }

    #[tokio::test]
    async fn test_polled_session_is_not_reaped() {
        let (gate, id, _peer) = setup().await;

        for _ in 0..4 {
            assert_eq!(gate.read(&id).await, ReadOutcome::NoData);
        }

        let reaped = gate.table().reap_idle(Duration::from_millis(500)).await;
        assert!(reaped.is_empty());
        assert_eq!(gate.read(&id).await, ReadOutcome::NoData);
    }
}
