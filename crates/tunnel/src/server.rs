//! HTTP front end of the relay
//!
//! Serves the session protocol over HTTP/1.1 and keeps one [`SessionTable`]
//! for all connections. Each request is handled independently; a failure in
//! one session never affects another.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Body;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::{debug, error, info, warn};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::TableError;
use crate::gate::SocketGate;
use crate::protocol::{self, OpenOutcome, SessionId, WriteOutcome, BUFFER_SIZE};
use crate::table::SessionTable;

/// Largest accepted request body: a fully percent-encoded buffer plus the field name.
const MAX_BODY_SIZE: usize = BUFFER_SIZE * 3 + 64;

/// The relay: session table, socket gate and HTTP service.
#[derive(Debug, Clone)]
pub struct RelayServer {
    gate: SocketGate,
    session_timeout: Option<Duration>,
    cleanup_interval: Duration,
}

impl RelayServer {
    pub fn new(config: &Config) -> Self {
        let table = Arc::new(SessionTable::new());
        let gate = SocketGate::new(table)
            .with_timeouts(config.timing.read_timeout(), config.timing.write_timeout());
        Self {
            gate,
            session_timeout: config.server.session_timeout(),
            cleanup_interval: config.server.cleanup_interval(),
        }
    }

    pub fn table(&self) -> &Arc<SessionTable> {
        self.gate.table()
    }

    /// Bind `addr` and serve until `shutdown` fires.
    pub async fn run(self, addr: &str, shutdown: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind relay on {}", addr))?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener until `shutdown` fires.
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        info!("Relay listening on http://{}", listener.local_addr()?);

        if let Some(timeout) = self.session_timeout {
            let table = Arc::clone(self.table());
            let interval = self.cleanup_interval;
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                reap_idle_sessions(table, timeout, interval, shutdown).await;
            });
        }

        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!("Accept error: {}", e);
                        continue;
                    }
                },
            };

            let io = TokioIo::new(stream);
            let server = self.clone();
            let shutdown = shutdown.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let server = server.clone();
                    async move { Ok::<_, Infallible>(server.handle(req).await) }
                });

                let conn = hyper::server::conn::http1::Builder::new().serve_connection(io, service);
                tokio::pin!(conn);

                let result = tokio::select! {
                    result = conn.as_mut() => result,
                    _ = shutdown.cancelled() => {
                        conn.as_mut().graceful_shutdown();
                        conn.await
                    }
                };
                if let Err(e) = result {
                    debug!("Connection error from {}: {}", peer, e);
                }
            });
        }

        info!("Relay stopped with {} open sessions", self.table().len().await);
        Ok(())
    }

    /// Dispatch one protocol request.
    pub async fn handle<B>(&self, req: Request<B>) -> Response<Full<Bytes>>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let id = match SessionId::from_path(req.uri().path()) {
            Ok(id) => id,
            Err(e) => {
                debug!("Rejecting {} {}: {}", req.method(), req.uri(), e);
                return respond(StatusCode::NOT_FOUND, Bytes::new());
            }
        };

        match *req.method() {
            Method::POST => match read_body(req.into_body()).await {
                Ok(body) => self.open(&id, &body).await,
                Err(status) => respond(status, Bytes::new()),
            },
            Method::GET => {
                let outcome = self.gate.read(&id).await;
                respond(outcome.status(), outcome.into_body())
            }
            Method::PUT => match read_body(req.into_body()).await {
                Ok(body) => self.write(&id, &body).await,
                Err(status) => respond(status, Bytes::new()),
            },
            Method::DELETE => {
                self.table().remove(&id).await;
                respond(StatusCode::OK, Bytes::new())
            }
            _ => respond(StatusCode::METHOD_NOT_ALLOWED, Bytes::new()),
        }
    }

    async fn open(&self, id: &SessionId, body: &[u8]) -> Response<Full<Bytes>> {
        let target = match protocol::decode_open(body) {
            Ok(target) => target,
            Err(e) => {
                warn!("Malformed open for session {}: {}", id, e);
                return respond(OpenOutcome::BadRequest.status(), Bytes::new());
            }
        };

        info!("Opening session {} to {}", id, target);
        let outcome = match self.table().create(id.clone(), target).await {
            Ok(_) => OpenOutcome::Created,
            Err(e @ TableError::DuplicateSession(_)) => {
                warn!("{}", e);
                OpenOutcome::Duplicate
            }
            Err(e) => {
                error!("Session {}: {}", id, e);
                OpenOutcome::ConnectFailed
            }
        };
        respond(outcome.status(), Bytes::new())
    }

    async fn write(&self, id: &SessionId, body: &[u8]) -> Response<Full<Bytes>> {
        let outcome = match protocol::decode_data(body) {
            Ok(data) => self.gate.write(id, &data).await,
            Err(e) => {
                warn!("Malformed write for session {}: {}", id, e);
                return respond(StatusCode::BAD_REQUEST, Bytes::new());
            }
        };
        if outcome != WriteOutcome::Written {
            debug!("Write to session {}: {:?}", id, outcome);
        }
        respond(outcome.status(), Bytes::new())
    }
}

async fn read_body<B>(body: B) -> Result<Bytes, StatusCode>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    match Limited::new(body, MAX_BODY_SIZE).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) => {
            warn!("Failed to read request body: {}", e);
            if e.is::<http_body_util::LengthLimitError>() {
                Err(StatusCode::PAYLOAD_TOO_LARGE)
            } else {
                Err(StatusCode::BAD_REQUEST)
            }
        }
    }
}

fn respond(status: StatusCode, body: Bytes) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    response
}

async fn reap_idle_sessions(
    table: Arc<SessionTable>,
    timeout: Duration,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                table.reap_idle(timeout).await;
                let stats = table.stats().await;
                debug!(
                    "{} sessions open, {} bytes up, {} bytes down",
                    stats.total_sessions, stats.bytes_up, stats.bytes_down
                );
            }
        }
    }
}
