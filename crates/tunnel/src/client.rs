//! Client side of the tunnel
//!
//! Accepts local TCP connections and carries each one to the relay as a
//! session. Every accepted connection gets:
//! - a control handle that opens and finally closes the session
//! - an uplink worker pumping local bytes into Write requests
//! - a downlink worker polling Read requests and writing the result locally
//!
//! The three handles use separate HTTP clients so a long-polling Read never
//! queues behind a Write. Workers stop cooperatively on a per-connection
//! cancellation token, a child of the client-wide shutdown token.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::addr::Address;
use crate::config::Config;
use crate::protocol::{
    self, OpenOutcome, ReadOutcome, SessionId, WriteOutcome, BUFFER_SIZE, FORM_CONTENT_TYPE,
};

// ============================================================================
// Settings
// ============================================================================

/// Everything a client needs to carry connections to one target.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub relay: Address,
    pub target: Address,
    pub proxy: Option<Address>,
    pub request_timeout: Duration,
    pub poll_interval: Duration,
    /// Close a local connection that sends nothing for this long
    pub idle_timeout: Option<Duration>,
    pub write_retries: u32,
}

impl ClientSettings {
    pub fn from_config(config: &Config, target: Address) -> Result<Self> {
        Ok(Self {
            relay: config.client.remote_addr()?,
            target,
            proxy: config.client.proxy_addr()?,
            request_timeout: config.client.request_timeout(),
            poll_interval: config.timing.poll_interval(),
            idle_timeout: config.timing.idle_timeout(),
            write_retries: config.client.write_retries,
        })
    }
}

// ============================================================================
// Session handle
// ============================================================================

/// One HTTP channel to a relay session. Holds no socket of its own.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: SessionId,
    url: String,
    http: reqwest::Client,
}

impl SessionHandle {
    pub fn new(id: SessionId, settings: &ClientSettings) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .pool_max_idle_per_host(1);

        builder = match &settings.proxy {
            Some(proxy) => builder.proxy(
                reqwest::Proxy::http(format!("http://{}", proxy))
                    .with_context(|| format!("Invalid proxy {}", proxy))?,
            ),
            None => builder.no_proxy(),
        };

        let http = builder.build().context("Failed to build HTTP client")?;
        let url = format!("http://{}{}", settings.relay, id.path());

        Ok(Self { id, url, http })
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Ask the relay to connect the session to `target`.
    pub async fn open(&self, target: &Address) -> Result<OpenOutcome> {
        let response = self
            .http
            .post(&self.url)
            .header(CONTENT_TYPE, FORM_CONTENT_TYPE)
            .header(ACCEPT, "text/plain")
            .body(protocol::encode_open(target))
            .send()
            .await
            .with_context(|| format!("Failed to open session {}", self.id))?;
        Ok(OpenOutcome::from_status(response.status()))
    }

    /// Deliver one chunk of at most [`BUFFER_SIZE`] bytes.
    pub async fn write(&self, payload: &[u8]) -> Result<WriteOutcome> {
        let response = self
            .http
            .put(&self.url)
            .header(CONTENT_TYPE, FORM_CONTENT_TYPE)
            .header(ACCEPT, "text/plain")
            .body(protocol::encode_data(payload))
            .send()
            .await
            .with_context(|| format!("Failed to send data for session {}", self.id))?;
        Ok(WriteOutcome::from_status(response.status()))
    }

    /// Poll the relay for bytes from the target.
    pub async fn read(&self) -> Result<ReadOutcome> {
        let response = self
            .http
            .get(&self.url)
            .send()
            .await
            .with_context(|| format!("Failed to receive data for session {}", self.id))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .with_context(|| format!("Failed to read response body for session {}", self.id))?;
        Ok(ReadOutcome::from_response(status, body))
    }

    pub async fn close(&self) -> Result<()> {
        let response = self
            .http
            .delete(&self.url)
            .send()
            .await
            .with_context(|| format!("Failed to close session {}", self.id))?;
        if !response.status().is_success() {
            warn!("Relay answered {} to close of session {}", response.status(), self.id);
        }
        Ok(())
    }
}

// ============================================================================
// Relay client
// ============================================================================

/// Accept loop plus bookkeeping of the per-connection workers.
#[derive(Debug, Clone)]
pub struct RelayClient {
    settings: Arc<ClientSettings>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl RelayClient {
    pub fn new(settings: ClientSettings) -> Self {
        Self {
            settings: Arc::new(settings),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    /// Cancelling this token stops the accept loop and every connection.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Number of local connections still being served.
    pub fn active_connections(&self) -> usize {
        self.tracker.len()
    }

    /// Listen on `0.0.0.0:port` and serve until shutdown.
    pub async fn run(&self, listen_port: u16) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", listen_port))
            .await
            .with_context(|| format!("Failed to listen on port {}", listen_port))?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener. Returns once shutdown was requested
    /// and every connection has closed its session.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        info!(
            "Waiting for connections on {}, tunnelling to {} via relay {}{}",
            listener.local_addr()?,
            self.settings.target,
            self.settings.relay,
            self.settings
                .proxy
                .as_ref()
                .map(|p| format!(" through proxy {}", p))
                .unwrap_or_default()
        );

        loop {
            let (stream, peer) = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!("Accept error: {}", e);
                        continue;
                    }
                },
            };

            info!("Connected by {}", peer);
            let settings = Arc::clone(&self.settings);
            let cancel = self.shutdown.child_token();
            self.tracker.spawn(async move {
                if let Err(e) = handle_connection(stream, settings, cancel).await {
                    warn!("Connection from {} failed: {:#}", peer, e);
                }
            });
        }

        drop(listener);
        info!(
            "Shutting down, waiting for {} connections",
            self.tracker.len()
        );
        self.tracker.close();
        self.tracker.wait().await;
        Ok(())
    }
}

/// Drive one local connection from open to close.
async fn handle_connection(
    stream: TcpStream,
    settings: Arc<ClientSettings>,
    cancel: CancellationToken,
) -> Result<()> {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY: {}", e);
    }

    let id = SessionId::generate();
    let control = SessionHandle::new(id.clone(), &settings)?;

    match control.open(&settings.target).await? {
        OpenOutcome::Created => info!("Session {} open to {}", id, settings.target),
        outcome => {
            // Dropping the stream closes the local connection.
            anyhow::bail!("Relay refused session {} to {}: {:?}", id, settings.target, outcome);
        }
    }

    let uplink_handle = SessionHandle::new(id.clone(), &settings)?;
    let downlink_handle = SessionHandle::new(id.clone(), &settings)?;
    let (reader, writer) = stream.into_split();

    let uplink = tokio::spawn(run_uplink(
        reader,
        uplink_handle,
        Arc::clone(&settings),
        cancel.clone(),
    ));
    let downlink = tokio::spawn(run_downlink(
        writer,
        downlink_handle,
        Arc::clone(&settings),
        cancel.clone(),
    ));

    let (reader, writer) = tokio::join!(uplink, downlink);
    if let Err(e) = &reader {
        error!("Uplink worker of session {} panicked: {}", id, e);
    }
    if let Err(e) = &writer {
        error!("Downlink worker of session {} panicked: {}", id, e);
    }

    if let Err(e) = control.close().await {
        warn!("{:#}", e);
    }

    drop(reader);
    drop(writer);
    info!("Session {} closed", id);
    Ok(())
}

/// Local socket to relay. Ends on local EOF, idle timeout, a dead session or
/// cancellation, and always cancels the downlink on the way out.
async fn run_uplink(
    mut reader: OwnedReadHalf,
    handle: SessionHandle,
    settings: Arc<ClientSettings>,
    cancel: CancellationToken,
) -> OwnedReadHalf {
    let mut buf = vec![0u8; BUFFER_SIZE];

    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = read_local(&mut reader, &mut buf, settings.idle_timeout) => read,
        };

        let n = match read {
            Ok(Some(0)) => {
                debug!("Local end of session {} closed", handle.id());
                break;
            }
            Ok(Some(n)) => n,
            Ok(None) => {
                info!("Session {} idle, closing", handle.id());
                break;
            }
            Err(e) => {
                debug!("Local read for session {} failed: {}", handle.id(), e);
                break;
            }
        };

        let keep_going = tokio::select! {
            _ = cancel.cancelled() => break,
            ok = send_chunk(&handle, &buf[..n], settings.write_retries) => ok,
        };
        if !keep_going {
            break;
        }
    }

    cancel.cancel();
    reader
}

/// `Ok(None)` means the idle timeout elapsed.
async fn read_local(
    reader: &mut OwnedReadHalf,
    buf: &mut [u8],
    idle_timeout: Option<Duration>,
) -> io::Result<Option<usize>> {
    match idle_timeout {
        Some(limit) => match tokio::time::timeout(limit, reader.read(buf)).await {
            Ok(read) => read.map(Some),
            Err(_) => Ok(None),
        },
        None => reader.read(buf).await.map(Some),
    }
}

/// Returns false when the session is no longer usable.
async fn send_chunk(handle: &SessionHandle, chunk: &[u8], retries: u32) -> bool {
    let mut attempts = 0;
    loop {
        match handle.write(chunk).await {
            Ok(WriteOutcome::Written) => return true,
            Ok(WriteOutcome::Timeout) if attempts < retries => {
                attempts += 1;
                debug!(
                    "Target of session {} not writable, retry {}/{}",
                    handle.id(),
                    attempts,
                    retries
                );
            }
            Ok(WriteOutcome::Timeout) => {
                warn!(
                    "Target of session {} not writable after {} retries",
                    handle.id(),
                    retries
                );
                return false;
            }
            Ok(WriteOutcome::UnknownSession) => {
                warn!("Relay no longer knows session {}", handle.id());
                return false;
            }
            Ok(WriteOutcome::TooLarge) => {
                error!("Relay rejected {} byte chunk for session {}", chunk.len(), handle.id());
                return false;
            }
            Ok(WriteOutcome::IoError) => {
                warn!("Relay failed to deliver {} bytes for session {}", chunk.len(), handle.id());
                return true;
            }
            Err(e) => {
                warn!("{:#}", e);
                return true;
            }
        }
    }
}

/// Relay to local socket. Ends when the target closes, the local socket
/// fails or the connection is cancelled. Relay errors are only logged.
async fn run_downlink(
    mut writer: OwnedWriteHalf,
    handle: SessionHandle,
    settings: Arc<ClientSettings>,
    cancel: CancellationToken,
) -> OwnedWriteHalf {
    loop {
        let outcome = tokio::select! {
            _ = cancel.cancelled() => break,
            outcome = handle.read() => outcome,
        };

        match outcome {
            Ok(ReadOutcome::Data(data)) => {
                let written = tokio::select! {
                    _ = cancel.cancelled() => break,
                    written = writer.write_all(&data) => written,
                };
                if let Err(e) = written {
                    debug!("Local write for session {} failed: {}", handle.id(), e);
                    break;
                }
                continue;
            }
            Ok(ReadOutcome::Eof) => {
                info!("Target closed session {}", handle.id());
                break;
            }
            Ok(ReadOutcome::NoData) => {}
            Ok(other) => debug!("Read from session {}: {:?}", handle.id(), other),
            Err(e) => warn!("{:#}", e),
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(settings.poll_interval) => {}
        }
    }

    cancel.cancel();
    writer
}
