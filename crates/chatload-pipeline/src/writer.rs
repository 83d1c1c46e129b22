// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-host TLS upload writer.
//!
//! Each host gets one task driving an explicit connection state machine:
//!
//! ```text
//! Resolving → Connecting → Handshaking → Exchanging → Streaming
//!                                                         │ shutdown()
//!                                                         v
//!                                            Draining → ShuttingDown → Closed
//! ```
//!
//! `Failed` is reachable from every state; the first error is recorded and
//! everything after it is a no-op. Hosts fail independently of each other.
//!
//! The wire protocol is little-endian `u32`s: the client sends its protocol
//! version, the server answers `VERSION_OK` or `VERSION_NOT_SUPPORTED`, then
//! the client streams report frames until it closes the connection. Any
//! further server commands are discarded by a background read loop; EOF on
//! the read side mid-stream means the server went away.
//!
//! Buffers pushed before shutdown reach the wire in push order: the task
//! drains its channel in FIFO order and writes are serialized. A single
//! deadline is armed when streaming begins and cancelled by a graceful
//! drain; it is the only source of [`UploadError::Timeout`] after the
//! exchange.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, trace, warn};

use crate::error::UploadError;
use crate::options::Host;

/// Protocol version announced to every server.
pub const PROTOCOL_VERSION: u32 = 1;
/// Server accepts the announced version.
pub const CMD_VERSION_OK: u32 = 1;
/// Server rejects the announced version.
pub const CMD_VERSION_NOT_SUPPORTED: u32 = 2;

/// Connection progress; used for transition logging and the final report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    Resolving,
    Connecting,
    Handshaking,
    Exchanging,
    Streaming,
    Draining,
    ShuttingDown,
    Closed,
}

impl fmt::Display for WriterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// End-of-run status of one host.
#[derive(Debug)]
pub struct HostReport {
    pub host: Host,
    pub error: Option<UploadError>,
}

impl HostReport {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Consumer-side handle to one writer task.
pub struct WriterHandle {
    host: Host,
    tx: Option<mpsc::UnboundedSender<Bytes>>,
    failed: Arc<AtomicBool>,
    task: JoinHandle<Option<UploadError>>,
}

impl WriterHandle {
    /// Spawn the upload task for one host on the current runtime.
    pub fn spawn(host: Host, connector: TlsConnector, timeout: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let failed = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(run_writer(
            host.clone(),
            connector,
            timeout,
            rx,
            Arc::clone(&failed),
        ));
        WriterHandle {
            host,
            tx: Some(tx),
            failed,
            task,
        }
    }

    /// Queue a buffer for upload. A no-op once the writer failed or was shut
    /// down.
    pub fn push_buffer(&self, buf: Bytes) {
        if self.has_failed() {
            return;
        }
        if let Some(tx) = &self.tx {
            // A send error means the task already terminated; its recorded
            // error is surfaced by `finish`.
            let _ = tx.send(buf);
        }
    }

    /// Request a graceful drain and connection close. Idempotent.
    pub fn shutdown(&mut self) {
        self.tx = None;
    }

    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    /// Wait for the task and collect this host's report.
    pub async fn finish(mut self) -> HostReport {
        self.shutdown();
        let error = match self.task.await {
            Ok(error) => error,
            Err(join_err) => Some(UploadError::Io(io::Error::other(join_err))),
        };
        HostReport {
            host: self.host,
            error,
        }
    }
}

async fn run_writer(
    host: Host,
    connector: TlsConnector,
    timeout: Duration,
    rx: mpsc::UnboundedReceiver<Bytes>,
    failed: Arc<AtomicBool>,
) -> Option<UploadError> {
    match drive(&host, connector, timeout, rx).await {
        Ok(()) => {
            debug!(host = %host, state = %WriterState::Closed, "upload finished");
            None
        }
        Err(error) => {
            failed.store(true, Ordering::Relaxed);
            warn!(host = %host, error = %error, "upload failed");
            Some(error)
        }
    }
}

async fn drive(
    host: &Host,
    connector: TlsConnector,
    timeout: Duration,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
) -> Result<(), UploadError> {
    // Resolve, connect, handshake, and exchange versions within one timeout.
    let stream = match tokio::time::timeout(timeout, establish(host, connector)).await {
        Ok(result) => result?,
        Err(_elapsed) => return Err(UploadError::Timeout),
    };

    transition(host, WriterState::Streaming);
    // Streaming is throughput-bound, so give the buffers back to Nagle.
    let _ = stream.get_ref().0.set_nodelay(false);
    let deadline = Instant::now() + timeout;

    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut read_task = tokio::spawn(discard_commands(read_half));

    let streamed = stream_buffers(&mut rx, &mut write_half, &mut read_task, deadline).await;
    read_task.abort();

    if streamed.is_ok() {
        // Pending writes flushed; the deadline no longer applies.
        transition(host, WriterState::Draining);
    }
    transition(host, WriterState::ShuttingDown);
    let close = write_half.shutdown().await;
    match streamed {
        // An abort-induced close error never overwrites the streaming error.
        Err(error) => Err(error),
        Ok(()) => close.map_err(UploadError::Io),
    }
}

/// Resolve the host and bring the connection up to the streaming state.
async fn establish(host: &Host, connector: TlsConnector) -> Result<TlsStream<TcpStream>, UploadError> {
    transition(host, WriterState::Resolving);
    let addrs: Vec<_> = tokio::net::lookup_host((host.name.as_str(), host.port))
        .await
        .map_err(UploadError::Resolve)?
        .collect();
    if addrs.is_empty() {
        return Err(UploadError::Resolve(io::Error::new(
            io::ErrorKind::NotFound,
            "hostname resolved to no addresses",
        )));
    }

    transition(host, WriterState::Connecting);
    let mut last_err = None;
    let mut tcp = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                tcp = Some(stream);
                break;
            }
            Err(err) => {
                debug!(host = %host, %addr, error = %err, "endpoint connect failed");
                last_err = Some(err);
            }
        }
    }
    let tcp = match (tcp, last_err) {
        (Some(tcp), _) => tcp,
        (None, Some(err)) => return Err(UploadError::Io(err)),
        (None, None) => {
            return Err(UploadError::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "no endpoint available",
            )))
        }
    };

    transition(host, WriterState::Handshaking);
    // The handshake and version exchange are latency-bound round trips.
    tcp.set_nodelay(true).map_err(UploadError::Io)?;
    let server_name = rustls::pki_types::ServerName::try_from(host.name.clone())
        .map_err(|err| UploadError::Resolve(io::Error::new(io::ErrorKind::InvalidInput, err)))?;
    let mut stream = connector
        .connect(server_name, tcp)
        .await
        .map_err(UploadError::Io)?;

    transition(host, WriterState::Exchanging);
    stream
        .write_all(&PROTOCOL_VERSION.to_le_bytes())
        .await
        .map_err(UploadError::Io)?;
    stream.flush().await.map_err(UploadError::Io)?;
    match stream.read_u32_le().await.map_err(UploadError::Io)? {
        CMD_VERSION_OK => Ok(stream),
        CMD_VERSION_NOT_SUPPORTED => {
            let _ = stream.shutdown().await;
            Err(UploadError::ProtocolVersionNotSupported)
        }
        other => {
            let _ = stream.shutdown().await;
            Err(UploadError::UnknownCommand(other))
        }
    }
}

/// Forward queued buffers to the connection until shutdown, a failure, or
/// the deadline. Returning `Ok` means the channel was closed and every
/// pending buffer reached the TLS layer (the drain completed).
async fn stream_buffers(
    rx: &mut mpsc::UnboundedReceiver<Bytes>,
    write_half: &mut WriteHalf<TlsStream<TcpStream>>,
    read_task: &mut JoinHandle<Option<UploadError>>,
    deadline: Instant,
) -> Result<(), UploadError> {
    let mut pending: Vec<Bytes> = Vec::new();
    loop {
        tokio::select! {
            received = rx.recv() => {
                let Some(first) = received else {
                    return Ok(());
                };
                // Bundle everything that is already queued into this flush.
                pending.clear();
                pending.push(first);
                while let Ok(next) = rx.try_recv() {
                    pending.push(next);
                }
                for buf in &pending {
                    match tokio::time::timeout_at(deadline, write_half.write_all(buf)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => return Err(UploadError::Io(err)),
                        Err(_elapsed) => return Err(UploadError::Timeout),
                    }
                }
            }
            finished = &mut *read_task => {
                return Err(match finished {
                    Ok(Some(error)) => error,
                    Ok(None) => UploadError::ServerShutdown,
                    Err(join_err) => UploadError::Io(io::Error::other(join_err)),
                });
            }
            () = tokio::time::sleep_until(deadline) => {
                return Err(UploadError::Timeout);
            }
        }
    }
}

/// Background read loop: discard further server commands. Returns `None` on
/// EOF (the server went away) or the error that ended reading.
async fn discard_commands(mut read_half: ReadHalf<TlsStream<TcpStream>>) -> Option<UploadError> {
    loop {
        match read_half.read_u32_le().await {
            Ok(command) => {
                trace!(command, "discarding server command");
            }
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return None,
            Err(err) => return Some(UploadError::Io(err)),
        }
    }
}

fn transition(host: &Host, state: WriterState) {
    debug!(host = %host, state = %state, "writer state");
}
