// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Mock TLS collector for pipeline tests.
//!
//! Speaks the collector side of the wire protocol: read the client's
//! version, answer with a configurable command, then capture everything the
//! client streams until it closes the connection.

use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

use chatload_pipeline::Host;

pub const CMD_VERSION_OK: u32 = 1;
#[allow(dead_code)]
pub const CMD_VERSION_NOT_SUPPORTED: u32 = 2;

/// One accepted connection: the client's announced version and everything
/// it streamed after the exchange.
#[derive(Debug, Clone)]
pub struct Upload {
    pub version: u32,
    pub body: Vec<u8>,
}

/// How the collector treats a connection after accepting it.
#[derive(Debug, Clone, Copy)]
enum Mode {
    /// Answer the version exchange with this command.
    Respond(u32),
    /// Read the client's version, then never answer.
    Silent,
    /// Answer `VERSION_OK`, then close immediately.
    CloseAfterOk,
}

pub struct MockCollector {
    addr: SocketAddr,
    uploads: Arc<Mutex<Vec<Upload>>>,
    completed: Arc<AtomicUsize>,
}

impl MockCollector {
    /// Start a collector on a random port, answering every version exchange
    /// with `response`.
    pub async fn start(response: u32) -> Self {
        Self::start_with(Mode::Respond(response)).await
    }

    /// A collector that accepts connections but never completes the version
    /// exchange.
    #[allow(dead_code)]
    pub async fn start_silent() -> Self {
        Self::start_with(Mode::Silent).await
    }

    /// A collector that accepts the client's version and then drops the
    /// connection mid-stream.
    #[allow(dead_code)]
    pub async fn start_closing() -> Self {
        Self::start_with(Mode::CloseAfterOk).await
    }

    async fn start_with(mode: Mode) -> Self {
        let acceptor = TlsAcceptor::from(Arc::new(server_config()));
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind mock collector");
        let addr = listener.local_addr().expect("failed to get local addr");

        let uploads = Arc::new(Mutex::new(Vec::new()));
        let completed = Arc::new(AtomicUsize::new(0));
        let uploads_clone = Arc::clone(&uploads);
        let completed_clone = Arc::clone(&completed);

        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => break,
                };

                let acceptor = acceptor.clone();
                let uploads = Arc::clone(&uploads_clone);
                let completed = Arc::clone(&completed_clone);
                tokio::spawn(async move {
                    let Ok(mut tls) = acceptor.accept(stream).await else {
                        return;
                    };
                    let Ok(version) = tls.read_u32_le().await else {
                        return;
                    };

                    let response = match mode {
                        Mode::Silent => {
                            tokio::time::sleep(Duration::from_secs(3600)).await;
                            return;
                        }
                        Mode::Respond(response) => response,
                        Mode::CloseAfterOk => CMD_VERSION_OK,
                    };
                    if tls.write_all(&response.to_le_bytes()).await.is_err() {
                        return;
                    }
                    let _ = tls.flush().await;

                    let mut body = Vec::new();
                    match mode {
                        Mode::Respond(CMD_VERSION_OK) => {
                            // Capture until the client's close_notify; a hard
                            // disconnect still keeps what arrived before it.
                            let _ = tls.read_to_end(&mut body).await;
                        }
                        _ => {
                            let _ = tls.shutdown().await;
                        }
                    }

                    uploads.lock().expect("uploads lock").push(Upload { version, body });
                    completed.fetch_add(1, Ordering::SeqCst);
                });
            }
        });

        MockCollector {
            addr,
            uploads,
            completed,
        }
    }

    /// The collector as a pipeline host. Verification is disabled; the mock
    /// serves a self-signed certificate.
    pub fn host(&self) -> Host {
        Host {
            name: "localhost".to_owned(),
            port: self.addr.port(),
            insecure_tls: true,
        }
    }

    /// Wait until `count` connections have finished, then return them.
    pub async fn wait_for_uploads(&self, count: usize) -> Vec<Upload> {
        for _ in 0..500 {
            if self.completed.load(Ordering::SeqCst) >= count {
                return self.uploads.lock().expect("uploads lock").clone();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "collector saw {} finished uploads, expected {count}",
            self.completed.load(Ordering::SeqCst)
        );
    }
}

fn server_config() -> rustls::ServerConfig {
    let cert_path = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/certs/cert.pem");
    let key_path = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/certs/key.pem");

    let certs = rustls_pemfile::certs(&mut BufReader::new(
        File::open(cert_path).expect("test certificate"),
    ))
    .collect::<Result<Vec<_>, _>>()
    .expect("parse test certificate");
    let key = rustls_pemfile::private_key(&mut BufReader::new(
        File::open(key_path).expect("test key"),
    ))
    .expect("parse test key")
    .expect("test key present");

    rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .expect("build server config")
}
