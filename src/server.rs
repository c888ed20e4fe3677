// src/server.rs
//
// Ingestion connection server. Accepts framed requests, optionally gates
// each connection behind the auth handshake, and feeds request bodies into a
// `BatchSink`. Every connection runs in its own task behind a panic barrier;
// one misbehaving connection never takes the server down.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::auth::{auth_response, Authenticator, HANDSHAKE_TIMEOUT_SECS};
use crate::framing::{read_frame, write_frame, FrameError};

pub const READ_TIMEOUT: Duration = Duration::from_secs(30);
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("server is already running")]
    AlreadyRunning,
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// The narrow seam between the server and the ingestion pipeline: one
/// request body in, one response body out. An `Err` closes the connection
/// after the diagnostic is sent.
pub trait BatchSink: Send + Sync {
    fn process(&self, data: &[u8]) -> Result<Vec<u8>, String>;
}

pub struct IngestServer {
    bind: String,
    auth: Arc<Authenticator>,
    sink: Arc<dyn BatchSink>,
    running: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    accept_handle: AsyncMutex<Option<tokio::task::JoinHandle<()>>>,
    local_addr: std::sync::Mutex<Option<SocketAddr>>,
}

impl IngestServer {
    pub fn new(bind: impl Into<String>, auth: Arc<Authenticator>, sink: Arc<dyn BatchSink>) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Arc::new(Self {
            bind: bind.into(),
            auth,
            sink,
            running: AtomicBool::new(false),
            shutdown_tx,
            shutdown_rx,
            accept_handle: AsyncMutex::new(None),
            local_addr: std::sync::Mutex::new(None),
        })
    }

    /// Actual listener address once bound (useful when binding port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().expect("local addr lock poisoned")
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Bind and start accepting. Returns once the listener is up.
    pub async fn start(self: &Arc<Self>) -> Result<(), ServerError> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(ServerError::AlreadyRunning);
        }

        let listener = TcpListener::bind(&self.bind).await.map_err(|e| {
            self.running.store(false, Ordering::Release);
            ServerError::Bind { addr: self.bind.clone(), source: e }
        })?;
        if let Ok(addr) = listener.local_addr() {
            *self.local_addr.lock().expect("local addr lock poisoned") = Some(addr);
        }
        info!(addr = %self.bind, auth = self.auth.is_enabled(), "ingest server listening");

        let server = self.clone();
        let mut shutdown = self.shutdown_rx.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                let server = server.clone();
                                tokio::spawn(async move {
                                    // Panic barrier: a handler panic is
                                    // logged and tears down only this
                                    // connection.
                                    let outcome = std::panic::AssertUnwindSafe(
                                        server.handle_connection(stream),
                                    )
                                    .catch_unwind()
                                    .await;
                                    if outcome.is_err() {
                                        error!(peer = %peer, "connection handler panicked");
                                    }
                                });
                            }
                            Err(e) => {
                                warn!(error = %e, "accept failed");
                            }
                        }
                    }
                }
            }
        });
        *self.accept_handle.lock().await = Some(handle);
        Ok(())
    }

    /// Stop accepting. Existing connections drain at their next deadline.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.accept_handle.lock().await.take() {
            let _ = handle.await;
        }
    }

    async fn handle_connection(&self, mut stream: TcpStream) {
        if self.auth.is_enabled() && !self.handshake(&mut stream).await {
            return;
        }

        loop {
            let data = match timeout(READ_TIMEOUT, read_frame(&mut stream)).await {
                Ok(Ok(data)) => data,
                Ok(Err(FrameError::Oversize { len })) => {
                    debug!(len, "oversize request");
                    let _ = timeout(
                        WRITE_TIMEOUT,
                        write_frame(&mut stream, b"error: message too large"),
                    )
                    .await;
                    return;
                }
                Ok(Err(_)) | Err(_) => return,
            };

            let response = match self.sink.process(&data) {
                Ok(resp) => resp,
                Err(diag) => {
                    let _ = timeout(
                        WRITE_TIMEOUT,
                        write_frame(&mut stream, diag.as_bytes()),
                    )
                    .await;
                    return;
                }
            };

            match timeout(WRITE_TIMEOUT, write_frame(&mut stream, &response)).await {
                Ok(Ok(())) => {}
                _ => return,
            }
        }
    }

    /// First-frame token handshake with its own (shorter) deadline. The
    /// response goes out before the connection closes on failure.
    async fn handshake(&self, stream: &mut TcpStream) -> bool {
        let deadline = Duration::from_secs(HANDSHAKE_TIMEOUT_SECS);
        let frame = match timeout(deadline, read_frame(stream)).await {
            Ok(Ok(frame)) => frame,
            _ => return false,
        };

        let verdict = self.auth.check_first_frame(&frame);
        let body = auth_response(&verdict);
        let sent = timeout(Duration::from_secs(5), write_frame(stream, &body)).await;

        verdict.is_ok() && matches!(sent, Ok(Ok(())))
    }
}
