// src/ordering/mod.rs
//
// The ordering service: certifies submitted events and batches them into
// blocks. A single event-loop task owns the pending map and the block
// builder; all concurrency sits at the edges (bounded intake channel, block
// output channel). A flush tick at half the batch timeout emits batches that
// aged out without reaching the size trigger.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tracing::{debug, error, warn};

pub mod builder;
pub mod certifier;


pub use builder::BlockBuilder;
pub use certifier::{EventCertifier, ValidationRule};

use crate::crypto::hash_bytes_sha256;
use crate::pool::{Task, WorkerPool};
use crate::types::{unix_ms, EventStatus, FieldValue, PendingEvent};

/// Capacity of the block output channel. A slow downstream stalls the
/// ordering loop instead of losing blocks.
const BLOCK_CHANNEL_CAPACITY: usize = 100;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OrderingError {
    #[error("ordering service is not running")]
    NotRunning,
    #[error("event intake is full")]
    IntakeFull,
    #[error("ordering service has been shut down")]
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderingStatus {
    Maintenance,
    Active,
    Lockdown,
    Shutdown,
    Error,
}

impl std::fmt::Display for OrderingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OrderingStatus::Maintenance => "maintenance",
            OrderingStatus::Active => "active",
            OrderingStatus::Lockdown => "lockdown",
            OrderingStatus::Shutdown => "shutdown",
            OrderingStatus::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct OrderingConfig {
    pub block_size: usize,
    pub batch_timeout: Duration,
    pub workers: usize,
    pub max_pending: usize,
}

impl Default for OrderingConfig {
    fn default() -> Self {
        Self {
            block_size: 500,
            batch_timeout: Duration::from_secs(2),
            workers: 8,
            max_pending: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderingStats {
    pub status: String,
    pub events_received: u64,
    pub events_certified: u64,
    pub events_rejected: u64,
    pub blocks_created: u64,
    pub pending_count: usize,
    pub current_batch_size: usize,
}

struct Shared {
    status: RwLock<OrderingStatus>,
    received: AtomicU64,
    certified: AtomicU64,
    rejected: AtomicU64,
    blocks_created: AtomicU64,
    pending_count: AtomicUsize,
    batch_len: AtomicUsize,
}

pub struct OrderingService {
    config: OrderingConfig,
    shared: Arc<Shared>,
    certifier: Arc<EventCertifier>,
    pool: Arc<WorkerPool<String>>,
    event_tx: mpsc::Sender<PendingEvent>,
    event_rx: std::sync::Mutex<Option<mpsc::Receiver<PendingEvent>>>,
    block_rx: std::sync::Mutex<Option<mpsc::Receiver<Vec<PendingEvent>>>>,
    block_tx: std::sync::Mutex<Option<mpsc::Sender<Vec<PendingEvent>>>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    loop_handle: AsyncMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl OrderingService {
    pub fn new(config: OrderingConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.max_pending.max(1));
        let (block_tx, block_rx) = mpsc::channel(BLOCK_CHANNEL_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let pool = WorkerPool::new("ordering", config.workers);

        Self {
            config,
            shared: Arc::new(Shared {
                status: RwLock::new(OrderingStatus::Maintenance),
                received: AtomicU64::new(0),
                certified: AtomicU64::new(0),
                rejected: AtomicU64::new(0),
                blocks_created: AtomicU64::new(0),
                pending_count: AtomicUsize::new(0),
                batch_len: AtomicUsize::new(0),
            }),
            certifier: Arc::new(EventCertifier::with_default_rules()),
            pool,
            event_tx,
            event_rx: std::sync::Mutex::new(Some(event_rx)),
            block_rx: std::sync::Mutex::new(Some(block_rx)),
            block_tx: std::sync::Mutex::new(Some(block_tx)),
            shutdown_tx,
            shutdown_rx,
            loop_handle: AsyncMutex::new(None),
        }
    }

    pub fn status(&self) -> OrderingStatus {
        *self.shared.status.read().expect("status lock poisoned")
    }

    fn set_status(&self, status: OrderingStatus) {
        *self.shared.status.write().expect("status lock poisoned") = status;
    }

    /// Certifier accessor for installing custom validation rules.
    pub fn certifier(&self) -> &Arc<EventCertifier> {
        &self.certifier
    }

    /// Stats of the certification worker pool.
    pub fn pool_stats(&self) -> crate::pool::PoolStats {
        self.pool.stats()
    }

    /// Maintenance -> Active. Idempotent while Active; forbidden once shut
    /// down.
    pub async fn start(&self) -> Result<(), OrderingError> {
        match self.status() {
            OrderingStatus::Active => return Ok(()),
            OrderingStatus::Shutdown => return Err(OrderingError::Stopped),
            _ => {}
        }

        let event_rx = match self.event_rx.lock().expect("event rx lock poisoned").take() {
            Some(rx) => rx,
            None => return Err(OrderingError::Stopped),
        };
        let block_tx = match self.block_tx.lock().expect("block tx lock poisoned").take() {
            Some(tx) => tx,
            None => return Err(OrderingError::Stopped),
        };

        let event_loop = EventLoop {
            shared: self.shared.clone(),
            certifier: self.certifier.clone(),
            pool: self.pool.clone(),
            builder: BlockBuilder::new(self.config.block_size, self.config.batch_timeout),
            pending: HashMap::new(),
            event_rx,
            block_tx,
            shutdown: self.shutdown_rx.clone(),
            flush_interval: self.config.batch_timeout / 2,
        };

        let handle = tokio::spawn(event_loop.run());
        *self.loop_handle.lock().await = Some(handle);
        self.set_status(OrderingStatus::Active);
        Ok(())
    }

    /// Shut down: flush the current batch, drain the workers, close outputs.
    pub async fn stop(&self) {
        if self.status() == OrderingStatus::Shutdown {
            return;
        }
        self.set_status(OrderingStatus::Shutdown);
        let _ = self.shutdown_tx.send(true);

        if let Some(handle) = self.loop_handle.lock().await.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "ordering event loop ended abnormally");
            }
        }
        self.pool.shutdown().await;
    }

    /// Enqueue an event for ordering. Non-blocking.
    pub fn submit(&self, mut event: PendingEvent) -> Result<(), OrderingError> {
        if self.status() != OrderingStatus::Active {
            return Err(OrderingError::NotRunning);
        }
        event.received_at_ms = unix_ms();
        event.status = EventStatus::Pending;
        match self.event_tx.try_send(event) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(OrderingError::IntakeFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(OrderingError::NotRunning),
        }
    }

    /// Receive side of the block output channel. Single consumer.
    pub fn take_blocks(&self) -> Option<mpsc::Receiver<Vec<PendingEvent>>> {
        self.block_rx.lock().expect("block rx lock poisoned").take()
    }

    pub fn stats(&self) -> OrderingStats {
        OrderingStats {
            status: self.status().to_string(),
            events_received: self.shared.received.load(AtomicOrdering::Relaxed),
            events_certified: self.shared.certified.load(AtomicOrdering::Relaxed),
            events_rejected: self.shared.rejected.load(AtomicOrdering::Relaxed),
            blocks_created: self.shared.blocks_created.load(AtomicOrdering::Relaxed),
            pending_count: self.shared.pending_count.load(AtomicOrdering::Relaxed),
            current_batch_size: self.shared.batch_len.load(AtomicOrdering::Relaxed),
        }
    }
}

/// The single consumer of the intake channel. Owns all mutation of the
/// pending map and the block builder.
struct EventLoop {
    shared: Arc<Shared>,
    certifier: Arc<EventCertifier>,
    pool: Arc<WorkerPool<String>>,
    builder: BlockBuilder,
    pending: HashMap<String, PendingEvent>,
    event_rx: mpsc::Receiver<PendingEvent>,
    block_tx: mpsc::Sender<Vec<PendingEvent>>,
    shutdown: watch::Receiver<bool>,
    flush_interval: Duration,
}

impl EventLoop {
    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.flush_interval.max(Duration::from_millis(1)));
        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    if let Some(batch) = self.builder.force_flush() {
                        self.emit(batch).await;
                    }
                    debug!("ordering event loop stopped");
                    return;
                }
                event = self.event_rx.recv() => {
                    match event {
                        Some(ev) => self.handle_event(ev).await,
                        None => {
                            if let Some(batch) = self.builder.force_flush() {
                                self.emit(batch).await;
                            }
                            return;
                        }
                    }
                }
                _ = ticker.tick() => {
                    if let Some(batch) = self.builder.flush_expired() {
                        self.emit(batch).await;
                    }
                    self.shared.batch_len.store(self.builder.batch_size(), AtomicOrdering::Relaxed);
                }
            }
        }
    }

    async fn handle_event(&mut self, mut event: PendingEvent) {
        self.shared.received.fetch_add(1, AtomicOrdering::Relaxed);

        event.status = EventStatus::Processing;
        self.pending.insert(event.id.clone(), event.clone());
        self.shared.pending_count.store(self.pending.len(), AtomicOrdering::Relaxed);

        // Payload digests are computed off-loop; awaiting the pool here keeps
        // certification order intact.
        let payload_bytes = match event.data.get("data") {
            Some(FieldValue::Bytes(b)) => Some(b.clone()),
            _ => None,
        };
        if let Some(bytes) = payload_bytes {
            let outcome = self
                .pool
                .submit_and_wait(
                    Task::new(format!("digest-{}", event.id), move || {
                        Ok::<_, String>(hex::encode(hash_bytes_sha256(&bytes)))
                    }),
                    Duration::from_secs(1),
                )
                .await;
            match outcome {
                Ok(result) => {
                    if let Ok(digest) = result.output {
                        event
                            .data
                            .insert("payload_digest".to_string(), FieldValue::Str(digest));
                    }
                }
                Err(e) => debug!(event = %event.id, error = %e, "payload digest skipped"),
            }
        }

        let cert = self.certifier.validate(&mut event);
        if !cert.valid {
            self.shared.rejected.fetch_add(1, AtomicOrdering::Relaxed);
            self.pending.remove(&event.id);
            self.shared.pending_count.store(self.pending.len(), AtomicOrdering::Relaxed);
            event.status = EventStatus::Rejected;
            debug!(event = %event.id, errors = ?cert.errors, "event rejected");
            return;
        }

        self.shared.certified.fetch_add(1, AtomicOrdering::Relaxed);
        event.status = EventStatus::Certified;
        self.pending.insert(event.id.clone(), event.clone());

        if let Some(batch) = self.builder.add(event) {
            self.emit(batch).await;
        }
        self.shared.batch_len.store(self.builder.batch_size(), AtomicOrdering::Relaxed);
    }

    /// Mark a finalized batch Ordered and publish it. Emission awaits the
    /// channel: blocks are never dropped.
    async fn emit(&mut self, mut batch: Vec<PendingEvent>) {
        for ev in batch.iter_mut() {
            ev.status = EventStatus::Ordered;
            self.pending.remove(&ev.id);
        }
        self.shared.pending_count.store(self.pending.len(), AtomicOrdering::Relaxed);
        self.shared.blocks_created.fetch_add(1, AtomicOrdering::Relaxed);

        if self.block_tx.send(batch).await.is_err() {
            warn!("block output channel closed; block discarded");
        }
    }
}
