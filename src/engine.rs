// src/engine.rs
//
// Supervisor. Owns the mempool, the ordering service, the optional network
// stack and the crypto kernel seam, and runs the loops that tie them
// together: ingestion sink -> mempool, mempool -> ordering (drain), ordering
// -> sealed block -> propagation, and gossip intake -> mempool.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::{debug, error, info, warn};

use crate::auth::Authenticator;
use crate::codec::{self, EventRecord};
use crate::config::EngineConfig;
use crate::crypto::{hash_bytes_sha256, CryptoKernel};
use crate::mempool::{Mempool, MempoolError, MempoolStats};
use crate::net::{GossipEvent, NetError, NetworkService, NetworkStatus};
use crate::ordering::{OrderingConfig, OrderingError, OrderingService, OrderingStats};
use crate::pool::PoolStats;
use crate::server::{BatchSink, IngestServer, ServerError};
use crate::types::{unix_ms, unix_secs, FieldValue, PendingEvent, Transaction};

/// How often the drain loop moves admitted transactions into ordering.
const DRAIN_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine already running")]
    AlreadyRunning,
    #[error(transparent)]
    Ordering(#[from] OrderingError),
    #[error(transparent)]
    Net(#[from] NetError),
    #[error(transparent)]
    Server(#[from] ServerError),
}

struct ChainTip {
    height: u64,
    previous_hash: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineCounters {
    pub batches_received: u64,
    pub txs_admitted: u64,
    pub txs_rejected: u64,
    pub blocks_sealed: u64,
    pub seal_failures: u64,
    pub gossip_txs: u64,
    pub gossip_blocks: u64,
    pub ordering_overflow_drops: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub version: &'static str,
    pub uptime_seconds: u64,
    pub chain_height: u64,
    pub chain_tip: String,
    pub engine: EngineCounters,
    pub mempool: MempoolStats,
    pub ordering: OrderingStats,
    pub ordering_pool: PoolStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkStatus>,
}

pub struct Engine {
    config: EngineConfig,
    auth: Arc<Authenticator>,
    mempool: Arc<Mempool>,
    ordering: Arc<OrderingService>,
    network: Option<Arc<NetworkService>>,
    kernel: Arc<dyn CryptoKernel>,
    server: AsyncMutex<Option<Arc<IngestServer>>>,
    chain: std::sync::Mutex<ChainTip>,
    started_at_ms: u64,
    running: AtomicBool,

    batches_received: AtomicU64,
    txs_admitted: AtomicU64,
    txs_rejected: AtomicU64,
    blocks_sealed: AtomicU64,
    seal_failures: AtomicU64,
    gossip_txs: AtomicU64,
    gossip_blocks: AtomicU64,
    ordering_overflow_drops: AtomicU64,

    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    tasks: AsyncMutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Engine {
    pub fn new(config: EngineConfig, kernel: Arc<dyn CryptoKernel>) -> Arc<Self> {
        let ordering = OrderingService::new(OrderingConfig {
            block_size: config.block_size,
            batch_timeout: config.batch_timeout,
            workers: config.workers,
            ..OrderingConfig::default()
        });
        let network = config
            .network
            .bind
            .is_some()
            .then(|| NetworkService::new(config.network.clone()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Arc::new(Self {
            auth: Arc::new(Authenticator::new(config.auth.clone())),
            mempool: Arc::new(Mempool::new(config.mempool_max)),
            ordering: Arc::new(ordering),
            network,
            kernel,
            server: AsyncMutex::new(None),
            chain: std::sync::Mutex::new(ChainTip {
                height: 0,
                previous_hash: "0".repeat(64),
            }),
            started_at_ms: unix_ms(),
            running: AtomicBool::new(false),
            batches_received: AtomicU64::new(0),
            txs_admitted: AtomicU64::new(0),
            txs_rejected: AtomicU64::new(0),
            blocks_sealed: AtomicU64::new(0),
            seal_failures: AtomicU64::new(0),
            gossip_txs: AtomicU64::new(0),
            gossip_blocks: AtomicU64::new(0),
            ordering_overflow_drops: AtomicU64::new(0),
            shutdown_tx,
            shutdown_rx,
            tasks: AsyncMutex::new(Vec::new()),
            config,
        })
    }

    pub fn mempool(&self) -> &Arc<Mempool> {
        &self.mempool
    }

    pub fn ordering(&self) -> &Arc<OrderingService> {
        &self.ordering
    }

    pub fn network(&self) -> Option<&Arc<NetworkService>> {
        self.network.as_ref()
    }

    pub async fn ingest_addr(&self) -> Option<std::net::SocketAddr> {
        self.server.lock().await.as_ref().and_then(|s| s.local_addr())
    }

    /// Bring the whole pipeline up: ordering, network, internal loops, then
    /// the ingestion listener.
    pub async fn start(self: &Arc<Self>) -> Result<(), EngineError> {
        if self.running.swap(true, AtomicOrdering::AcqRel) {
            return Err(EngineError::AlreadyRunning);
        }

        self.ordering.start().await?;
        if let Some(net) = &self.network {
            net.start().await?;
        }

        let mut tasks = self.tasks.lock().await;

        // mempool -> ordering drain loop
        {
            let engine = self.clone();
            let mut shutdown = self.shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(DRAIN_INTERVAL);
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => return,
                        _ = ticker.tick() => engine.drain_once().await,
                    }
                }
            }));
        }

        // ordering -> sealed block -> propagation. Runs until the block
        // channel closes (when ordering stops), so a final flush is never
        // lost to a shutdown race.
        if let Some(mut blocks) = self.ordering.take_blocks() {
            let engine = self.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(batch) = blocks.recv().await {
                    engine.seal_and_publish(batch).await;
                }
            }));
        }

        // gossip intake -> mempool
        if let Some(net) = &self.network {
            if let Some(mut events) = net.take_events() {
                let engine = self.clone();
                let mut shutdown = self.shutdown_rx.clone();
                tasks.push(tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            _ = shutdown.changed() => return,
                            event = events.recv() => {
                                match event {
                                    Some(ev) => engine.handle_gossip(ev),
                                    None => return,
                                }
                            }
                        }
                    }
                }));
            }
        }
        drop(tasks);

        let sink: Arc<dyn BatchSink> = self.clone();
        let server = IngestServer::new(self.config.bind.clone(), self.auth.clone(), sink);
        server.start().await?;
        *self.server.lock().await = Some(server);

        info!(bind = %self.config.bind, "engine started");
        Ok(())
    }

    /// Orderly shutdown: listener first, then the loops, then the ordering
    /// service and the network stack.
    pub async fn stop(&self) {
        if !self.running.swap(false, AtomicOrdering::AcqRel) {
            return;
        }
        if let Some(server) = self.server.lock().await.take() {
            server.stop().await;
        }
        // Ordering stops first so its final flush lands on the block loop,
        // which drains to completion when the channel closes.
        self.ordering.stop().await;
        let _ = self.shutdown_tx.send(true);
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            let _ = task.await;
        }
        if let Some(net) = &self.network {
            net.stop().await;
        }
        info!("engine stopped");
    }

    /// One drain tick: pop a block's worth of transactions and feed them to
    /// ordering, pushing back on intake pressure.
    async fn drain_once(&self) {
        let txs = self.mempool.pop_batch(self.config.block_size);
        for tx in txs {
            // Locally-admitted transactions spread to peers; relayed ones
            // were already flooded by their origin.
            if !tx.metadata.contains_key("relayed") {
                if let Some(net) = &self.network {
                    if net.is_running() {
                        if let Ok(bytes) = serde_json::to_vec(&tx) {
                            let _ = net.broadcast_transaction(&bytes).await;
                        }
                    }
                }
            }

            let event = PendingEvent::from_transaction(&tx, "mempool");
            match self.ordering.submit(event) {
                Ok(()) => {}
                Err(OrderingError::IntakeFull) => {
                    // Backpressure: put it back and stop draining this tick.
                    if self.mempool.add(tx).is_err() {
                        self.ordering_overflow_drops.fetch_add(1, AtomicOrdering::Relaxed);
                    }
                    return;
                }
                Err(_) => {
                    let _ = self.mempool.add(tx);
                    return;
                }
            }
        }
    }

    /// Compute the merkle root and block hash via the kernel, advance the
    /// chain tip, and hand the sealed block to the propagator.
    async fn seal_and_publish(&self, batch: Vec<PendingEvent>) {
        let events_json = match serde_json::to_vec(&batch) {
            Ok(b) => b,
            Err(e) => {
                error!(error = %e, "unserializable block batch");
                self.seal_failures.fetch_add(1, AtomicOrdering::Relaxed);
                return;
            }
        };
        let merkle_root = match self.kernel.merkle_root(&events_json) {
            Ok(root) => root,
            Err(e) => {
                error!(error = %e, "merkle root computation failed");
                self.seal_failures.fetch_add(1, AtomicOrdering::Relaxed);
                return;
            }
        };

        let (height, previous_hash) = {
            let tip = self.chain.lock().expect("chain tip lock poisoned");
            (tip.height + 1, tip.previous_hash.clone())
        };

        let mut block = json!({
            "index": height,
            "timestamp": unix_secs(),
            "previous_hash": previous_hash,
            "nonce": 0,
            "merkle_root": merkle_root,
            "events": batch,
        });
        let block_bytes = match serde_json::to_vec(&block) {
            Ok(b) => b,
            Err(e) => {
                error!(error = %e, "unserializable block document");
                self.seal_failures.fetch_add(1, AtomicOrdering::Relaxed);
                return;
            }
        };
        let hash = match self.kernel.block_hash(&block_bytes) {
            Ok(h) => h,
            Err(e) => {
                error!(error = %e, "block hash computation failed");
                self.seal_failures.fetch_add(1, AtomicOrdering::Relaxed);
                return;
            }
        };

        {
            let mut tip = self.chain.lock().expect("chain tip lock poisoned");
            tip.height = height;
            tip.previous_hash = hash.clone();
        }
        self.blocks_sealed.fetch_add(1, AtomicOrdering::Relaxed);
        info!(height, hash = %hash, events = batch.len(), "block sealed");

        if let Some(net) = &self.network {
            if net.is_running() {
                if let Some(obj) = block.as_object_mut() {
                    obj.insert("hash".to_string(), json!(hash));
                }
                match serde_json::to_vec(&block) {
                    Ok(bytes) => {
                        if let Err(e) = net.broadcast_block(&bytes).await {
                            warn!(error = %e, "block propagation failed");
                        }
                    }
                    Err(e) => warn!(error = %e, "block serialization failed"),
                }
            }
        }
    }

    /// Transactions and blocks learned from peers. Peer transactions join
    /// the same pipeline as client submissions, bypassing auth.
    fn handle_gossip(&self, event: GossipEvent) {
        match event {
            GossipEvent::Transaction(bytes) => {
                let mut tx: Transaction = match serde_json::from_slice(&bytes) {
                    Ok(tx) => tx,
                    Err(e) => {
                        debug!(error = %e, "undecodable gossip transaction");
                        return;
                    }
                };
                tx.metadata.insert("relayed".to_string(), FieldValue::Int(1));
                match self.mempool.add(tx) {
                    Ok(()) => {
                        self.gossip_txs.fetch_add(1, AtomicOrdering::Relaxed);
                    }
                    Err(MempoolError::AlreadyExists) => {
                        debug!("gossip transaction already known");
                    }
                    Err(e) => {
                        debug!(error = %e, "gossip transaction not admitted");
                    }
                }
            }
            GossipEvent::Block(bytes) => {
                self.gossip_blocks.fetch_add(1, AtomicOrdering::Relaxed);
                debug!(len = bytes.len(), "observed block from peer");
            }
        }
    }

    fn admit_record(
        &self,
        rec: &EventRecord,
        index: usize,
        batch_nonce: u64,
    ) -> Result<String, (String, &'static str, String)> {
        let entity = rec.entity_id.clone().unwrap_or_default();
        let event = rec.event.clone().unwrap_or_default();

        // Rows carry no id on this path; derive one from the content, the
        // row index and a per-batch nonce.
        let mut seed = Vec::new();
        seed.extend_from_slice(entity.as_bytes());
        seed.push(0);
        seed.extend_from_slice(event.as_bytes());
        seed.push(0);
        seed.extend_from_slice(&(index as u64).to_le_bytes());
        seed.extend_from_slice(&batch_nonce.to_le_bytes());
        let id = format!("tx-{}", &hex::encode(hash_bytes_sha256(&seed))[..16]);

        let mut tx = Transaction::new(id.clone(), entity, event);
        tx.payload = rec.data.clone().unwrap_or_default();
        if let Some(ts) = rec.timestamp {
            tx.timestamp_ms = (ts * 1000.0) as u64;
        }
        if let Some(details) = &rec.details {
            for (k, v) in details {
                if k == "priority" {
                    if let Ok(p) = v.parse::<i32>() {
                        tx.priority = p;
                        continue;
                    }
                }
                tx.metadata.insert(k.clone(), FieldValue::Str(v.clone()));
            }
        }

        match self.mempool.add(tx) {
            Ok(()) => {
                self.txs_admitted.fetch_add(1, AtomicOrdering::Relaxed);
                Ok(id)
            }
            Err(e) => {
                self.txs_rejected.fetch_add(1, AtomicOrdering::Relaxed);
                let code = match e {
                    MempoolError::AlreadyExists => "already_exists",
                    MempoolError::Full => "mempool_full",
                    MempoolError::InvalidTransaction(_) => "invalid_transaction",
                };
                Err((id, code, e.to_string()))
            }
        }
    }

    pub fn status(&self) -> EngineStatus {
        let (height, tip) = {
            let chain = self.chain.lock().expect("chain tip lock poisoned");
            (chain.height, chain.previous_hash.clone())
        };
        EngineStatus {
            version: env!("CARGO_PKG_VERSION"),
            uptime_seconds: unix_ms().saturating_sub(self.started_at_ms) / 1000,
            chain_height: height,
            chain_tip: tip,
            engine: EngineCounters {
                batches_received: self.batches_received.load(AtomicOrdering::Relaxed),
                txs_admitted: self.txs_admitted.load(AtomicOrdering::Relaxed),
                txs_rejected: self.txs_rejected.load(AtomicOrdering::Relaxed),
                blocks_sealed: self.blocks_sealed.load(AtomicOrdering::Relaxed),
                seal_failures: self.seal_failures.load(AtomicOrdering::Relaxed),
                gossip_txs: self.gossip_txs.load(AtomicOrdering::Relaxed),
                gossip_blocks: self.gossip_blocks.load(AtomicOrdering::Relaxed),
                ordering_overflow_drops: self
                    .ordering_overflow_drops
                    .load(AtomicOrdering::Relaxed),
            },
            mempool: self.mempool.stats(),
            ordering: self.ordering.stats(),
            ordering_pool: self.ordering.pool_stats(),
            network: self.network.as_ref().map(|n| n.status()),
        }
    }
}

impl BatchSink for Engine {
    /// Decode a request body (columnar wire batch, or a JSON array of event
    /// records as a fallback), admit each row into the mempool, and build
    /// the response: `OK` when everything was admitted, a structured batch
    /// result otherwise.
    fn process(&self, data: &[u8]) -> Result<Vec<u8>, String> {
        self.batches_received.fetch_add(1, AtomicOrdering::Relaxed);

        let batch = if data.first() == Some(&b'[') {
            codec::json_to_batch(data)
        } else {
            codec::decode_batch(data)
        }
        .map_err(|e| format!("error: {e}"))?;

        let records = codec::batch_to_records(&batch);
        let batch_nonce: u64 = rand::random();

        let mut processed: Vec<String> = Vec::with_capacity(records.len());
        let mut errors: Vec<serde_json::Value> = Vec::new();
        for (i, rec) in records.iter().enumerate() {
            match self.admit_record(rec, i, batch_nonce) {
                Ok(id) => processed.push(id),
                Err((id, code, message)) => errors.push(json!({
                    "tx_id": id,
                    "error_code": code,
                    "error_message": message,
                })),
            }
        }

        if errors.is_empty() {
            return Ok(b"OK".to_vec());
        }
        let result = json!({
            "success": false,
            "message": format!("Processed {}/{} transactions", processed.len(), records.len()),
            "processed_tx_ids": processed,
            "errors": errors,
        });
        serde_json::to_vec(&result).map_err(|e| format!("error: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthConfig;
    use crate::crypto::Sha256Kernel;

    fn engine() -> Arc<Engine> {
        let config = EngineConfig {
            auth: AuthConfig::disabled(),
            mempool_max: 100,
            block_size: 10,
            ..EngineConfig::default()
        };
        Engine::new(config, Arc::new(Sha256Kernel))
    }

    fn record_json(entity: &str, event: &str) -> String {
        format!(
            r#"{{"entity_id":"{entity}","event":"{event}","timestamp":{}}}"#,
            unix_secs()
        )
    }

    #[tokio::test]
    async fn sink_admits_json_records() {
        let engine = engine();
        let body = format!("[{},{}]", record_json("e1", "created"), record_json("e2", "updated"));

        let response = engine.process(body.as_bytes()).unwrap();
        assert_eq!(response, b"OK");
        assert_eq!(engine.mempool().size(), 2);
    }

    #[tokio::test]
    async fn sink_admits_columnar_batches() {
        let engine = engine();
        let records = vec![EventRecord {
            entity_id: Some("e1".into()),
            event: Some("created".into()),
            timestamp: Some(unix_secs()),
            details: Some(std::collections::BTreeMap::from([(
                "priority".to_string(),
                "7".to_string(),
            )])),
            data: Some(vec![9, 9]),
        }];
        let wire = codec::encode_batch(&codec::records_to_batch(&records).unwrap()).unwrap();

        let response = engine.process(&wire).unwrap();
        assert_eq!(response, b"OK");

        let admitted = engine.mempool().peek(1);
        assert_eq!(admitted.len(), 1);
        assert_eq!(admitted[0].priority, 7);
        assert_eq!(admitted[0].payload, vec![9, 9]);
    }

    #[tokio::test]
    async fn sink_reports_partial_failures() {
        let engine = engine();
        // Second record is missing its entity id.
        let body = format!(
            r#"[{},{{"event":"created","timestamp":{}}}]"#,
            record_json("e1", "created"),
            unix_secs()
        );

        let response = engine.process(body.as_bytes()).unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&response).unwrap();
        assert_eq!(parsed["success"], false);
        assert_eq!(parsed["processed_tx_ids"].as_array().unwrap().len(), 1);
        assert_eq!(parsed["errors"].as_array().unwrap().len(), 1);
        assert_eq!(parsed["errors"][0]["error_code"], "invalid_transaction");
    }

    #[tokio::test]
    async fn sink_rejects_undecodable_input() {
        let engine = engine();
        assert!(engine.process(b"").is_err());
        assert!(engine.process(b"garbage").is_err());
    }

    #[tokio::test]
    async fn derived_ids_differ_across_batches() {
        let engine = engine();
        let body = format!("[{}]", record_json("same", "same"));
        assert_eq!(engine.process(body.as_bytes()).unwrap(), b"OK");
        // Same content, new batch nonce: admitted again under a new id.
        assert_eq!(engine.process(body.as_bytes()).unwrap(), b"OK");
        assert_eq!(engine.mempool().size(), 2);
    }

    #[tokio::test]
    async fn status_aggregates_subsystems() {
        let engine = engine();
        let body = format!("[{}]", record_json("e1", "created"));
        engine.process(body.as_bytes()).unwrap();

        let status = engine.status();
        assert_eq!(status.engine.batches_received, 1);
        assert_eq!(status.engine.txs_admitted, 1);
        assert_eq!(status.mempool.size, 1);
        assert_eq!(status.chain_height, 0);
        assert_eq!(status.chain_tip.len(), 64);
        assert!(status.network.is_none());
    }
}
