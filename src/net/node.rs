// src/net/node.rs
//
// Connection-oriented transport node. Frames from `framing` carry
// JSON-encoded `NetMessage`s; one writer task per peer owns the outbound
// socket, and the accept loop feeds a bounded intake channel. Inbound
// messages pass nonce replay protection before anything else sees them.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

use crate::framing::{read_frame, write_frame};
use crate::types::unix_ms;

use super::peers::PeerRegistry;

/// Depth of the inbound message channel. When full, messages are dropped:
/// the layer is best-effort and the propagator's redundancy covers losses.
pub const RECEIVE_BUFFER: usize = 1000;

/// Replay window: a nonce is remembered this long, and messages older than
/// this are rejected outright.
pub const REPLAY_TOLERANCE: Duration = Duration::from_secs(60);

const REPLAY_CLEAN_INTERVAL: Duration = Duration::from_secs(30);

/// Per-peer outbound queue depth.
const OUTBOUND_BUFFER: usize = 64;

#[derive(Debug, Error)]
pub enum NetError {
    #[error("node is not running")]
    NotRunning,
    #[error("peer not found: {0}")]
    PeerNotFound(String),
    #[error("failed to send message: {0}")]
    SendFailed(String),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Wire message exchanged between nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetMessage {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    pub payload: serde_json::Map<String, serde_json::Value>,
    pub timestamp_ms: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub nonce: String,
    #[serde(default)]
    pub hops: u32,
}

impl NetMessage {
    pub fn new(
        msg_type: impl Into<String>,
        from: impl Into<String>,
        payload: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        Self {
            msg_type: msg_type.into(),
            from: from.into(),
            to: None,
            payload,
            timestamp_ms: unix_ms(),
            nonce: String::new(),
            hops: 0,
        }
    }

    /// Identity for deduplication: hash of (type, sender, payload, creation
    /// timestamp). serde_json maps serialize key-sorted, so this is stable.
    pub fn identity_hash(&self) -> String {
        let identity = serde_json::json!({
            "type": self.msg_type,
            "from": self.from,
            "payload": self.payload,
            "timestamp_ms": self.timestamp_ms,
        });
        let bytes = serde_json::to_vec(&identity).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        hex::encode(hasher.finalize())
    }
}

fn new_nonce(node_id: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("{nanos}-{node_id}")
}

pub struct Node {
    node_id: String,
    bind: String,
    registry: Arc<PeerRegistry>,
    running: AtomicBool,
    outbound: AsyncMutex<HashMap<String, mpsc::Sender<Vec<u8>>>>,
    msg_tx: mpsc::Sender<NetMessage>,
    msg_rx: std::sync::Mutex<Option<mpsc::Receiver<NetMessage>>>,
    replay: std::sync::Mutex<HashMap<String, u64>>,
    replay_tolerance: Duration,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    tasks: AsyncMutex<Vec<tokio::task::JoinHandle<()>>>,
    local_addr: std::sync::Mutex<Option<SocketAddr>>,
}

impl Node {
    pub fn new(node_id: impl Into<String>, bind: impl Into<String>, registry: Arc<PeerRegistry>) -> Arc<Self> {
        let (msg_tx, msg_rx) = mpsc::channel(RECEIVE_BUFFER);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Arc::new(Self {
            node_id: node_id.into(),
            bind: bind.into(),
            registry,
            running: AtomicBool::new(false),
            outbound: AsyncMutex::new(HashMap::new()),
            msg_tx,
            msg_rx: std::sync::Mutex::new(Some(msg_rx)),
            replay: std::sync::Mutex::new(HashMap::new()),
            replay_tolerance: REPLAY_TOLERANCE,
            shutdown_tx,
            shutdown_rx,
            tasks: AsyncMutex::new(Vec::new()),
            local_addr: std::sync::Mutex::new(None),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Advertised address: the configured bind, or the actual socket address
    /// once the listener is up (relevant when binding port 0).
    pub fn address(&self) -> String {
        self.local_addr
            .lock()
            .expect("local addr lock poisoned")
            .map(|a| a.to_string())
            .unwrap_or_else(|| self.bind.clone())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub async fn start(self: &Arc<Self>) -> Result<(), NetError> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let listener = TcpListener::bind(&self.bind).await.map_err(|e| NetError::Bind {
            addr: self.bind.clone(),
            source: e,
        })?;
        if let Ok(addr) = listener.local_addr() {
            *self.local_addr.lock().expect("local addr lock poisoned") = Some(addr);
        }
        info!(node = %self.node_id, addr = %self.address(), "gossip node listening");

        let mut tasks = self.tasks.lock().await;

        // accept loop
        {
            let node = self.clone();
            let mut shutdown = self.shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => return,
                        accepted = listener.accept() => {
                            match accepted {
                                Ok((stream, addr)) => {
                                    debug!(node = %node.node_id, peer_addr = %addr, "inbound connection");
                                    node.spawn_reader(stream);
                                }
                                Err(e) => {
                                    warn!(error = %e, "accept failed");
                                }
                            }
                        }
                    }
                }
            }));
        }

        // replay cache cleaner
        {
            let node = self.clone();
            let mut shutdown = self.shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(REPLAY_CLEAN_INTERVAL);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => return,
                        _ = ticker.tick() => node.clean_replay_cache(),
                    }
                }
            }));
        }

        Ok(())
    }

    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let _ = self.shutdown_tx.send(true);
        self.outbound.lock().await.clear();
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            let _ = task.await;
        }
    }

    fn spawn_reader(self: &Arc<Self>, mut stream: TcpStream) {
        let node = self.clone();
        let mut shutdown = self.shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = shutdown.changed() => return,
                    frame = read_frame(&mut stream) => frame,
                };
                let data = match frame {
                    Ok(d) => d,
                    Err(_) => return,
                };
                let msg: NetMessage = match serde_json::from_slice(&data) {
                    Ok(m) => m,
                    Err(e) => {
                        debug!(error = %e, "dropping undecodable message");
                        continue;
                    }
                };
                if !node.is_fresh(&msg) {
                    debug!(from = %msg.from, "dropping replayed or stale message");
                    continue;
                }
                node.registry.touch(&msg.from);
                // Best-effort intake: drop on backpressure.
                if node.msg_tx.try_send(msg).is_err() {
                    debug!("inbound channel full, dropping message");
                }
            }
        });
    }

    /// Replay protection. Messages without a nonce skip the check; a nonce
    /// seen within the tolerance window, or a timestamp older than the
    /// window, rejects the message.
    fn is_fresh(&self, msg: &NetMessage) -> bool {
        if msg.nonce.is_empty() {
            return true;
        }
        let now = unix_ms();
        let mut cache = self.replay.lock().expect("replay cache lock poisoned");
        if cache.contains_key(&msg.nonce) {
            return false;
        }
        if now.saturating_sub(msg.timestamp_ms) > self.replay_tolerance.as_millis() as u64 {
            return false;
        }
        cache.insert(msg.nonce.clone(), now);
        true
    }

    fn clean_replay_cache(&self) {
        let cutoff = unix_ms().saturating_sub(self.replay_tolerance.as_millis() as u64);
        let mut cache = self.replay.lock().expect("replay cache lock poisoned");
        cache.retain(|_, recorded| *recorded > cutoff);
    }

    /// Inbound message stream. Single consumer.
    pub fn take_messages(&self) -> Option<mpsc::Receiver<NetMessage>> {
        self.msg_rx.lock().expect("message rx lock poisoned").take()
    }

    /// Send a payload directly to one peer, wrapped in a nonce-carrying
    /// message.
    pub async fn send_direct(
        &self,
        peer_id: &str,
        payload: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), NetError> {
        let mut msg = NetMessage::new("direct", self.node_id.clone(), payload);
        msg.to = Some(peer_id.to_string());
        msg.nonce = new_nonce(&self.node_id);
        self.send_message(peer_id, &msg).await
    }

    /// Send a pre-built message verbatim (the propagator's relay path).
    pub async fn send_message(&self, peer_id: &str, msg: &NetMessage) -> Result<(), NetError> {
        if !self.is_running() {
            return Err(NetError::NotRunning);
        }
        let peer = self
            .registry
            .get(peer_id)
            .ok_or_else(|| NetError::PeerNotFound(peer_id.to_string()))?;
        let bytes = serde_json::to_vec(msg)
            .map_err(|e| NetError::SendFailed(e.to_string()))?;
        self.deliver(peer_id, &peer.address, bytes).await
    }

    /// Broadcast a payload to every known peer (each peer gets its own
    /// nonce-wrapped copy). Send failures are logged and skipped.
    pub async fn broadcast(
        &self,
        payload: serde_json::Map<String, serde_json::Value>,
        exclude: &[String],
    ) -> usize {
        let mut delivered = 0;
        for peer in self.registry.get_peers() {
            if peer.id == self.node_id || exclude.contains(&peer.id) {
                continue;
            }
            match self.send_direct(&peer.id, payload.clone()).await {
                Ok(()) => delivered += 1,
                Err(e) => debug!(peer = %peer.id, error = %e, "broadcast send failed"),
            }
        }
        delivered
    }

    /// Broadcast one message verbatim, preserving nonce/hops.
    pub async fn broadcast_message(&self, msg: &NetMessage, exclude: &[String]) -> usize {
        if !self.is_running() {
            return 0;
        }
        let bytes = match serde_json::to_vec(msg) {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "unencodable broadcast message");
                return 0;
            }
        };
        let mut delivered = 0;
        for peer in self.registry.get_peers() {
            if peer.id == self.node_id || exclude.contains(&peer.id) {
                continue;
            }
            match self.deliver(&peer.id, &peer.address, bytes.clone()).await {
                Ok(()) => delivered += 1,
                Err(e) => debug!(peer = %peer.id, error = %e, "relay send failed"),
            }
        }
        delivered
    }

    /// Close the outbound channel to a peer (its writer task winds down).
    pub async fn disconnect(&self, peer_id: &str) {
        self.outbound.lock().await.remove(peer_id);
    }

    /// Hand bytes to the peer's writer task, connecting lazily. One
    /// reconnect attempt when a cached writer turns out to be dead.
    async fn deliver(&self, peer_id: &str, address: &str, bytes: Vec<u8>) -> Result<(), NetError> {
        let cached = { self.outbound.lock().await.get(peer_id).cloned() };
        if let Some(tx) = cached {
            match tx.send(bytes.clone()).await {
                Ok(()) => return Ok(()),
                Err(_) => {
                    self.outbound.lock().await.remove(peer_id);
                }
            }
        }

        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| NetError::SendFailed(format!("connect {address}: {e}")))?;
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(OUTBOUND_BUFFER);

        let peer_label = peer_id.to_string();
        tokio::spawn(async move {
            let mut stream = stream;
            while let Some(frame) = rx.recv().await {
                if let Err(e) = write_frame(&mut stream, &frame).await {
                    debug!(peer = %peer_label, error = %e, "outbound write failed");
                    return;
                }
            }
        });

        self.outbound.lock().await.insert(peer_id.to_string(), tx.clone());
        tx.send(bytes)
            .await
            .map_err(|_| NetError::SendFailed(format!("writer for {peer_id} gone")))
    }

    #[cfg(test)]
    pub(crate) fn replay_len(&self) -> usize {
        self.replay.lock().unwrap().len()
    }

    #[cfg(test)]
    pub(crate) fn force_clean_replay(&self) {
        self.clean_replay_cache();
    }

    #[cfg(test)]
    pub(crate) fn backdate_nonce(&self, nonce: &str, age: Duration) {
        let mut cache = self.replay.lock().unwrap();
        if let Some(ts) = cache.get_mut(nonce) {
            *ts = unix_ms().saturating_sub(age.as_millis() as u64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(nonce: &str) -> NetMessage {
        let mut msg = NetMessage::new("direct", "peer-a", serde_json::Map::new());
        msg.nonce = nonce.to_string();
        msg
    }

    fn test_node() -> Arc<Node> {
        Node::new("node-test", "127.0.0.1:0", Arc::new(PeerRegistry::new()))
    }

    #[test]
    fn identity_hash_ignores_nonce_and_hops() {
        let mut a = message("n1");
        let mut b = a.clone();
        b.nonce = "different".to_string();
        b.hops = 4;
        assert_eq!(a.identity_hash(), b.identity_hash());

        a.payload.insert("k".into(), serde_json::json!("v"));
        assert_ne!(a.identity_hash(), b.identity_hash());
    }

    #[test]
    fn replay_same_nonce_rejected() {
        let node = test_node();
        let msg = message("nonce-1");
        assert!(node.is_fresh(&msg));
        assert!(!node.is_fresh(&msg));
    }

    #[test]
    fn stale_timestamp_rejected() {
        let node = test_node();
        let mut msg = message("nonce-2");
        msg.timestamp_ms = unix_ms() - 2 * REPLAY_TOLERANCE.as_millis() as u64;
        assert!(!node.is_fresh(&msg));
    }

    #[test]
    fn nonceless_messages_skip_replay_check() {
        let node = test_node();
        let msg = NetMessage::new("direct", "peer-a", serde_json::Map::new());
        assert!(node.is_fresh(&msg));
        assert!(node.is_fresh(&msg));
        assert_eq!(node.replay_len(), 0);
    }

    #[test]
    fn cleaner_expires_old_nonces_allowing_reuse() {
        let node = test_node();
        let msg = message("nonce-3");
        assert!(node.is_fresh(&msg));
        node.backdate_nonce("nonce-3", REPLAY_TOLERANCE * 2);
        node.force_clean_replay();
        assert_eq!(node.replay_len(), 0);

        // A fresh timestamp with the cleaned nonce is accepted again.
        let again = message("nonce-3");
        assert!(node.is_fresh(&again));
    }
}
