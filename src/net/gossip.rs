// src/net/gossip.rs
//
// Epidemic dissemination: deduped, hop-limited flooding. Message identity is
// the hash of (type, sender, payload, timestamp); the seen-cache keeps
// first-seen times and is swept on an interval.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::json;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::debug;

use super::node::{NetMessage, Node};

pub const MAX_HOPS: u32 = 5;
pub const CACHE_EXPIRY: Duration = Duration::from_secs(5 * 60);
pub const CLEAN_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Serialize)]
pub struct PropagatorStats {
    pub max_hops: u32,
    pub cache_size: usize,
    pub is_running: bool,
}

pub struct Propagator {
    node: Arc<Node>,
    seen: std::sync::Mutex<HashMap<String, Instant>>,
    max_hops: u32,
    cache_expiry: Duration,
    clean_interval: Duration,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    handle: AsyncMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Propagator {
    pub fn new(node: Arc<Node>) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Arc::new(Self {
            node,
            seen: std::sync::Mutex::new(HashMap::new()),
            max_hops: MAX_HOPS,
            cache_expiry: CACHE_EXPIRY,
            clean_interval: CLEAN_INTERVAL,
            shutdown_tx,
            shutdown_rx,
            handle: AsyncMutex::new(None),
        })
    }

    pub async fn start(self: &Arc<Self>) {
        let this = self.clone();
        let mut shutdown = self.shutdown_rx.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.clean_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    _ = ticker.tick() => this.clean_cache(),
                }
            }
        });
        *self.handle.lock().await = Some(handle);
    }

    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.handle.lock().await.take() {
            let _ = handle.await;
        }
    }

    /// Originate a gossip message: wrap, mark seen, flood to all peers.
    pub async fn propagate(
        &self,
        msg_type: &str,
        payload: serde_json::Map<String, serde_json::Value>,
    ) -> usize {
        let msg = NetMessage::new(msg_type, self.node.node_id().to_string(), payload);
        self.mark_seen(&msg.identity_hash());
        self.node.broadcast_message(&msg, &[]).await
    }

    /// Wrap a completed block for dissemination.
    pub async fn propagate_block(&self, block_data: &[u8]) -> usize {
        let payload = serde_json::Map::from_iter([
            ("action".to_string(), json!("new_block")),
            ("data".to_string(), json!(String::from_utf8_lossy(block_data))),
        ]);
        self.propagate("block", payload).await
    }

    /// Wrap a transaction for dissemination.
    pub async fn propagate_transaction(&self, tx_data: &[u8]) -> usize {
        let payload = serde_json::Map::from_iter([
            ("action".to_string(), json!("new_transaction")),
            ("data".to_string(), json!(String::from_utf8_lossy(tx_data))),
        ]);
        self.propagate("transaction", payload).await
    }

    /// Decide what to do with an inbound message. Returns true when the
    /// local stack should process it, false for duplicates. At the hop limit
    /// the message is processed but not forwarded; otherwise it is relayed
    /// to every peer except the sender with the hop counter bumped.
    pub async fn handle_incoming(&self, msg: &mut NetMessage) -> bool {
        let hash = msg.identity_hash();
        if self.is_duplicate(&hash) {
            return false;
        }
        self.mark_seen(&hash);

        if msg.hops >= self.max_hops {
            debug!(hops = msg.hops, "hop limit reached, not forwarding");
            return true;
        }

        msg.hops += 1;
        let exclude = vec![msg.from.clone()];
        self.node.broadcast_message(msg, &exclude).await;
        true
    }

    pub fn is_duplicate(&self, hash: &str) -> bool {
        self.seen
            .lock()
            .expect("seen cache lock poisoned")
            .contains_key(hash)
    }

    fn mark_seen(&self, hash: &str) {
        self.seen
            .lock()
            .expect("seen cache lock poisoned")
            .insert(hash.to_string(), Instant::now());
    }

    fn clean_cache(&self) {
        let expiry = self.cache_expiry;
        self.seen
            .lock()
            .expect("seen cache lock poisoned")
            .retain(|_, first_seen| first_seen.elapsed() < expiry);
    }

    pub fn stats(&self) -> PropagatorStats {
        PropagatorStats {
            max_hops: self.max_hops,
            cache_size: self.seen.lock().expect("seen cache lock poisoned").len(),
            is_running: self.handle.try_lock().map(|h| h.is_some()).unwrap_or(true),
        }
    }

    #[cfg(test)]
    pub(crate) fn expire_all(&self) {
        self.seen.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::peers::PeerRegistry;

    fn propagator() -> Arc<Propagator> {
        // Node is never started: broadcasts deliver to zero peers, which is
        // exactly what the cache/hop logic tests need.
        let registry = Arc::new(PeerRegistry::new());
        let node = Node::new("node-a", "127.0.0.1:0", registry);
        Propagator::new(node)
    }

    fn incoming(hops: u32) -> NetMessage {
        let mut payload = serde_json::Map::new();
        payload.insert("action".into(), json!("new_transaction"));
        payload.insert("data".into(), json!("{}"));
        let mut msg = NetMessage::new("transaction", "peer-b", payload);
        msg.hops = hops;
        msg
    }

    #[tokio::test]
    async fn duplicate_handling_is_idempotent() {
        let prop = propagator();
        let mut msg = incoming(0);

        assert!(prop.handle_incoming(&mut msg).await);
        // Hop counter moved, but identity is hop-independent: same message.
        assert!(!prop.handle_incoming(&mut msg.clone()).await);
    }

    #[tokio::test]
    async fn hop_limit_processes_without_forwarding() {
        let prop = propagator();
        let mut at_limit = incoming(MAX_HOPS);
        assert!(prop.handle_incoming(&mut at_limit).await);
        // Not incremented past the limit.
        assert_eq!(at_limit.hops, MAX_HOPS);

        let mut below = incoming(MAX_HOPS - 1);
        // Different timestamp gives a different identity, so not a dup.
        below.timestamp_ms += 1;
        assert!(prop.handle_incoming(&mut below).await);
        assert_eq!(below.hops, MAX_HOPS);
    }

    #[tokio::test]
    async fn propagate_marks_own_messages_seen() {
        let prop = propagator();
        let mut payload = serde_json::Map::new();
        payload.insert("action".into(), json!("new_block"));
        prop.propagate("block", payload).await;
        assert_eq!(prop.stats().cache_size, 1);
    }

    #[tokio::test]
    async fn cache_expiry_allows_reprocessing() {
        let prop = propagator();
        let mut msg = incoming(0);
        assert!(prop.handle_incoming(&mut msg).await);
        assert!(!prop.handle_incoming(&mut msg.clone()).await);

        prop.expire_all();
        assert!(prop.handle_incoming(&mut msg).await);
    }

    #[tokio::test]
    async fn three_entry_lifecycle() {
        // Enters at 0, relays at 1; re-enters at the limit: processed but
        // held; third entry is a duplicate.
        let prop = propagator();

        let mut first = incoming(0);
        assert!(prop.handle_incoming(&mut first).await);
        assert_eq!(first.hops, 1);

        prop.expire_all();
        let mut second = incoming(MAX_HOPS);
        assert!(prop.handle_incoming(&mut second).await);

        let mut third = incoming(MAX_HOPS);
        assert!(!prop.handle_incoming(&mut third).await);
    }
}
