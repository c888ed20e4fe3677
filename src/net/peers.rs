// src/net/peers.rs
//
// Known-peer state and the peer-exchange protocol. The registry is the one
// shared source of truth for peers; the node, the propagator and the
// manager all read it. Reads hand out deep copies.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::{debug, warn};

use crate::types::unix_ms;

use super::node::{NetMessage, Node};

pub const PRUNE_INTERVAL: Duration = Duration::from_secs(30);
pub const STALE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peer {
    pub id: String,
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<Vec<u8>>,
    pub last_seen: u64,
}

#[derive(Default)]
pub struct PeerRegistry {
    peers: RwLock<HashMap<String, Peer>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a peer, or refresh `last_seen` if the id is already known. An
    /// existing peer's key material is never overwritten by a re-announce.
    pub fn register(&self, id: &str, address: &str, public_key: Option<Vec<u8>>) {
        let mut peers = self.peers.write().expect("peer registry lock poisoned");
        match peers.get_mut(id) {
            Some(existing) => {
                existing.last_seen = existing.last_seen.max(unix_ms());
            }
            None => {
                peers.insert(
                    id.to_string(),
                    Peer {
                        id: id.to_string(),
                        address: address.to_string(),
                        public_key,
                        last_seen: unix_ms(),
                    },
                );
            }
        }
    }

    pub fn unregister(&self, id: &str) -> bool {
        self.peers
            .write()
            .expect("peer registry lock poisoned")
            .remove(id)
            .is_some()
    }

    /// Move a peer's `last_seen` forward. Never moves it backwards.
    pub fn touch(&self, id: &str) {
        let mut peers = self.peers.write().expect("peer registry lock poisoned");
        if let Some(peer) = peers.get_mut(id) {
            peer.last_seen = peer.last_seen.max(unix_ms());
        }
    }

    pub fn get(&self, id: &str) -> Option<Peer> {
        self.peers
            .read()
            .expect("peer registry lock poisoned")
            .get(id)
            .cloned()
    }

    /// Deep copy of all known peers.
    pub fn get_peers(&self) -> Vec<Peer> {
        self.peers
            .read()
            .expect("peer registry lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Peers seen within the staleness window.
    pub fn healthy(&self, stale_timeout: Duration) -> Vec<Peer> {
        let cutoff = unix_ms().saturating_sub(stale_timeout.as_millis() as u64);
        self.peers
            .read()
            .expect("peer registry lock poisoned")
            .values()
            .filter(|p| p.last_seen > cutoff)
            .cloned()
            .collect()
    }

    /// Remove peers not seen within the window; returns the removed ids.
    pub fn prune(&self, stale_timeout: Duration) -> Vec<String> {
        let cutoff = unix_ms().saturating_sub(stale_timeout.as_millis() as u64);
        let mut peers = self.peers.write().expect("peer registry lock poisoned");
        let stale: Vec<String> = peers
            .values()
            .filter(|p| p.last_seen <= cutoff)
            .map(|p| p.id.clone())
            .collect();
        for id in &stale {
            peers.remove(id);
        }
        stale
    }

    pub fn count(&self) -> usize {
        self.peers.read().expect("peer registry lock poisoned").len()
    }
}

/// Peer discovery and liveness: seeds, peer exchange, announcements and the
/// stale-peer pruning loop.
pub struct PeerManager {
    node: Arc<Node>,
    registry: Arc<PeerRegistry>,
    prune_interval: Duration,
    stale_timeout: Duration,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    handle: AsyncMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl PeerManager {
    pub fn new(node: Arc<Node>, registry: Arc<PeerRegistry>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            node,
            registry,
            prune_interval: PRUNE_INTERVAL,
            stale_timeout: STALE_TIMEOUT,
            shutdown_tx,
            shutdown_rx,
            handle: AsyncMutex::new(None),
        }
    }

    pub async fn start(&self) {
        let node = self.node.clone();
        let registry = self.registry.clone();
        let interval = self.prune_interval;
        let stale = self.stale_timeout;
        let mut shutdown = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick is immediate; skip it
            loop {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    _ = ticker.tick() => {
                        for id in registry.prune(stale) {
                            debug!(peer = %id, "pruned stale peer");
                            node.disconnect(&id).await;
                        }
                    }
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

    /// Bootstrap from seed addresses: each seed is registered keyed by its
    /// address and asked for its peer list.
    pub async fn discover(&self, seeds: &[String]) {
        for addr in seeds {
            self.registry.register(addr, addr, None);
            let payload = serde_json::Map::from_iter([(
                "action".to_string(),
                json!("peer_exchange_request"),
            )]);
            if let Err(e) = self.node.send_direct(addr, payload).await {
                warn!(seed = %addr, error = %e, "seed peer exchange failed");
            }
        }
    }

    /// Broadcast our own id and address to everyone we know.
    pub async fn announce_self(&self) {
        let payload = serde_json::Map::from_iter([
            ("action".to_string(), json!("peer_announce")),
            ("peer_id".to_string(), json!(self.node.node_id())),
            ("address".to_string(), json!(self.node.address())),
        ]);
        self.node.broadcast(payload, &[]).await;
    }

    /// Handle a peer-exchange message. Non-exchange messages are ignored.
    pub async fn handle_message(&self, msg: &NetMessage) {
        let action = msg
            .payload
            .get("action")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        match action {
            "peer_exchange_request" => self.handle_exchange_request(msg).await,
            "peer_exchange_response" => self.handle_exchange_response(msg),
            "peer_announce" => self.handle_announce(msg),
            _ => {}
        }
    }

    async fn handle_exchange_request(&self, msg: &NetMessage) {
        let peers: Vec<serde_json::Value> = self
            .registry
            .get_peers()
            .into_iter()
            .map(|p| {
                json!({
                    "id": p.id,
                    "address": p.address,
                    "last_seen": p.last_seen as i64,
                })
            })
            .collect();

        let payload = serde_json::Map::from_iter([
            ("action".to_string(), json!("peer_exchange_response")),
            ("peers".to_string(), json!(peers)),
        ]);
        if let Err(e) = self.node.send_direct(&msg.from, payload).await {
            debug!(peer = %msg.from, error = %e, "peer exchange response failed");
        }
    }

    fn handle_exchange_response(&self, msg: &NetMessage) {
        let peers = match msg.payload.get("peers").and_then(|v| v.as_array()) {
            Some(list) => list,
            None => return,
        };
        for entry in peers {
            let id = entry.get("id").and_then(|v| v.as_str()).unwrap_or_default();
            let address = entry
                .get("address")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            if id.is_empty() || address.is_empty() {
                continue;
            }
            if id == self.node.node_id() {
                continue;
            }
            self.registry.register(id, address, None);
        }
    }

    fn handle_announce(&self, msg: &NetMessage) {
        let id = msg
            .payload
            .get("peer_id")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let address = msg
            .payload
            .get("address")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        if id.is_empty() || address.is_empty() {
            return;
        }
        // register refreshes last_seen when the peer is already known.
        self.registry.register(id, address, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_deep_copy() {
        let reg = PeerRegistry::new();
        reg.register("p1", "127.0.0.1:7001", None);
        reg.register("p2", "127.0.0.1:7002", Some(vec![1, 2]));

        let mut peers = reg.get_peers();
        assert_eq!(peers.len(), 2);
        // Mutating the copy must not touch the registry.
        peers[0].address = "mutated".to_string();
        assert!(reg
            .get_peers()
            .iter()
            .all(|p| p.address.starts_with("127.0.0.1")));
    }

    #[test]
    fn reregister_refreshes_without_overwriting() {
        let reg = PeerRegistry::new();
        reg.register("p1", "127.0.0.1:7001", Some(vec![9]));
        let before = reg.get("p1").unwrap();

        reg.register("p1", "10.0.0.1:9999", None);
        let after = reg.get("p1").unwrap();
        assert_eq!(after.address, "127.0.0.1:7001");
        assert_eq!(after.public_key, Some(vec![9]));
        assert!(after.last_seen >= before.last_seen);
    }

    #[test]
    fn unregister_and_count() {
        let reg = PeerRegistry::new();
        reg.register("p1", "a", None);
        assert_eq!(reg.count(), 1);
        assert!(reg.unregister("p1"));
        assert!(!reg.unregister("p1"));
        assert_eq!(reg.count(), 0);
    }

    #[test]
    fn healthy_and_prune_respect_cutoff() {
        let reg = PeerRegistry::new();
        reg.register("fresh", "a", None);
        reg.register("stale", "b", None);
        {
            let mut peers = reg.peers.write().unwrap();
            peers.get_mut("stale").unwrap().last_seen = unix_ms() - 10 * 60 * 1000;
        }

        let healthy = reg.healthy(STALE_TIMEOUT);
        assert_eq!(healthy.len(), 1);
        assert_eq!(healthy[0].id, "fresh");

        let removed = reg.prune(STALE_TIMEOUT);
        assert_eq!(removed, vec!["stale".to_string()]);
        assert_eq!(reg.count(), 1);
    }

    #[test]
    fn touch_only_moves_forward() {
        let reg = PeerRegistry::new();
        reg.register("p1", "a", None);
        let before = reg.get("p1").unwrap().last_seen;
        reg.touch("p1");
        assert!(reg.get("p1").unwrap().last_seen >= before);
        // Touching an unknown peer is a no-op.
        reg.touch("ghost");
        assert_eq!(reg.count(), 1);
    }
}
