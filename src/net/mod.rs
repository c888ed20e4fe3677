// src/net/mod.rs
//
// Network service: wires the transport node, the peer registry/manager and
// the gossip propagator, and routes inbound traffic. Application-level
// events (transactions and blocks learned from peers) surface on a bounded
// channel the engine consumes.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tracing::{debug, info};

pub mod gossip;
pub mod node;
pub mod peers;

pub use gossip::{Propagator, PropagatorStats};
pub use node::{NetError, NetMessage, Node};
pub use peers::{Peer, PeerManager, PeerRegistry, STALE_TIMEOUT};

use crate::config::NetworkConfig;

/// Depth of the application event channel.
const EVENT_BUFFER: usize = 256;

/// A gossip payload the local stack should act on.
#[derive(Debug, Clone)]
pub enum GossipEvent {
    Transaction(Vec<u8>),
    Block(Vec<u8>),
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkStatus {
    pub node_id: String,
    pub address: String,
    pub is_running: bool,
    pub peer_count: usize,
    pub healthy_peers: usize,
    pub messages_routed: u64,
    pub propagator: PropagatorStats,
}

pub struct NetworkService {
    config: NetworkConfig,
    registry: Arc<PeerRegistry>,
    node: Arc<Node>,
    manager: Arc<PeerManager>,
    propagator: Arc<Propagator>,
    running: AtomicBool,
    messages_routed: AtomicU64,
    event_tx: mpsc::Sender<GossipEvent>,
    event_rx: std::sync::Mutex<Option<mpsc::Receiver<GossipEvent>>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    dispatch_handle: AsyncMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl NetworkService {
    /// Build the full stack. `config.bind` must be set; a service is only
    /// constructed when gossip is enabled.
    pub fn new(config: NetworkConfig) -> Arc<Self> {
        let bind = config.bind.clone().unwrap_or_else(|| "127.0.0.1:0".to_string());
        let registry = Arc::new(PeerRegistry::new());
        let node = Node::new(config.node_id.clone(), bind, registry.clone());
        let manager = Arc::new(PeerManager::new(node.clone(), registry.clone()));
        let propagator = Propagator::new(node.clone());
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Arc::new(Self {
            config,
            registry,
            node,
            manager,
            propagator,
            running: AtomicBool::new(false),
            messages_routed: AtomicU64::new(0),
            event_tx,
            event_rx: std::sync::Mutex::new(Some(event_rx)),
            shutdown_tx,
            shutdown_rx,
            dispatch_handle: AsyncMutex::new(None),
        })
    }

    pub async fn start(self: &Arc<Self>) -> Result<(), NetError> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.node.start().await?;
        self.manager.start().await;
        self.propagator.start().await;

        // dispatch loop: peer-exchange handling, dedup/forwarding, app events.
        // The message stream exists exactly once; a restarted service has
        // already consumed it and keeps running without dispatch.
        if let Some(mut messages) = self.node.take_messages() {
            let this = self.clone();
            let mut shutdown = self.shutdown_rx.clone();
            let handle = tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => return,
                        msg = messages.recv() => {
                            match msg {
                                Some(mut m) => this.dispatch(&mut m).await,
                                None => return,
                            }
                        }
                    }
                }
            });
            *self.dispatch_handle.lock().await = Some(handle);
        }

        if !self.config.seed_peers.is_empty() {
            self.manager.discover(&self.config.seed_peers).await;
        }
        self.manager.announce_self().await;

        info!(node = %self.node.node_id(), addr = %self.node.address(), "network service started");
        Ok(())
    }

    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.dispatch_handle.lock().await.take() {
            let _ = handle.await;
        }
        // Reverse of start order.
        self.propagator.stop().await;
        self.manager.stop().await;
        self.node.stop().await;
        info!(node = %self.node.node_id(), "network service stopped");
    }

    async fn dispatch(&self, msg: &mut NetMessage) {
        self.messages_routed.fetch_add(1, Ordering::Relaxed);

        // Peer exchange first: it works on the raw message and is cheap.
        self.manager.handle_message(msg).await;

        // Point-to-point messages are never flooded; undirected gossip goes
        // through dedup and hop-limited relay. A false return is a duplicate.
        let directed_to_us = msg.to.as_deref() == Some(self.node.node_id());
        if !directed_to_us && !self.propagator.handle_incoming(msg).await {
            return;
        }

        let action = msg
            .payload
            .get("action")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let data = msg
            .payload
            .get("data")
            .and_then(|v| v.as_str())
            .map(|s| s.as_bytes().to_vec());

        let event = match (action, data) {
            ("new_transaction", Some(bytes)) => Some(GossipEvent::Transaction(bytes)),
            ("new_block", Some(bytes)) => Some(GossipEvent::Block(bytes)),
            _ => None,
        };
        if let Some(ev) = event {
            if self.event_tx.try_send(ev).is_err() {
                debug!("gossip event channel full, dropping event");
            }
        }
    }

    /// Application event stream. Single consumer.
    pub fn take_events(&self) -> Option<mpsc::Receiver<GossipEvent>> {
        self.event_rx.lock().expect("event rx lock poisoned").take()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub fn propagator(&self) -> &Arc<Propagator> {
        &self.propagator
    }

    pub async fn broadcast_block(&self, block_data: &[u8]) -> Result<usize, NetError> {
        if !self.is_running() {
            return Err(NetError::NotRunning);
        }
        Ok(self.propagator.propagate_block(block_data).await)
    }

    pub async fn broadcast_transaction(&self, tx_data: &[u8]) -> Result<usize, NetError> {
        if !self.is_running() {
            return Err(NetError::NotRunning);
        }
        Ok(self.propagator.propagate_transaction(tx_data).await)
    }

    pub fn status(&self) -> NetworkStatus {
        NetworkStatus {
            node_id: self.node.node_id().to_string(),
            address: self.node.address(),
            is_running: self.is_running(),
            peer_count: self.registry.count(),
            healthy_peers: self.registry.healthy(STALE_TIMEOUT).len(),
            messages_routed: self.messages_routed.load(Ordering::Relaxed),
            propagator: self.propagator.stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkConfig;

    fn service() -> Arc<NetworkService> {
        NetworkService::new(NetworkConfig {
            node_id: "svc-test".to_string(),
            bind: Some("127.0.0.1:0".to_string()),
            seed_peers: Vec::new(),
        })
    }

    #[tokio::test]
    async fn broadcast_before_start_fails() {
        let svc = service();
        assert!(matches!(
            svc.broadcast_block(b"block").await,
            Err(NetError::NotRunning)
        ));
        assert!(matches!(
            svc.broadcast_transaction(b"tx").await,
            Err(NetError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn status_snapshot_reflects_state() {
        let svc = service();
        let status = svc.status();
        assert_eq!(status.node_id, "svc-test");
        assert!(!status.is_running);
        assert_eq!(status.peer_count, 0);

        svc.registry().register("p1", "127.0.0.1:7000", None);
        assert_eq!(svc.status().peer_count, 1);
        assert_eq!(svc.status().healthy_peers, 1);
    }

    #[tokio::test]
    async fn start_stop_cycle() {
        let svc = service();
        svc.start().await.unwrap();
        assert!(svc.is_running());
        // Idempotent start.
        svc.start().await.unwrap();
        svc.stop().await;
        assert!(!svc.is_running());
    }
}
