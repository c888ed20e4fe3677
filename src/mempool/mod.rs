// src/mempool/mod.rs
//
// Bounded, thread-safe priority queue of admitted transactions. A hash map
// gives O(1) lookup by id; a max-heap keyed by (priority desc, timestamp asc)
// drives extraction order. Writers take the exclusive lock, readers the
// shared one.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::RwLock;

use serde::Serialize;
use thiserror::Error;

use crate::types::{unix_ms, Transaction};

#[cfg(test)]
mod tests;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MempoolError {
    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),
    #[error("transaction already exists")]
    AlreadyExists,
    #[error("mempool is full")]
    Full,
}

/// Heap key. Higher priority first; equal priorities fall back to earlier
/// admission; the id keeps the order total so heap behavior is deterministic.
#[derive(Debug, Clone, PartialEq, Eq)]
struct TxKey {
    priority: i32,
    timestamp_ms: u64,
    id: String,
}

impl Ord for TxKey {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.timestamp_ms.cmp(&self.timestamp_ms))
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for TxKey {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

fn key_of(tx: &Transaction) -> TxKey {
    TxKey {
        priority: tx.priority,
        timestamp_ms: tx.timestamp_ms,
        id: tx.id.clone(),
    }
}

#[derive(Default)]
struct Inner {
    pending: HashMap<String, Transaction>,
    queue: BinaryHeap<TxKey>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MempoolStats {
    pub size: usize,
    pub max_size: usize,
    pub available: usize,
}

pub struct Mempool {
    inner: RwLock<Inner>,
    max_size: usize,
}

impl Mempool {
    pub fn new(max_size: usize) -> Self {
        Self { inner: RwLock::new(Inner::default()), max_size }
    }

    /// Admit a transaction. Rejects invalid shapes, duplicates and overflow;
    /// stamps the admission timestamp when the caller left it unset.
    pub fn add(&self, mut tx: Transaction) -> Result<(), MempoolError> {
        tx.validate().map_err(MempoolError::InvalidTransaction)?;

        let mut inner = self.inner.write().expect("mempool lock poisoned");
        if inner.pending.contains_key(&tx.id) {
            return Err(MempoolError::AlreadyExists);
        }
        if inner.pending.len() >= self.max_size {
            return Err(MempoolError::Full);
        }
        if tx.timestamp_ms == 0 {
            tx.timestamp_ms = unix_ms();
        }

        let key = key_of(&tx);
        inner.queue.push(key);
        inner.pending.insert(tx.id.clone(), tx);
        Ok(())
    }

    /// Remove and return up to `n` highest-priority transactions, in
    /// priority order.
    pub fn pop_batch(&self, n: usize) -> Vec<Transaction> {
        if n == 0 {
            return Vec::new();
        }
        let mut inner = self.inner.write().expect("mempool lock poisoned");
        let mut batch = Vec::with_capacity(n.min(inner.pending.len()));
        while batch.len() < n {
            let key = match inner.queue.pop() {
                Some(k) => k,
                None => break,
            };
            // Keys left behind by `remove` may be stale; skip them.
            if let Some(tx) = inner.pending.remove(&key.id) {
                batch.push(tx);
            }
        }
        batch
    }

    /// Return up to `n` highest-priority transactions without mutating the
    /// pool; operates on a copy of the heap.
    pub fn peek(&self, n: usize) -> Vec<Transaction> {
        if n == 0 {
            return Vec::new();
        }
        let inner = self.inner.read().expect("mempool lock poisoned");
        let mut copy = inner.queue.clone();
        let mut batch = Vec::with_capacity(n.min(inner.pending.len()));
        while batch.len() < n {
            let key = match copy.pop() {
                Some(k) => k,
                None => break,
            };
            if let Some(tx) = inner.pending.get(&key.id) {
                batch.push(tx.clone());
            }
        }
        batch
    }

    /// Remove a transaction by id. Rebuilds the heap — O(n), acceptable
    /// because removals only happen for already-failed submissions.
    pub fn remove(&self, id: &str) -> bool {
        let mut inner = self.inner.write().expect("mempool lock poisoned");
        if inner.pending.remove(id).is_none() {
            return false;
        }
        inner.queue = inner.pending.values().map(key_of).collect();
        true
    }

    pub fn get(&self, id: &str) -> Option<Transaction> {
        let inner = self.inner.read().expect("mempool lock poisoned");
        inner.pending.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        let inner = self.inner.read().expect("mempool lock poisoned");
        inner.pending.contains_key(id)
    }

    pub fn size(&self) -> usize {
        let inner = self.inner.read().expect("mempool lock poisoned");
        inner.pending.len()
    }

    pub fn is_full(&self) -> bool {
        self.size() >= self.max_size
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write().expect("mempool lock poisoned");
        inner.pending.clear();
        inner.queue.clear();
    }

    pub fn stats(&self) -> MempoolStats {
        let size = self.size();
        MempoolStats {
            size,
            max_size: self.max_size,
            available: self.max_size.saturating_sub(size),
        }
    }
}
