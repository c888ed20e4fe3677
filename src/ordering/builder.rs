// src/ordering/builder.rs
//
// Size-or-time triggered batcher of certified events. Owned and mutated by
// the ordering event loop alone; no internal locking.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use crate::types::PendingEvent;

pub struct BlockBuilder {
    block_size: usize,
    batch_timeout: Duration,
    current: Vec<PendingEvent>,
    ids: HashSet<String>,
    started_at: Instant,
}

impl BlockBuilder {
    pub fn new(block_size: usize, batch_timeout: Duration) -> Self {
        Self {
            block_size: block_size.max(1),
            batch_timeout,
            current: Vec::with_capacity(block_size.max(1)),
            ids: HashSet::new(),
            started_at: Instant::now(),
        }
    }

    /// Append a certified event. Duplicate ids are ignored. Returns the
    /// finalized batch when the size or time condition is met.
    pub fn add(&mut self, event: PendingEvent) -> Option<Vec<PendingEvent>> {
        if self.ids.contains(&event.id) {
            return None;
        }
        if self.current.is_empty() {
            self.started_at = Instant::now();
        }
        self.ids.insert(event.id.clone());
        self.current.push(event);

        if self.current.len() >= self.block_size
            || self.started_at.elapsed() >= self.batch_timeout
        {
            return Some(self.finalize());
        }
        None
    }

    /// Finalize the batch if its timeout has elapsed. Used by the flush tick.
    pub fn flush_expired(&mut self) -> Option<Vec<PendingEvent>> {
        if self.current.is_empty() {
            return None;
        }
        if self.started_at.elapsed() >= self.batch_timeout {
            return Some(self.finalize());
        }
        None
    }

    /// Finalize unconditionally if the batch is non-empty.
    pub fn force_flush(&mut self) -> Option<Vec<PendingEvent>> {
        if self.current.is_empty() {
            return None;
        }
        Some(self.finalize())
    }

    pub fn batch_size(&self) -> usize {
        self.current.len()
    }

    fn finalize(&mut self) -> Vec<PendingEvent> {
        let batch = std::mem::replace(
            &mut self.current,
            Vec::with_capacity(self.block_size),
        );
        self.ids.clear();
        self.started_at = Instant::now();
        batch
    }
}
