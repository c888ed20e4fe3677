// src/mempool/tests.rs

use super::*;
use crate::types::Transaction;

// -------------------------- tiny helpers --------------------------

fn tx(id: &str, priority: i32) -> Transaction {
    let mut t = Transaction::new(id, "entity-1", "created");
    t.priority = priority;
    t
}

fn tx_at(id: &str, priority: i32, ts: u64) -> Transaction {
    let mut t = tx(id, priority);
    t.timestamp_ms = ts;
    t
}

#[test]
fn add_then_contains() {
    let mp = Mempool::new(10);
    mp.add(tx("a", 1)).unwrap();
    assert!(mp.contains("a"));
    assert_eq!(mp.size(), 1);
    assert!(mp.get("a").is_some());
}

#[test]
fn add_stamps_timestamp_when_unset() {
    let mp = Mempool::new(10);
    mp.add(tx("a", 1)).unwrap();
    assert!(mp.get("a").unwrap().timestamp_ms > 0);

    mp.add(tx_at("b", 1, 12345)).unwrap();
    assert_eq!(mp.get("b").unwrap().timestamp_ms, 12345);
}

#[test]
fn duplicate_rejected_and_state_unchanged() {
    let mp = Mempool::new(10);
    mp.add(tx_at("a", 1, 100)).unwrap();
    assert_eq!(mp.add(tx_at("a", 9, 50)), Err(MempoolError::AlreadyExists));
    assert_eq!(mp.size(), 1);
    assert_eq!(mp.get("a").unwrap().priority, 1);
}

#[test]
fn invalid_transactions_rejected() {
    let mp = Mempool::new(10);
    let bad = Transaction::new("", "e", "k");
    assert!(matches!(mp.add(bad), Err(MempoolError::InvalidTransaction(_))));
    assert_eq!(mp.size(), 0);
}

#[test]
fn overflow_rejected() {
    let mp = Mempool::new(2);
    mp.add(tx("a", 1)).unwrap();
    mp.add(tx("b", 1)).unwrap();
    assert!(mp.is_full());
    assert_eq!(mp.add(tx("c", 1)), Err(MempoolError::Full));
    assert_eq!(mp.size(), 2);
}

#[test]
fn pop_batch_returns_priority_order() {
    // Capacity 3; ids a,b,c at priorities 1,3,2. pop_batch(2) -> [b, c].
    let mp = Mempool::new(3);
    mp.add(tx("a", 1)).unwrap();
    mp.add(tx("b", 3)).unwrap();
    mp.add(tx("c", 2)).unwrap();

    let batch = mp.pop_batch(2);
    let ids: Vec<&str> = batch.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(ids, vec!["b", "c"]);
    assert_eq!(mp.size(), 1);
    assert!(!mp.contains("b"));
    assert!(!mp.contains("c"));
    assert!(mp.contains("a"));
}

#[test]
fn equal_priority_breaks_ties_by_admission_time() {
    let mp = Mempool::new(10);
    mp.add(tx_at("late", 5, 2_000)).unwrap();
    mp.add(tx_at("early", 5, 1_000)).unwrap();
    mp.add(tx_at("mid", 5, 1_500)).unwrap();

    let batch = mp.pop_batch(3);
    let ids: Vec<&str> = batch.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(ids, vec!["early", "mid", "late"]);
}

#[test]
fn pop_batch_caps_at_available() {
    let mp = Mempool::new(10);
    mp.add(tx("a", 1)).unwrap();
    let batch = mp.pop_batch(5);
    assert_eq!(batch.len(), 1);
    assert!(mp.pop_batch(5).is_empty());
    assert!(mp.pop_batch(0).is_empty());
}

#[test]
fn peek_does_not_mutate() {
    let mp = Mempool::new(10);
    mp.add(tx("a", 1)).unwrap();
    mp.add(tx("b", 3)).unwrap();

    let peeked = mp.peek(2);
    let ids: Vec<&str> = peeked.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(ids, vec!["b", "a"]);
    assert_eq!(mp.size(), 2);
    assert!(mp.contains("a"));
    assert!(mp.contains("b"));

    // Peeking twice gives the same answer.
    let again = mp.peek(2);
    assert_eq!(again.len(), 2);
    assert_eq!(again[0].id, "b");
}

#[test]
fn remove_rebuilds_ordering() {
    let mp = Mempool::new(10);
    mp.add(tx("a", 1)).unwrap();
    mp.add(tx("b", 3)).unwrap();
    mp.add(tx("c", 2)).unwrap();

    assert!(mp.remove("b"));
    assert!(!mp.remove("b"));
    assert!(!mp.contains("b"));

    let batch = mp.pop_batch(3);
    let ids: Vec<&str> = batch.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(ids, vec!["c", "a"]);
}

#[test]
fn clear_wipes_everything() {
    let mp = Mempool::new(10);
    mp.add(tx("a", 1)).unwrap();
    mp.add(tx("b", 2)).unwrap();
    mp.clear();
    assert_eq!(mp.size(), 0);
    assert!(mp.pop_batch(10).is_empty());
    // The pool is usable again after clear.
    mp.add(tx("a", 1)).unwrap();
    assert_eq!(mp.size(), 1);
}

#[test]
fn stats_reflect_occupancy() {
    let mp = Mempool::new(5);
    mp.add(tx("a", 1)).unwrap();
    mp.add(tx("b", 1)).unwrap();

    let stats = mp.stats();
    assert_eq!(stats.size, 2);
    assert_eq!(stats.max_size, 5);
    assert_eq!(stats.available, 3);
}

#[test]
fn capacity_bound_holds_under_churn() {
    let cap = 8;
    let mp = Mempool::new(cap);
    for round in 0..5 {
        for i in 0..cap + 4 {
            let _ = mp.add(tx(&format!("r{round}-t{i}"), i as i32));
        }
        assert!(mp.size() <= cap);
        mp.pop_batch(3);
    }
}
