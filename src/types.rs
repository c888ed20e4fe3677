// src/types.rs

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Milliseconds since the unix epoch.
pub fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Seconds since the unix epoch, as f64 (wire timestamps use this form).
pub fn unix_secs() -> f64 {
    unix_ms() as f64 / 1000.0
}

/// Typed metadata value. Replaces free-form dynamic values so validation
/// rules can match on the shape directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bytes(Vec<u8>),
}

impl FieldValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric view, tolerating both integer and float representations.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Int(i) => Some(*i as f64),
            FieldValue::Float(f) => Some(*f),
            _ => None,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Str(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Str(s)
    }
}

impl From<i64> for FieldValue {
    fn from(i: i64) -> Self {
        FieldValue::Int(i)
    }
}

impl From<f64> for FieldValue {
    fn from(f: f64) -> Self {
        FieldValue::Float(f)
    }
}

/// An admission unit: what clients submit and the mempool holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub entity_id: String,
    pub event_kind: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub payload: Vec<u8>,
    #[serde(default)]
    pub priority: i32,
    /// Admission timestamp in unix milliseconds; 0 means "not yet admitted".
    #[serde(default)]
    pub timestamp_ms: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, FieldValue>,
}

impl Transaction {
    pub fn new(
        id: impl Into<String>,
        entity_id: impl Into<String>,
        event_kind: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            entity_id: entity_id.into(),
            event_kind: event_kind.into(),
            payload: Vec::new(),
            priority: 0,
            timestamp_ms: 0,
            metadata: BTreeMap::new(),
        }
    }

    /// Required-field check applied at admission.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.is_empty() {
            return Err("transaction id is required".into());
        }
        if self.entity_id.is_empty() {
            return Err("entity id is required".into());
        }
        if self.event_kind.is_empty() {
            return Err("event kind is required".into());
        }
        Ok(())
    }
}

/// Pipeline status of an event inside the ordering service. Transitions are
/// monotonic along Pending -> Processing -> Certified -> Ordered; Rejected is
/// terminal from any non-Ordered state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Pending,
    Processing,
    Certified,
    Ordered,
    Rejected,
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventStatus::Pending => "pending",
            EventStatus::Processing => "processing",
            EventStatus::Certified => "certified",
            EventStatus::Ordered => "ordered",
            EventStatus::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

/// Immutable verdict produced by the certifier, one per pending event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Certification {
    pub event_id: String,
    pub valid: bool,
    pub errors: Vec<String>,
    pub certified_at_ms: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, FieldValue>,
}

/// A transaction travelling through the ordering pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingEvent {
    pub id: String,
    /// Flattened field map the certification rules evaluate against.
    pub data: BTreeMap<String, FieldValue>,
    pub entity_id: String,
    pub submitter: String,
    pub received_at_ms: u64,
    pub status: EventStatus,
    pub cert: Option<Certification>,
}

impl PendingEvent {
    /// Build a pipeline event from an admitted transaction, flattening the
    /// well-known fields into the rule-facing data map.
    pub fn from_transaction(tx: &Transaction, submitter: impl Into<String>) -> Self {
        let mut data: BTreeMap<String, FieldValue> = BTreeMap::new();
        data.insert("entity_id".into(), FieldValue::Str(tx.entity_id.clone()));
        data.insert("event".into(), FieldValue::Str(tx.event_kind.clone()));
        let ts = if tx.timestamp_ms > 0 {
            tx.timestamp_ms as f64 / 1000.0
        } else {
            unix_secs()
        };
        data.insert("timestamp".into(), FieldValue::Float(ts));
        if !tx.payload.is_empty() {
            data.insert("data".into(), FieldValue::Bytes(tx.payload.clone()));
        }
        for (k, v) in &tx.metadata {
            data.entry(k.clone()).or_insert_with(|| v.clone());
        }
        Self {
            id: tx.id.clone(),
            data,
            entity_id: tx.entity_id.clone(),
            submitter: submitter.into(),
            received_at_ms: 0,
            status: EventStatus::Pending,
            cert: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_validate_requires_fields() {
        let mut tx = Transaction::new("t1", "e1", "created");
        assert!(tx.validate().is_ok());

        tx.id.clear();
        assert!(tx.validate().is_err());

        let tx = Transaction::new("t2", "", "created");
        assert!(tx.validate().is_err());

        let tx = Transaction::new("t3", "e1", "");
        assert!(tx.validate().is_err());
    }

    #[test]
    fn pending_event_flattens_fields() {
        let mut tx = Transaction::new("t1", "acct-9", "transfer");
        tx.timestamp_ms = 5_000;
        tx.metadata.insert("region".into(), "eu".into());

        let ev = PendingEvent::from_transaction(&tx, "client-a");
        assert_eq!(ev.data.get("entity_id").and_then(|v| v.as_str()), Some("acct-9"));
        assert_eq!(ev.data.get("event").and_then(|v| v.as_str()), Some("transfer"));
        assert_eq!(ev.data.get("timestamp").and_then(|v| v.as_f64()), Some(5.0));
        assert_eq!(ev.data.get("region").and_then(|v| v.as_str()), Some("eu"));
        assert_eq!(ev.status, EventStatus::Pending);
    }

    #[test]
    fn field_value_numeric_views() {
        assert_eq!(FieldValue::Int(3).as_f64(), Some(3.0));
        assert_eq!(FieldValue::Float(2.5).as_f64(), Some(2.5));
        assert_eq!(FieldValue::Str("x".into()).as_f64(), None);
    }
}
