// src/ordering/certifier.rs
//
// Rule-based validation producing a certification verdict per event. The
// required-field check always runs before pluggable rules, and every rule
// runs even after a failure so the verdict carries the full error list.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use crate::types::{unix_ms, unix_secs, Certification, FieldValue, PendingEvent};

/// Fields every event must carry before any pluggable rule is consulted.
pub const REQUIRED_FIELDS: [&str; 3] = ["entity_id", "event", "timestamp"];

/// Events older or newer than this many seconds are rejected by the default
/// timestamp rule.
pub const MAX_TIMESTAMP_DRIFT_SECS: f64 = 86_400.0;

pub type ValidationRule =
    Box<dyn Fn(&BTreeMap<String, FieldValue>) -> Result<(), String> + Send + Sync>;

pub struct EventCertifier {
    rules: RwLock<Vec<ValidationRule>>,
    certs: RwLock<HashMap<String, Certification>>,
}

impl Default for EventCertifier {
    fn default() -> Self {
        Self::new()
    }
}

impl EventCertifier {
    pub fn new() -> Self {
        Self {
            rules: RwLock::new(Vec::new()),
            certs: RwLock::new(HashMap::new()),
        }
    }

    /// A certifier with the standard rule set installed.
    pub fn with_default_rules() -> Self {
        let certifier = Self::new();
        certifier.add_rule(timestamp_rule());
        certifier
    }

    pub fn add_rule(&self, rule: ValidationRule) {
        self.rules.write().expect("certifier lock poisoned").push(rule);
    }

    /// Evaluate all rules over the event's data, cache the verdict by event
    /// id and attach it to the event.
    pub fn validate(&self, event: &mut PendingEvent) -> Certification {
        let mut errors = Vec::new();

        for field in REQUIRED_FIELDS {
            if !event.data.contains_key(field) {
                errors.push(format!("missing required field: {field}"));
            }
        }

        {
            let rules = self.rules.read().expect("certifier lock poisoned");
            for rule in rules.iter() {
                if let Err(msg) = rule(&event.data) {
                    errors.push(msg);
                }
            }
        }

        let cert = Certification {
            event_id: event.id.clone(),
            valid: errors.is_empty(),
            errors,
            certified_at_ms: unix_ms(),
            metadata: BTreeMap::new(),
        };

        self.certs
            .write()
            .expect("certifier lock poisoned")
            .insert(event.id.clone(), cert.clone());
        event.cert = Some(cert.clone());
        cert
    }

    pub fn certification(&self, event_id: &str) -> Option<Certification> {
        self.certs
            .read()
            .expect("certifier lock poisoned")
            .get(event_id)
            .cloned()
    }
}

/// Default rule: the timestamp must parse as a number (integer or float) and
/// lie within 24 hours of now. Absence is left to the required-field check.
pub fn timestamp_rule() -> ValidationRule {
    Box::new(|data| {
        let value = match data.get("timestamp") {
            Some(v) => v,
            None => return Ok(()),
        };
        let ts = value
            .as_f64()
            .ok_or_else(|| "invalid timestamp type".to_string())?;
        let now = unix_secs();
        if (now - ts).abs() > MAX_TIMESTAMP_DRIFT_SECS {
            return Err("timestamp out of valid range".to_string());
        }
        Ok(())
    })
}
