//! Outbound telemetry document.
//!
//! A [`TelemetrySnapshot`] is built fresh for every exchange cycle and
//! dropped at the end of it.  Peripherals never touch the snapshot
//! directly: they receive a [`StateCollector`] bound to their own key.
//!
//! ```json
//! {
//!   "batteryMonitor": { "type": "BatteryMonitor", "voltage": 12.61, ... },
//!   "dataExchanger":  { "type": "DataExchanger", "trigger": "scheduled", ... },
//!   "ack": "42"
//! }
//! ```

use std::collections::BTreeMap;

use serde_json::{Map, Value};

/// Top-level key carrying a pending delivery acknowledgment.
pub const ACK_KEY: &str = "ack";

/// Key of the type discriminator inside every subtree.
pub const TYPE_KEY: &str = "type";

#[derive(Debug, Default)]
pub struct TelemetrySnapshot {
    sections: BTreeMap<String, Map<String, Value>>,
    ack: Option<String>,
}

impl TelemetrySnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collector scoped to `name`'s subtree, created on first use.
    pub fn collector(&mut self, name: &str) -> StateCollector<'_> {
        let fields = self.sections.entry(name.to_owned()).or_default();
        StateCollector { fields }
    }

    pub fn set_ack(&mut self, ack_id: &str) {
        self.ack = Some(ack_id.to_owned());
    }

    pub fn contains(&self, name: &str) -> bool {
        self.sections.contains_key(name)
    }

    pub fn section(&self, name: &str) -> Option<&Map<String, Value>> {
        self.sections.get(name)
    }

    /// Assemble the document as a JSON value.
    pub fn to_value(&self) -> Value {
        let mut root = Map::new();
        for (name, fields) in &self.sections {
            root.insert(name.clone(), Value::Object(fields.clone()));
        }
        if let Some(ack) = &self.ack {
            root.insert(ACK_KEY.to_owned(), Value::String(ack.clone()));
        }
        Value::Object(root)
    }

    /// Serialize the document for transmission.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.to_value())
    }
}

/// Write handle onto one peripheral's subtree.
pub struct StateCollector<'a> {
    fields: &'a mut Map<String, Value>,
}

impl StateCollector<'_> {
    /// Set the subtree's type discriminator.
    pub fn type_tag(&mut self, type_name: &str) {
        self.record(TYPE_KEY, type_name);
    }

    /// Set one field, replacing any earlier value under `key`.
    pub fn record(&mut self, key: &str, value: impl Into<Value>) {
        self.fields.insert(key.to_owned(), value.into());
    }

    /// Record a float rounded to `decimals` places; non-finite values become `null`.
    pub fn record_rounded(&mut self, key: &str, value: f32, decimals: i32) {
        self.record(key, rounded(value, decimals));
    }
}

/// Round for display.  Goes through `f64` so `12.34` serializes as `12.34`.
pub fn rounded(value: f32, decimals: i32) -> Value {
    if !value.is_finite() {
        return Value::Null;
    }
    let scale = 10f64.powi(decimals);
    let v = (f64::from(value) * scale).round() / scale;
    serde_json::Number::from_f64(v).map_or(Value::Null, Value::Number)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn collectors_write_only_their_own_subtree() {
        let mut snap = TelemetrySnapshot::new();
        snap.collector("a").record("x", 1);
        snap.collector("b").record("x", 2);

        let doc = snap.to_value();
        assert_eq!(doc["a"], json!({ "x": 1 }));
        assert_eq!(doc["b"], json!({ "x": 2 }));
    }

    #[test]
    fn ack_appears_only_when_set() {
        let mut snap = TelemetrySnapshot::new();
        snap.collector("a").type_tag("Thing");
        assert!(snap.to_value().get(ACK_KEY).is_none());

        snap.set_ack("17");
        assert_eq!(snap.to_value()[ACK_KEY], json!("17"));
    }

    #[test]
    fn rounding_keeps_two_decimals() {
        assert_eq!(rounded(12.3456, 2), json!(12.35));
        assert_eq!(rounded(f32::NAN, 2), Value::Null);
    }

    #[test]
    fn empty_snapshot_serializes_to_empty_object() {
        let snap = TelemetrySnapshot::new();
        assert_eq!(snap.to_bytes().unwrap(), b"{}");
    }
}
