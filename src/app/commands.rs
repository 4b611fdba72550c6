//! Inbound command documents.
//!
//! The controller answers an exchange (HTTP response body or a message on
//! the node's command topic) with a JSON object keyed by peripheral name:
//!
//! ```json
//! { "ackId": 42, "lightInside": { "setState": true }, "dataExchanger": { "setInterval": "30000" } }
//! ```
//!
//! [`CommandEnvelope::parse`] either accepts the whole document or rejects
//! it; nothing is dispatched from a document that failed to parse.  Each
//! peripheral then reads its own [`CommandSection`], typically by
//! deserializing it into a small struct of optional fields.

use serde::de::{self, DeserializeOwned, Deserializer};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::EnvelopeError;

/// Top-level key carrying the controller's delivery id.
pub const ACK_ID_KEY: &str = "ackId";

/// A parsed command document.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandEnvelope {
    root: Map<String, Value>,
    ack_id: Option<String>,
}

impl CommandEnvelope {
    /// Parse a raw payload.  The top level must be a JSON object.
    pub fn parse(payload: &[u8]) -> Result<Self, EnvelopeError> {
        let value: Value = serde_json::from_slice(payload).map_err(|_| EnvelopeError::Malformed)?;
        let Value::Object(root) = value else {
            return Err(EnvelopeError::NotAnObject);
        };
        let ack_id = match root.get(ACK_ID_KEY) {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };
        Ok(Self { root, ack_id })
    }

    /// Delivery id the controller wants echoed back, if any.
    pub fn ack_id(&self) -> Option<&str> {
        self.ack_id.as_deref()
    }

    /// The subtree addressed to `name`, if present and an object.
    pub fn section<'a>(&'a self, name: &'a str) -> Option<CommandSection<'a>> {
        match self.root.get(name) {
            Some(Value::Object(fields)) => Some(CommandSection { name, fields }),
            _ => None,
        }
    }
}

/// One peripheral's command subtree.
#[derive(Debug, Clone, Copy)]
pub struct CommandSection<'a> {
    name: &'a str,
    fields: &'a Map<String, Value>,
}

impl<'a> CommandSection<'a> {
    pub fn name(&self) -> &'a str {
        self.name
    }

    pub fn get(&self, key: &str) -> Option<&'a Value> {
        self.fields.get(key)
    }

    /// `Some(b)` only when `key` holds a JSON boolean.
    pub fn bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Value::as_bool)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Deserialize the whole subtree.  Unknown keys are ignored; a field of
    /// the wrong type rejects the subtree as a whole.
    pub fn parse<T: DeserializeOwned>(&self, who: &'static str) -> Result<T, EnvelopeError> {
        T::deserialize(Value::Object(self.fields.clone()))
            .map_err(|_| EnvelopeError::InvalidSection(who))
    }
}

/// Accept an integer given either as a JSON number or as a numeric string.
///
/// Use with `#[serde(default, deserialize_with = "number_or_string")]`.
pub fn number_or_string<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Lenient {
        Number(u64),
        Text(String),
    }

    match Option::<Lenient>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Lenient::Number(n)) => u32::try_from(n).map(Some).map_err(de::Error::custom),
        Some(Lenient::Text(s)) => s.trim().parse::<u32>().map(Some).map_err(de::Error::custom),
    }
}
