//! Queue payloads and stored documents
//!
//! A payload is a flat JSON object of string or number values. The worker turns
//! it into a document, optionally augmented with a text analysis.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::analysis::TextAnalysis;

/// Field carrying free text that gets analysed
pub const TEXT_FIELD: &str = "text";

/// Field carrying opaque data (simple variant)
pub const DATA_FIELD: &str = "data";

/// Field the analysis is attached under
pub const ANALYSIS_FIELD: &str = "analysis";

/// A single payload value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PayloadValue {
    Text(String),
    Number(Number),
}

impl PayloadValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PayloadValue::Text(s) => Some(s),
            PayloadValue::Number(_) => None,
        }
    }
}

impl From<&str> for PayloadValue {
    fn from(value: &str) -> Self {
        PayloadValue::Text(value.to_string())
    }
}

impl From<String> for PayloadValue {
    fn from(value: String) -> Self {
        PayloadValue::Text(value)
    }
}

impl From<i64> for PayloadValue {
    fn from(value: i64) -> Self {
        PayloadValue::Number(value.into())
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("payload must be a JSON object")]
    NotAnObject,

    #[error("field '{0}' must be a string or a number")]
    UnsupportedValue(String),
}

/// Message placed on the queue
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Payload {
    fields: BTreeMap<String, PayloadValue>,
}

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<String>, value: impl Into<PayloadValue>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&PayloadValue> {
        self.fields.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(PayloadValue::as_str)
    }

    pub fn text(&self) -> Option<&str> {
        self.get_str(TEXT_FIELD)
    }

    /// The primary content: `data` if present, else `text`.
    pub fn content(&self) -> Option<&str> {
        self.get_str(DATA_FIELD).or_else(|| self.text())
    }

    /// Fields in key order
    pub fn fields(&self) -> impl Iterator<Item = (&str, &PayloadValue)> + '_ {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Decode a payload from raw queue bytes.
    ///
    /// Anything other than a flat object of strings and numbers is rejected,
    /// with an error naming the offending field.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let value: Value = serde_json::from_slice(bytes)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, DecodeError> {
        let Value::Object(map) = value else {
            return Err(DecodeError::NotAnObject);
        };

        let mut fields = BTreeMap::new();
        for (key, value) in map {
            let value = match value {
                Value::String(s) => PayloadValue::Text(s),
                Value::Number(n) => PayloadValue::Number(n),
                _ => return Err(DecodeError::UnsupportedValue(key)),
            };
            fields.insert(key, value);
        }

        Ok(Self { fields })
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    fn to_object(&self) -> Map<String, Value> {
        self.fields
            .iter()
            .map(|(k, v)| {
                let v = match v {
                    PayloadValue::Text(s) => Value::String(s.clone()),
                    PayloadValue::Number(n) => Value::Number(n.clone()),
                };
                (k.clone(), v)
            })
            .collect()
    }
}

/// Document about to be persisted
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    body: Map<String, Value>,
}

impl Document {
    /// Build a document from a payload, attaching `analysis` when given.
    ///
    /// `analysis` is a reserved key: a payload value under it is replaced by
    /// the computed analysis. The gateway refuses payloads that set it.
    pub fn from_payload(payload: &Payload, analysis: Option<TextAnalysis>) -> Self {
        let mut body = payload.to_object();
        if let Some(analysis) = analysis {
            body.insert(ANALYSIS_FIELD.to_string(), analysis.to_value());
        }
        Self { body }
    }

    pub fn from_body(body: Map<String, Value>) -> Self {
        Self { body }
    }

    pub fn body(&self) -> &Map<String, Value> {
        &self.body
    }

    pub fn into_body(self) -> Map<String, Value> {
        self.body
    }
}

/// Store-assigned document identifier, increasing in insertion order
pub type DocumentId = i64;

/// A document as read back from the store
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredDocument {
    pub id: DocumentId,
    pub body: Map<String, Value>,
    pub stored_at: DateTime<Utc>,
}

impl StoredDocument {
    fn get_str(&self, key: &str) -> Option<&str> {
        self.body.get(key).and_then(Value::as_str)
    }

    /// The primary content: `data` if present, else `text`.
    pub fn content(&self) -> Option<&str> {
        self.get_str(DATA_FIELD).or_else(|| self.get_str(TEXT_FIELD))
    }
}
