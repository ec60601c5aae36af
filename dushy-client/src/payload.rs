//! # Pub/Sub Payloads
//!
//! Purpose: Give the publish family a closed set of payload kinds and one
//! wire envelope that carries the kind next to the content.
//!
//! ## Envelope
//!
//! ```text
//! {"type":"text","content":"hello"}
//! {"type":"json","content":{"a":1}}
//! {"type":"binary","content":[104,105]}
//! {"type":"int","content":42}
//! {"type":"array","content":[1,"two"]}
//! ```
//!
//! Every variant travels through a single `PUBLISH channel <envelope>`
//! command. Payloads that are not an envelope (published by other clients)
//! decode to `Text` when they are UTF-8 and to `Binary` otherwise.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ClientResult;

/// Message content published to or received from a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "content", rename_all = "lowercase")]
pub enum Payload {
    /// Plain text.
    Text(String),
    /// Arbitrary JSON document.
    Json(Value),
    /// Raw bytes.
    Binary(Vec<u8>),
    /// Signed integer.
    Int(i64),
    /// JSON array.
    Array(Vec<Value>),
}

impl Payload {
    /// Serializes the payload into its wire envelope.
    pub fn encode(&self) -> ClientResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decodes a received message body.
    pub fn decode(raw: &[u8]) -> Payload {
        if let Ok(payload) = serde_json::from_slice::<Payload>(raw) {
            return payload;
        }
        match std::str::from_utf8(raw) {
            Ok(text) => Payload::Text(text.to_string()),
            Err(_) => Payload::Binary(raw.to_vec()),
        }
    }

    /// Envelope tag of this payload.
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Text(_) => "text",
            Payload::Json(_) => "json",
            Payload::Binary(_) => "binary",
            Payload::Int(_) => "int",
            Payload::Array(_) => "array",
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Payload::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_binary(&self) -> Option<&[u8]> {
        match self {
            Payload::Binary(data) => Some(data),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Payload::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Payload::Array(items) => Some(items),
            _ => None,
        }
    }
}

/// A published message delivered to a subscriber callback.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Channel the message was published to.
    pub channel: String,
    /// Matching pattern for pattern subscriptions.
    pub pattern: Option<String>,
    /// Decoded message body.
    pub payload: Payload,
}
