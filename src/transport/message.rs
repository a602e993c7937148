//! Wire frames exchanged with the broker.
//!
//! Frames are JSON objects tagged by `type`, one per transport message.
//! `parse_server_frame` is lenient about broken `message` frames: as long as
//! the envelope still names a subscription, the frame is surfaced as a
//! malformed delivery instead of being dropped.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    #[serde(rename = "open")]
    Open {
        client_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,
    },
    #[serde(rename = "subscribe")]
    Subscribe {
        request_id: u64,
        pattern: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        share: Option<String>,
        qos: u8,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ttl_ms: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        credit: Option<u32>,
    },
    #[serde(rename = "unsubscribe")]
    Unsubscribe {
        request_id: u64,
        pattern: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        share: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ttl_ms: Option<u64>,
    },
    #[serde(rename = "ack")]
    Ack { delivery_id: String },
    /// Grants the broker `credit` more deliveries on a subscription.
    #[serde(rename = "flow")]
    Flow {
        pattern: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        share: Option<String>,
        credit: u32,
    },
    #[serde(rename = "close")]
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    #[serde(rename = "opened")]
    Opened,
    #[serde(rename = "subscribed")]
    Subscribed { request_id: u64 },
    #[serde(rename = "unsubscribed")]
    Unsubscribed { request_id: u64 },
    #[serde(rename = "error")]
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        message: String,
    },
    #[serde(rename = "message")]
    Message(InboundMessage),
}

/// A message routed to one of this client's subscriptions.
///
/// `pattern` and `share` identify the subscription; `encoding` tells how
/// `body` must be decoded (`text` or `json`).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct InboundMessage {
    pub delivery_id: String,
    pub topic: String,
    pub pattern: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share: Option<String>,
    #[serde(default = "default_encoding")]
    pub encoding: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,
}

fn default_encoding() -> String {
    "text".to_string()
}

/// Whatever could be salvaged from a `message` frame that failed to parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialEnvelope {
    pub delivery_id: Option<String>,
    pub topic: Option<String>,
    pub pattern: String,
    pub share: Option<String>,
    pub ttl_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedFrame {
    Frame(ServerFrame),
    Malformed {
        envelope: Option<PartialEnvelope>,
        reason: String,
    },
}

pub fn parse_server_frame(raw: &[u8]) -> ParsedFrame {
    match serde_json::from_slice::<ServerFrame>(raw) {
        Ok(frame) => ParsedFrame::Frame(frame),
        Err(err) => ParsedFrame::Malformed {
            envelope: salvage_envelope(raw),
            reason: err.to_string(),
        },
    }
}

fn salvage_envelope(raw: &[u8]) -> Option<PartialEnvelope> {
    let value: Value = serde_json::from_slice(raw).ok()?;
    let object = value.as_object()?;
    if object.get("type").and_then(Value::as_str) != Some("message") {
        return None;
    }
    let text = |key: &str| object.get(key).and_then(Value::as_str).map(str::to_string);

    Some(PartialEnvelope {
        delivery_id: text("delivery_id"),
        topic: text("topic"),
        pattern: text("pattern")?,
        share: text("share"),
        ttl_ms: object.get("ttl_ms").and_then(Value::as_u64),
    })
}

pub fn encode_client_frame(frame: &ClientFrame) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(frame)
}
