//! Message and delivery definitions
//!
//! `Payload` is the decoded body handed to the `message` handler together
//! with a `Delivery`. A delivery carries the message metadata and the
//! destination it arrived through, and owns the confirmation for it.
//!
//! Notes on fields:
//! - `DeliveryMessage::topic`: topic the message was published on
//! - `DeliveryMessage::ttl`: remaining message time-to-live, if the broker
//!   reported one
//! - `DeliveryMessage::received_at`: when the client read the frame
//! - `Destination`: the subscription (pattern and share) that matched

use std::fmt;
use std::sync::Weak;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::engine::DeliveryEngine;
use crate::utils::MalformedMessageError;

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Text(String),
    Json(Value),
}

impl Payload {
    /// Decode `body` according to the frame's declared `encoding`.
    pub fn decode(encoding: &str, body: String) -> Result<Self, String> {
        match encoding {
            "text" => Ok(Self::Text(body)),
            "json" => serde_json::from_str(&body)
                .map(Self::Json)
                .map_err(|e| format!("body is not valid json: {e}")),
            other => Err(format!("unsupported body encoding '{other}'")),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Json(_) => None,
        }
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) => f.write_str(text),
            Self::Json(value) => write!(f, "{value}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub topic_pattern: String,
    pub share: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: DeliveryMessage,
    pub destination: Destination,
}

#[derive(Debug, Clone)]
pub struct DeliveryMessage {
    pub topic: String,
    pub ttl: Option<Duration>,
    pub received_at: DateTime<Utc>,
    /// Broker-assigned id, absent only for malformed frames that lacked one.
    pub delivery_id: Option<String>,
    pub(crate) confirmation: Confirmation,
}

impl DeliveryMessage {
    /// Confirms the delivery, acknowledging it to the broker and returning
    /// its flow-control credit.
    ///
    /// Returns true for the call that confirmed it. Every other call is a
    /// no-op returning false: a repeated confirmation, an at-most-once
    /// delivery, or one abandoned because its session ended or the client
    /// stopped.
    pub fn confirm_delivery(&self) -> bool {
        self.confirmation.confirm()
    }

    /// Whether the delivery is still waiting for a confirmation.
    pub fn is_pending(&self) -> bool {
        self.confirmation.is_pending()
    }
}

/// Handle the engine uses to settle one delivery.
#[derive(Clone, Default)]
pub(crate) struct Confirmation {
    target: Option<ConfirmTarget>,
}

#[derive(Clone)]
struct ConfirmTarget {
    engine: Weak<DeliveryEngine>,
    tag: u64,
    epoch: u64,
    delivery_id: String,
}

impl Confirmation {
    pub(crate) fn none() -> Self {
        Self::default()
    }

    pub(crate) fn new(engine: Weak<DeliveryEngine>, tag: u64, epoch: u64, delivery_id: String) -> Self {
        Self {
            target: Some(ConfirmTarget {
                engine,
                tag,
                epoch,
                delivery_id,
            }),
        }
    }

    pub(crate) fn confirm(&self) -> bool {
        let Some(target) = &self.target else {
            return false;
        };
        match target.engine.upgrade() {
            Some(engine) => engine.confirm(target.tag, target.epoch, &target.delivery_id),
            None => false,
        }
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.target.as_ref().is_some_and(|t| {
            t.engine
                .upgrade()
                .is_some_and(|engine| engine.is_pending(t.tag, t.epoch))
        })
    }
}

impl fmt::Debug for Confirmation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            Some(t) => write!(f, "Confirmation(tag={}, epoch={})", t.tag, t.epoch),
            None => f.write_str("Confirmation(none)"),
        }
    }
}

/// An inbound message that could not be decoded.
#[derive(Debug, Clone)]
pub struct MalformedMessage {
    /// The frame exactly as received.
    pub raw: Vec<u8>,
    pub error: MalformedMessageError,
    /// Present when the frame could be attributed to a subscription.
    pub delivery: Option<Delivery>,
}

impl MalformedMessage {
    pub fn raw_text(&self) -> String {
        String::from_utf8_lossy(&self.raw).into_owned()
    }
}
