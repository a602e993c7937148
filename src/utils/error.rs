//! The `error` module defines the error taxonomy shared by every part of the
//! client.
//!
//! Errors are `Clone` because one failure (a dropped session, a `stop`) is
//! often reported to several waiters and to the `error` handler at once.

use thiserror::Error;

/// A failure of the underlying transport: connecting, the `open` handshake,
/// or an established session breaking.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("transport error on {endpoint}: {reason}")]
pub struct TransportError {
    /// Service the failure relates to, with any password redacted.
    pub endpoint: String,
    pub reason: String,
}

impl TransportError {
    pub fn new(endpoint: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            reason: reason.into(),
        }
    }
}

/// An inbound message whose frame or body could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed message{}: {reason}", topic_suffix(.topic))]
pub struct MalformedMessageError {
    pub topic: Option<String>,
    pub reason: String,
}

fn topic_suffix(topic: &Option<String>) -> String {
    match topic {
        Some(topic) => format!(" on topic '{topic}'"),
        None => String::new(),
    }
}

impl MalformedMessageError {
    pub fn new(topic: Option<String>, reason: impl Into<String>) -> Self {
        Self {
            topic,
            reason: reason.into(),
        }
    }
}

/// Every error the client reports to its caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    /// An invalid option or combination of options, detected before any
    /// network attempt.
    #[error("invalid option '{option}': {reason}")]
    Configuration { option: String, reason: String },

    /// A subscribe or unsubscribe request that cannot be honoured.
    #[error("subscription to {} failed: {reason}", describe_destination(.pattern, .share))]
    Subscription {
        pattern: String,
        share: Option<String>,
        reason: String,
    },

    /// The client has been stopped, either before or while the operation ran.
    #[error("client is stopped: cannot {operation}")]
    Closed { operation: String },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Malformed(#[from] MalformedMessageError),
}

fn describe_destination(pattern: &str, share: &Option<String>) -> String {
    match share {
        Some(share) => format!("pattern '{pattern}' (share '{share}')"),
        None => format!("pattern '{pattern}'"),
    }
}

impl ClientError {
    pub fn configuration(option: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Configuration {
            option: option.into(),
            reason: reason.into(),
        }
    }

    pub fn subscription(
        pattern: impl Into<String>,
        share: Option<&str>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Subscription {
            pattern: pattern.into(),
            share: share.map(str::to_string),
            reason: reason.into(),
        }
    }

    pub fn closed(operation: impl Into<String>) -> Self {
        Self::Closed {
            operation: operation.into(),
        }
    }

    /// Whether retrying the same operation later could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
