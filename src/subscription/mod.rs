//! The `subscription` module tracks what a client is subscribed to: topic
//! patterns, optional share names, the options each subscription was made
//! with, and the registry that ties them to their delivery engines.

pub mod options;
pub mod pattern;
pub(crate) mod registry;

use std::fmt;
use std::sync::Arc;

use crate::delivery::engine::DeliveryEngine;
use crate::utils::{ClientError, Result};

pub use options::{QoS, SubscribeOptions, SubscriptionKey, UnsubscribeOptions};
pub use pattern::{TopicPattern, validate_share};

/// Checks a subscribe request before anything is sent to the broker.
pub fn validate_request(
    pattern: &str,
    share: Option<&str>,
    options: &SubscribeOptions,
) -> Result<TopicPattern> {
    let parsed =
        TopicPattern::parse(pattern).map_err(|r| ClientError::subscription(pattern, share, r))?;
    if let Some(share) = share {
        validate_share(share).map_err(|r| ClientError::subscription(pattern, Some(share), r))?;
    }
    if options.credit == Some(0) {
        return Err(ClientError::subscription(
            pattern,
            share,
            "credit must be at least 1 when set",
        ));
    }
    Ok(parsed)
}

/// A live subscription returned by `Client::subscribe`.
///
/// Cloning is cheap; every clone observes the same delivery state.
#[derive(Clone)]
pub struct Subscription {
    pub(crate) engine: Arc<DeliveryEngine>,
}

impl Subscription {
    pub fn pattern(&self) -> &str {
        &self.engine.key().pattern
    }

    pub fn share(&self) -> Option<&str> {
        self.engine.key().share.as_deref()
    }

    pub fn key(&self) -> &SubscriptionKey {
        self.engine.key()
    }

    pub fn options(&self) -> &SubscribeOptions {
        self.engine.options()
    }

    pub fn qos(&self) -> QoS {
        self.engine.options().qos
    }

    /// Deliveries that can still be made before a confirmation is needed;
    /// `None` when credit is unlimited.
    pub fn credit_remaining(&self) -> Option<u32> {
        self.engine.credit_remaining()
    }

    pub fn pending_confirmations(&self) -> usize {
        self.engine.pending_confirmations()
    }

    /// False once the subscription was unsubscribed or its client stopped.
    pub fn is_active(&self) -> bool {
        !self.engine.is_closed()
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("key", self.engine.key())
            .field("options", self.engine.options())
            .field("credit_remaining", &self.credit_remaining())
            .finish()
    }
}
