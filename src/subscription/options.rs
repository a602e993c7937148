use std::fmt;
use std::time::Duration;

use serde::Deserialize;

/// Delivery guarantee requested for a subscription.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QoS {
    #[default]
    AtMostOnce,
    AtLeastOnce,
}

impl QoS {
    pub fn as_u8(self) -> u8 {
        match self {
            Self::AtMostOnce => 0,
            Self::AtLeastOnce => 1,
        }
    }
}

impl fmt::Display for QoS {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AtMostOnce => f.write_str("at-most-once"),
            Self::AtLeastOnce => f.write_str("at-least-once"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeOptions {
    pub qos: QoS,
    /// Confirm each delivery as soon as the message handler returns.
    pub auto_confirm: bool,
    /// Expire the destination after it has had no subscribers for this long.
    pub ttl: Option<Duration>,
    /// Deliveries allowed before confirmations are required. `None` is
    /// unlimited.
    pub credit: Option<u32>,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            qos: QoS::AtMostOnce,
            auto_confirm: true,
            ttl: None,
            credit: None,
        }
    }
}

impl SubscribeOptions {
    pub fn at_least_once() -> Self {
        Self {
            qos: QoS::AtLeastOnce,
            ..Self::default()
        }
    }

    pub fn with_auto_confirm(mut self, auto_confirm: bool) -> Self {
        self.auto_confirm = auto_confirm;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_credit(mut self, credit: u32) -> Self {
        self.credit = Some(credit);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnsubscribeOptions {
    /// New destination ttl; `Some(Duration::ZERO)` discards it immediately.
    pub ttl: Option<Duration>,
}

/// Identifies a subscription within one client.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    pub pattern: String,
    pub share: Option<String>,
}

impl SubscriptionKey {
    pub fn new(pattern: impl Into<String>, share: Option<&str>) -> Self {
        Self {
            pattern: pattern.into(),
            share: share.map(str::to_string),
        }
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.share {
            Some(share) => write!(f, "share:{share}:{}", self.pattern),
            None => write!(f, "private:{}", self.pattern),
        }
    }
}

pub(crate) fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
