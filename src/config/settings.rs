use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use uuid::Uuid;

use crate::client::{Backoff, ClientOptions, DEFAULT_SERVICE};
use crate::subscription::{QoS, SubscribeOptions};

/// Service used when only a trust certificate is configured.
pub const DEFAULT_SECURE_SERVICE: &str = "amqps://localhost";

/// Top-level configuration settings for the `subflow` receiver.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct Settings {
    pub client: ClientSettings,
    pub subscription: SubscriptionSettings,
    pub retry: RetrySettings,
    pub logging: LoggingSettings,
}

/// Where to connect and as whom.
///
/// `service` may list several URLs separated by commas; they are tried in
/// order.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct ClientSettings {
    pub service: Option<String>,
    pub id: Option<String>,
    pub trust_certificate: Option<PathBuf>,
}

/// What to subscribe to.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct SubscriptionSettings {
    pub topic_pattern: String,
    pub share_name: Option<String>,
    pub destination_ttl_secs: Option<u64>,
    /// Wait this long before confirming each message. Zero confirms at once.
    pub confirm_delay_ms: u64,
    pub credit: Option<u32>,
    /// Write the next payload to this file, confirm it and exit.
    pub file: Option<PathBuf>,
    pub verbose: bool,
}

/// How often `start` is retried before giving up.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct LoggingSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Settings with every value optional. Missing values are filled from
/// [`Settings::default`].
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub client: Option<PartialClientSettings>,
    pub subscription: Option<PartialSubscriptionSettings>,
    pub retry: Option<PartialRetrySettings>,
    pub logging: Option<PartialLoggingSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialClientSettings {
    pub service: Option<String>,
    pub id: Option<String>,
    pub trust_certificate: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialSubscriptionSettings {
    pub topic_pattern: Option<String>,
    pub share_name: Option<String>,
    pub destination_ttl_secs: Option<u64>,
    pub confirm_delay_ms: Option<u64>,
    pub credit: Option<u32>,
    pub file: Option<PathBuf>,
    pub verbose: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialRetrySettings {
    pub max_attempts: Option<u32>,
    pub initial_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            client: ClientSettings::default(),
            subscription: SubscriptionSettings {
                topic_pattern: "public".to_string(),
                share_name: None,
                destination_ttl_secs: None,
                confirm_delay_ms: 0,
                credit: None,
                file: None,
                verbose: false,
            },
            retry: RetrySettings {
                max_attempts: 5,
                initial_delay_ms: 1000,
                max_delay_ms: 30_000,
            },
            logging: LoggingSettings {
                level: "info".to_string(),
            },
        }
    }
}

impl Settings {
    /// Fills everything `partial` leaves out from the defaults.
    pub fn merge(partial: PartialSettings) -> Self {
        let default = Self::default();
        let client = partial.client.unwrap_or_default();
        let subscription = partial.subscription.unwrap_or_default();
        let retry = partial.retry.unwrap_or_default();
        let logging = partial.logging.unwrap_or_default();

        Self {
            client: ClientSettings {
                service: client.service.filter(|s| !s.trim().is_empty()),
                id: client.id.filter(|s| !s.is_empty()),
                trust_certificate: client.trust_certificate,
            },
            subscription: SubscriptionSettings {
                topic_pattern: subscription
                    .topic_pattern
                    .unwrap_or(default.subscription.topic_pattern),
                share_name: subscription.share_name.filter(|s| !s.is_empty()),
                destination_ttl_secs: subscription.destination_ttl_secs,
                confirm_delay_ms: subscription
                    .confirm_delay_ms
                    .unwrap_or(default.subscription.confirm_delay_ms),
                credit: subscription.credit.or(default.subscription.credit),
                file: subscription.file.filter(|f| !f.as_os_str().is_empty()),
                verbose: subscription.verbose.unwrap_or(default.subscription.verbose),
            },
            retry: RetrySettings {
                max_attempts: retry.max_attempts.unwrap_or(default.retry.max_attempts),
                initial_delay_ms: retry
                    .initial_delay_ms
                    .unwrap_or(default.retry.initial_delay_ms),
                max_delay_ms: retry.max_delay_ms.unwrap_or(default.retry.max_delay_ms),
            },
            logging: LoggingSettings {
                level: logging.level.unwrap_or(default.logging.level),
            },
        }
    }

    /// Client options for these settings. Validation happens when the
    /// client is created. Without a configured id the receiver connects as
    /// `recv_` followed by seven hex characters.
    pub fn client_options(&self) -> ClientOptions {
        let services: Vec<String> = match &self.client.service {
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            None if self.client.trust_certificate.is_some() => {
                vec![DEFAULT_SECURE_SERVICE.to_string()]
            }
            None => vec![DEFAULT_SERVICE.to_string()],
        };
        ClientOptions {
            services,
            id: Some(self.client.id.clone().unwrap_or_else(receiver_id)),
            ssl_trust_certificate: self.client.trust_certificate.clone(),
            ..ClientOptions::default()
        }
    }

    /// At-least-once with manual confirmation. A confirm delay or an output
    /// file without an explicit credit limits the subscription to one
    /// message in flight.
    pub fn subscribe_options(&self) -> SubscribeOptions {
        let sub = &self.subscription;
        let credit = match sub.credit {
            Some(credit) => Some(credit),
            None if sub.confirm_delay_ms > 0 || sub.file.is_some() => Some(1),
            None => None,
        };
        SubscribeOptions {
            qos: QoS::AtLeastOnce,
            auto_confirm: false,
            ttl: sub.destination_ttl_secs.map(Duration::from_secs),
            credit,
        }
    }

    pub fn confirm_delay(&self) -> Duration {
        Duration::from_millis(self.subscription.confirm_delay_ms)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.retry.initial_delay_ms),
            Duration::from_millis(self.retry.max_delay_ms),
        )
    }
}

fn receiver_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("recv_{}", &hex[..7])
}
