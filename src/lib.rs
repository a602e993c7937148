//! # subflow
//!
//! `subflow` is the receiving half of a messaging client: it connects to a
//! broker, subscribes to topic patterns and delivers the messages it receives
//! with at-most-once or at-least-once guarantees. At-least-once delivery is
//! flow controlled with per-subscription credit and settled by explicit,
//! idempotent confirmations.
//!
//! ## Core Modules
//!
//! - `client`: Options, service URLs, the connection state machine and the
//!   `Client` handle.
//! - `subscription`: Topic patterns, share names, subscribe options and the
//!   per-client subscription registry.
//! - `delivery`: Credit accounting, pending confirmations and the delivery
//!   handles given to the application.
//! - `dispatch`: Event handlers and the ordered per-subscription dispatch
//!   stream.
//! - `transport`: The `Connector` boundary, the JSON wire frames and the
//!   WebSocket and in-memory connectors.
//! - `config`: Loading the receiver's settings from file and environment.
//! - `receiver`: The receive loop run by the `subflow` binary.
//! - `utils`: Shared error types and logging setup.
//!
//! ## Example
//!
//! ```no_run
//! use subflow::{ClientOptions, SubscribeOptions, create_client};
//!
//! # async fn run() -> subflow::Result<()> {
//! let client = create_client(ClientOptions::new("amqp://localhost"))?;
//! client.on_message(|payload, delivery| {
//!     println!("{}: {payload}", delivery.message.topic);
//!     delivery.message.confirm_delivery();
//! });
//! client.start().await?;
//! client
//!     .subscribe("sports/#", None, SubscribeOptions::at_least_once().with_auto_confirm(false))
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod delivery;
pub mod dispatch;
pub mod receiver;
pub mod subscription;
pub mod transport;
pub mod utils;

pub use client::{Backoff, Client, ClientOptions, ClientState, ServiceUrl, create_client};
pub use delivery::{Delivery, DeliveryMessage, Destination, MalformedMessage, Payload};
pub use dispatch::EventHandlers;
pub use subscription::{QoS, SubscribeOptions, Subscription, UnsubscribeOptions};
pub use transport::{Connector, TransportSession};
pub use utils::{ClientError, MalformedMessageError, Result, TransportError};
