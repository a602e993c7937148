//! The `dispatch` module delivers connection-state and message events to the
//! application's handlers.
//!
//! Lifecycle events are emitted by the client as they happen. Message and
//! malformed events flow through one dispatch stream per subscription, which
//! keeps each subscription's events in receipt order and never runs two of
//! them at once.

pub mod handlers;
pub(crate) mod stream;

pub use handlers::{EventDispatcher, EventHandlers};
