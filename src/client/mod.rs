//! The `client` module is the connection manager.
//!
//! It validates [`ClientOptions`], owns the session with the broker and the
//! client's state machine (`Disconnected → Connecting → Connected`, and
//! finally `Stopped`), and exposes subscribe/unsubscribe on top of the
//! subscription registry.

pub mod backoff;
mod connection;
pub mod options;
mod requests;

pub use backoff::Backoff;
pub use connection::{Client, ClientState, create_client};
pub use options::{
    ClientOptions, DEFAULT_DRAIN_TIMEOUT, DEFAULT_SERVICE, Scheme, ServiceUrl, ValidatedOptions,
};
