//! The `delivery` module is the core of the client: it applies quality of
//! service and credit-based flow control to inbound messages and owns the
//! confirmation contract handed to the application.

pub mod credit;
pub(crate) mod engine;
pub mod message;

pub use credit::{CreditLedger, Release};
pub use message::{Delivery, DeliveryMessage, Destination, MalformedMessage, Payload};
