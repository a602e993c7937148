//! The `utils` module provides the pieces shared across the client: the error
//! taxonomy and logging initialisation.

pub mod error;
pub mod logging;

pub use error::{ClientError, MalformedMessageError, Result, TransportError};
