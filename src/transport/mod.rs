//! The `transport` module is the byte-stream boundary between the client and
//! the broker.
//!
//! A [`Connector`] opens a [`TransportSession`]: a pair of channels carrying
//! raw frames out to the broker and raw frames (or a terminal error) back in.
//! Everything above this boundary speaks the JSON frames in [`message`].
//!
//! Two connectors ship with the crate: [`websocket::WebSocketConnector`]
//! for real brokers and [`memory::MemoryConnector`] for scripting a broker in
//! tests.

pub mod memory;
pub mod message;
pub mod websocket;

use std::sync::Mutex;

use futures::future::BoxFuture;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::warn;

use crate::client::ServiceUrl;
use crate::utils::TransportError;
use message::{ClientFrame, encode_client_frame};

pub use memory::{MemoryBroker, MemoryBrokerSession, MemoryConnector};
pub use websocket::WebSocketConnector;

/// An established session with a broker endpoint.
///
/// Dropping `outgoing` closes the session. `incoming` ends with `None` when
/// the broker closes the session, or yields one `Err` when it breaks.
#[derive(Debug)]
pub struct TransportSession {
    pub outgoing: UnboundedSender<Vec<u8>>,
    pub incoming: UnboundedReceiver<Result<Vec<u8>, TransportError>>,
}

/// Opens sessions to broker endpoints.
pub trait Connector: Send + Sync + 'static {
    fn connect<'a>(
        &'a self,
        endpoint: &'a ServiceUrl,
    ) -> BoxFuture<'a, Result<TransportSession, TransportError>>;
}

/// The outbound half of the current session, shared by the client and every
/// delivery engine so confirmations can ack without going through the client.
///
/// Frames sent while no session is attached, or tagged with a stale epoch,
/// are discarded.
#[derive(Debug, Default)]
pub(crate) struct OutboundLink {
    current: Mutex<Option<(u64, UnboundedSender<Vec<u8>>)>>,
}

impl OutboundLink {
    pub(crate) fn attach(&self, epoch: u64, sender: UnboundedSender<Vec<u8>>) {
        *self.lock() = Some((epoch, sender));
    }

    pub(crate) fn detach(&self) -> Option<UnboundedSender<Vec<u8>>> {
        self.lock().take().map(|(_, sender)| sender)
    }

    /// Sends on the current session. Returns false when nothing was sent.
    pub(crate) fn send(&self, frame: &ClientFrame) -> bool {
        self.send_if(None, frame)
    }

    /// Sends only if the attached session still belongs to `epoch`.
    pub(crate) fn send_in(&self, epoch: u64, frame: &ClientFrame) -> bool {
        self.send_if(Some(epoch), frame)
    }

    fn send_if(&self, epoch: Option<u64>, frame: &ClientFrame) -> bool {
        let sender = match &*self.lock() {
            Some((current, sender)) if epoch.is_none_or(|e| e == *current) => sender.clone(),
            _ => return false,
        };
        match encode_client_frame(frame) {
            Ok(bytes) => sender.send(bytes).is_ok(),
            Err(e) => {
                warn!("Failed to encode frame {frame:?}: {e}");
                false
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<(u64, UnboundedSender<Vec<u8>>)>> {
        self.current
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
