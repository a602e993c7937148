//! In-memory transport.
//!
//! `MemoryConnector::pair()` returns a connector for the client and a
//! [`MemoryBroker`] that accepts the sessions it opens. The broker side reads
//! decoded [`ClientFrame`]s and can push well-formed [`ServerFrame`]s or raw
//! bytes, which makes it suitable for scripting broker behaviour in tests.

use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::BoxFuture;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use super::message::{ClientFrame, ServerFrame};
use super::{Connector, TransportSession};
use crate::client::ServiceUrl;
use crate::utils::TransportError;

#[derive(Debug)]
pub struct MemoryConnector {
    accepts: UnboundedSender<MemoryBrokerSession>,
    refusing: AtomicBool,
}

impl MemoryConnector {
    pub fn pair() -> (Self, MemoryBroker) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                accepts: tx,
                refusing: AtomicBool::new(false),
            },
            MemoryBroker { accepts: rx },
        )
    }

    /// While refusing, every connection attempt fails.
    pub fn set_refusing(&self, refusing: bool) {
        self.refusing.store(refusing, Ordering::SeqCst);
    }
}

impl Connector for MemoryConnector {
    fn connect<'a>(
        &'a self,
        endpoint: &'a ServiceUrl,
    ) -> BoxFuture<'a, Result<TransportSession, TransportError>> {
        Box::pin(async move {
            if self.refusing.load(Ordering::SeqCst) {
                return Err(TransportError::new(endpoint.to_string(), "connection refused"));
            }
            let (out_tx, out_rx) = mpsc::unbounded_channel();
            let (in_tx, in_rx) = mpsc::unbounded_channel();
            let session = MemoryBrokerSession {
                endpoint: endpoint.clone(),
                from_client: out_rx,
                to_client: in_tx,
            };
            self.accepts
                .send(session)
                .map_err(|_| TransportError::new(endpoint.to_string(), "connection refused"))?;
            Ok(TransportSession {
                outgoing: out_tx,
                incoming: in_rx,
            })
        })
    }
}

/// Accepts the sessions opened through the paired [`MemoryConnector`].
#[derive(Debug)]
pub struct MemoryBroker {
    accepts: UnboundedReceiver<MemoryBrokerSession>,
}

impl MemoryBroker {
    pub async fn accept(&mut self) -> Option<MemoryBrokerSession> {
        self.accepts.recv().await
    }

    /// Accepts a session and completes the `open` handshake, returning the
    /// session and the client id the client announced.
    pub async fn accept_open(&mut self) -> Option<(MemoryBrokerSession, String)> {
        let mut session = self.accept().await?;
        match session.next_frame().await? {
            ClientFrame::Open { client_id, .. } => {
                session.send(&ServerFrame::Opened);
                Some((session, client_id))
            }
            _ => None,
        }
    }
}

/// The broker's end of one session.
#[derive(Debug)]
pub struct MemoryBrokerSession {
    pub endpoint: ServiceUrl,
    from_client: UnboundedReceiver<Vec<u8>>,
    to_client: UnboundedSender<Result<Vec<u8>, TransportError>>,
}

impl MemoryBrokerSession {
    /// Next frame sent by the client; `None` once the client closed the
    /// session. Undecodable bytes are skipped.
    pub async fn next_frame(&mut self) -> Option<ClientFrame> {
        loop {
            let bytes = self.from_client.recv().await?;
            if let Ok(frame) = serde_json::from_slice(&bytes) {
                return Some(frame);
            }
        }
    }

    /// Like [`next_frame`](Self::next_frame) but answers `subscribe` and
    /// `unsubscribe` requests with success before returning them.
    pub async fn next_frame_accepting(&mut self) -> Option<ClientFrame> {
        let frame = self.next_frame().await?;
        let reply = match &frame {
            ClientFrame::Subscribe { request_id, .. } => Some(ServerFrame::Subscribed {
                request_id: *request_id,
            }),
            ClientFrame::Unsubscribe { request_id, .. } => Some(ServerFrame::Unsubscribed {
                request_id: *request_id,
            }),
            _ => None,
        };
        if let Some(reply) = reply {
            self.send(&reply);
        }
        Some(frame)
    }

    pub fn send(&self, frame: &ServerFrame) -> bool {
        match serde_json::to_vec(frame) {
            Ok(bytes) => self.send_raw(bytes),
            Err(_) => false,
        }
    }

    pub fn send_raw(&self, bytes: impl Into<Vec<u8>>) -> bool {
        self.to_client.send(Ok(bytes.into())).is_ok()
    }

    /// Breaks the session with a transport error.
    pub fn fail(self, reason: &str) {
        let _ = self
            .to_client
            .send(Err(TransportError::new(self.endpoint.to_string(), reason)));
    }

    /// Closes the session cleanly from the broker side.
    pub fn close(self) {
        drop(self);
    }
}
