//! WebSocket transport
//!
//! Connects to a broker over WebSocket and bridges the socket onto the
//! channel pair of a [`TransportSession`]:
//! - a send loop forwards outgoing frames as text messages and closes the
//!   socket once the client drops its sender
//! - a receive loop forwards text/binary payloads and reports the first
//!   socket error before ending
//!
//! `amqp://` and `amqps://` services are carried over `ws://` and `wss://`
//! to the same host and port. TLS is not negotiated by this connector.

use futures::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::spawn;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tracing::{debug, warn};
use tungstenite::protocol::Message as WsMessage;

use super::{Connector, TransportSession};
use crate::client::ServiceUrl;
use crate::utils::TransportError;

#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }
}

impl Connector for WebSocketConnector {
    fn connect<'a>(
        &'a self,
        endpoint: &'a ServiceUrl,
    ) -> BoxFuture<'a, Result<TransportSession, TransportError>> {
        Box::pin(open_session(endpoint))
    }
}

async fn open_session(endpoint: &ServiceUrl) -> Result<TransportSession, TransportError> {
    let endpoint_name = endpoint.to_string();
    if endpoint.is_secure() {
        return Err(TransportError::new(
            endpoint_name,
            "secure transports are not supported by the WebSocket connector",
        ));
    }

    let (ws_stream, _response) = connect_async(endpoint.websocket_url())
        .await
        .map_err(|e| TransportError::new(endpoint_name.clone(), e.to_string()))?;
    debug!("WebSocket session established with {endpoint_name}");

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let (in_tx, in_rx) = mpsc::unbounded_channel();

    {
        let endpoint_name = endpoint_name.clone();
        spawn(async move {
            while let Some(bytes) = out_rx.recv().await {
                let msg = match String::from_utf8(bytes) {
                    Ok(text) => WsMessage::text(text),
                    Err(e) => WsMessage::binary(e.into_bytes()),
                };
                if let Err(e) = ws_sender.send(msg).await {
                    warn!("Failed to send frame to {endpoint_name}: {e}");
                    break;
                }
            }
            let _ = ws_sender.close().await;
            debug!("Send loop closed for {endpoint_name}");
        });
    }

    spawn(async move {
        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(msg) if msg.is_text() || msg.is_binary() => {
                    if in_tx.send(Ok(msg.into_data().to_vec())).is_err() {
                        break;
                    }
                }
                Ok(WsMessage::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    let _ = in_tx.send(Err(TransportError::new(endpoint_name.clone(), e.to_string())));
                    break;
                }
            }
        }
        debug!("Receive loop closed for {endpoint_name}");
    });

    Ok(TransportSession {
        outgoing: out_tx,
        incoming: in_rx,
    })
}
