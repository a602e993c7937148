use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::debug;

use super::handlers::EventDispatcher;
use crate::delivery::engine::{DeliveryEngine, Dispatch, Inbound};

/// Spawns the dispatch stream of one subscription.
///
/// Frames are admitted and handed to the application strictly in the order
/// they were queued, one at a time; the next frame is not admitted until the
/// previous handler has returned. While the engine waits for credit the
/// whole stream waits with it, and other subscriptions are unaffected.
pub(crate) fn spawn_stream(
    engine: Arc<DeliveryEngine>,
    mut inbound: UnboundedReceiver<Inbound>,
    events: Arc<EventDispatcher>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = inbound.recv().await {
            let Some(dispatch) = engine.admit(frame).await else {
                if engine.is_stopping() {
                    break;
                }
                continue;
            };
            let auto_confirm = engine.options().auto_confirm;

            match dispatch {
                Dispatch::Message(payload, delivery) => {
                    let settle = auto_confirm.then(|| delivery.message.clone());
                    if !events.emit_message(payload, delivery) {
                        debug!("No message handler registered for {}", engine.key());
                    }
                    if let Some(message) = settle {
                        message.confirm_delivery();
                    }
                }
                Dispatch::Malformed(malformed) => {
                    let settle = malformed
                        .delivery
                        .as_ref()
                        .filter(|_| auto_confirm)
                        .map(|d| d.message.clone());
                    if !events.emit_malformed(malformed) {
                        debug!("No malformed handler registered for {}", engine.key());
                    }
                    if let Some(message) = settle {
                        message.confirm_delivery();
                    }
                }
            }
        }
        debug!("Dispatch stream closed for {}", engine.key());
    })
}
