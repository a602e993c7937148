//! Event handler registration.
//!
//! Every event has at most one handler. Registering again replaces the
//! previous handler; events without a handler are ignored.
//!
//! Handlers are cloned out of the registry before they are invoked, so a
//! handler may register handlers, confirm deliveries or spawn client calls
//! without deadlocking. Handlers run on the runtime's worker threads and
//! should hand long work off rather than block.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use crate::client::ClientState;
use crate::delivery::{Delivery, MalformedMessage, Payload};
use crate::utils::ClientError;

pub type OnLifecycle = Arc<dyn Fn() + Send + Sync>;
pub type OnError = Arc<dyn Fn(&ClientError) + Send + Sync>;
pub type OnStateChange = Arc<dyn Fn(ClientState) + Send + Sync>;
pub type OnMessage = Arc<dyn Fn(Payload, Delivery) + Send + Sync>;
pub type OnMalformed = Arc<dyn Fn(MalformedMessage) + Send + Sync>;

#[derive(Clone, Default)]
pub struct EventHandlers {
    started: Option<OnLifecycle>,
    restarted: Option<OnLifecycle>,
    stopped: Option<OnLifecycle>,
    error: Option<OnError>,
    state_change: Option<OnStateChange>,
    message: Option<OnMessage>,
    malformed: Option<OnMalformed>,
}

impl EventHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_started(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.started = Some(Arc::new(f));
        self
    }

    pub fn on_restarted(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.restarted = Some(Arc::new(f));
        self
    }

    pub fn on_stopped(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.stopped = Some(Arc::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(&ClientError) + Send + Sync + 'static) -> Self {
        self.error = Some(Arc::new(f));
        self
    }

    pub fn on_state_change(mut self, f: impl Fn(ClientState) + Send + Sync + 'static) -> Self {
        self.state_change = Some(Arc::new(f));
        self
    }

    pub fn on_message(mut self, f: impl Fn(Payload, Delivery) + Send + Sync + 'static) -> Self {
        self.message = Some(Arc::new(f));
        self
    }

    pub fn on_malformed(mut self, f: impl Fn(MalformedMessage) + Send + Sync + 'static) -> Self {
        self.malformed = Some(Arc::new(f));
        self
    }

    pub fn has_message_handler(&self) -> bool {
        self.message.is_some()
    }
}

impl fmt::Debug for EventHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHandlers")
            .field("started", &self.started.is_some())
            .field("restarted", &self.restarted.is_some())
            .field("stopped", &self.stopped.is_some())
            .field("error", &self.error.is_some())
            .field("state_change", &self.state_change.is_some())
            .field("message", &self.message.is_some())
            .field("malformed", &self.malformed.is_some())
            .finish()
    }
}

/// The handler set shared by a client and its dispatch streams.
#[derive(Debug, Default)]
pub struct EventDispatcher {
    handlers: RwLock<EventHandlers>,
}

impl EventDispatcher {
    pub fn new(handlers: EventHandlers) -> Self {
        Self {
            handlers: RwLock::new(handlers),
        }
    }

    /// Modify the registered handlers in place.
    pub fn update(&self, f: impl FnOnce(EventHandlers) -> EventHandlers) {
        let mut guard = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        let current = std::mem::take(&mut *guard);
        *guard = f(current);
    }

    pub fn snapshot(&self) -> EventHandlers {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn pick<T>(&self, f: impl FnOnce(&EventHandlers) -> Option<T>) -> Option<T> {
        f(&self.handlers.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn emit_started(&self) {
        if let Some(h) = self.pick(|h| h.started.clone()) {
            h();
        }
    }

    pub fn emit_restarted(&self) {
        if let Some(h) = self.pick(|h| h.restarted.clone()) {
            h();
        }
    }

    pub fn emit_stopped(&self) {
        if let Some(h) = self.pick(|h| h.stopped.clone()) {
            h();
        }
    }

    pub fn emit_error(&self, error: &ClientError) {
        if let Some(h) = self.pick(|h| h.error.clone()) {
            h(error);
        }
    }

    pub fn emit_state_change(&self, state: ClientState) {
        if let Some(h) = self.pick(|h| h.state_change.clone()) {
            h(state);
        }
    }

    /// Returns false when no message handler is registered.
    pub fn emit_message(&self, payload: Payload, delivery: Delivery) -> bool {
        match self.pick(|h| h.message.clone()) {
            Some(h) => {
                h(payload, delivery);
                true
            }
            None => false,
        }
    }

    /// Returns false when no malformed handler is registered.
    pub fn emit_malformed(&self, message: MalformedMessage) -> bool {
        match self.pick(|h| h.malformed.clone()) {
            Some(h) => {
                h(message);
                true
            }
            None => false,
        }
    }
}
