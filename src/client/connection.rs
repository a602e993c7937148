//! Connection manager
//!
//! A `Client` owns at most one broker session at a time. `start` walks the
//! configured services in order until one completes the `open` handshake,
//! then spawns a worker task that drains the session and routes every frame:
//! messages go to the owning subscription's dispatch stream, request replies
//! resolve whoever is waiting for them.
//!
//! Each session is numbered with a fresh epoch. Deliveries, outbound frames
//! and waiters are tagged with the epoch they belong to, so work left over
//! from a dead session can never leak into the next one.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::options::{ClientOptions, ServiceUrl, ValidatedOptions};
use super::requests::{PendingRequests, Waiter};
use crate::delivery::engine::{DeliveryEngine, Inbound, InboundKind};
use crate::delivery::{MalformedMessage, Payload, Delivery};
use crate::dispatch::stream::spawn_stream;
use crate::dispatch::{EventDispatcher, EventHandlers};
use crate::subscription::options::duration_ms;
use crate::subscription::registry::{Registry, RegistryEntry};
use crate::subscription::{
    SubscribeOptions, Subscription, SubscriptionKey, UnsubscribeOptions, validate_request,
};
use crate::transport::message::{
    ClientFrame, ParsedFrame, ServerFrame, encode_client_frame, parse_server_frame,
};
use crate::transport::{Connector, OutboundLink, TransportSession, WebSocketConnector};
use crate::utils::{ClientError, MalformedMessageError, Result, TransportError};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientState {
    Connecting,
    Connected,
    Disconnected,
    Stopped,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Creates a client that connects over WebSocket.
pub fn create_client(options: ClientOptions) -> Result<Client> {
    Client::new(options, WebSocketConnector::new())
}

/// A messaging client. Clones share the same connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ActiveSession {
    epoch: u64,
    endpoint: ServiceUrl,
    worker: JoinHandle<()>,
}

struct ClientInner {
    options: ValidatedOptions,
    connector: Arc<dyn Connector>,
    events: Arc<EventDispatcher>,
    state: watch::Sender<ClientState>,
    link: Arc<OutboundLink>,
    session: Mutex<Option<ActiveSession>>,
    registry: Mutex<Registry>,
    requests: Mutex<PendingRequests>,
    epoch: AtomicU64,
    lifecycle: tokio::sync::Mutex<()>,
    has_started: AtomicBool,
    stopping: AtomicBool,
}

impl Client {
    /// Validates `options` and builds a client in the `Disconnected` state.
    /// Nothing is sent over the network until [`start`](Self::start).
    pub fn new(options: ClientOptions, connector: impl Connector) -> Result<Self> {
        let options = options.validate()?;
        let (state, _) = watch::channel(ClientState::Disconnected);
        debug!("Created client {}", options.client_id);
        Ok(Self {
            inner: Arc::new(ClientInner {
                options,
                connector: Arc::new(connector),
                events: Arc::new(EventDispatcher::default()),
                state,
                link: Arc::new(OutboundLink::default()),
                session: Mutex::new(None),
                registry: Mutex::new(Registry::new()),
                requests: Mutex::new(PendingRequests::default()),
                epoch: AtomicU64::new(0),
                lifecycle: tokio::sync::Mutex::new(()),
                has_started: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.inner.options.client_id
    }

    /// The endpoint of the current session, with any password redacted.
    pub fn service(&self) -> Option<String> {
        self.inner
            .session()
            .as_ref()
            .map(|s| s.endpoint.to_string())
    }

    pub fn state(&self) -> ClientState {
        self.inner.current_state()
    }

    pub fn state_changes(&self) -> watch::Receiver<ClientState> {
        self.inner.state.subscribe()
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.registry().len()
    }

    /// The live subscription for `pattern` and `share`, if any.
    pub fn subscription(&self, pattern: &str, share: Option<&str>) -> Option<Subscription> {
        let key = SubscriptionKey::new(pattern, share);
        self.inner.registry().get(&key).map(|entry| Subscription {
            engine: entry.engine.clone(),
        })
    }

    /// Replaces every registered handler.
    pub fn set_handlers(&self, handlers: EventHandlers) -> &Self {
        self.inner.events.update(|_| handlers);
        self
    }

    pub fn on_started(&self, f: impl Fn() + Send + Sync + 'static) -> &Self {
        self.inner.events.update(|h| h.on_started(f));
        self
    }

    pub fn on_restarted(&self, f: impl Fn() + Send + Sync + 'static) -> &Self {
        self.inner.events.update(|h| h.on_restarted(f));
        self
    }

    pub fn on_stopped(&self, f: impl Fn() + Send + Sync + 'static) -> &Self {
        self.inner.events.update(|h| h.on_stopped(f));
        self
    }

    pub fn on_error(&self, f: impl Fn(&ClientError) + Send + Sync + 'static) -> &Self {
        self.inner.events.update(|h| h.on_error(f));
        self
    }

    pub fn on_state_change(&self, f: impl Fn(ClientState) + Send + Sync + 'static) -> &Self {
        self.inner.events.update(|h| h.on_state_change(f));
        self
    }

    pub fn on_message(&self, f: impl Fn(Payload, Delivery) + Send + Sync + 'static) -> &Self {
        self.inner.events.update(|h| h.on_message(f));
        self
    }

    pub fn on_malformed(&self, f: impl Fn(MalformedMessage) + Send + Sync + 'static) -> &Self {
        self.inner.events.update(|h| h.on_malformed(f));
        self
    }

    /// Connects to the first service that accepts the `open` handshake.
    ///
    /// Registered subscriptions are re-established on the new session and
    /// their unconfirmed deliveries are abandoned. Calling `start` while
    /// connected does nothing; after [`stop`](Self::stop) it fails with
    /// [`ClientError::Closed`].
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        let _guard = inner.lifecycle.lock().await;
        if inner.is_stopping() {
            return Err(ClientError::closed("start"));
        }

        match inner.current_state() {
            ClientState::Stopped => return Err(ClientError::closed("start")),
            ClientState::Connected => return Ok(()),
            _ => {}
        }
        inner.transition(ClientState::Connecting);

        let mut state = inner.state.subscribe();
        let mut last_error = None;
        for endpoint in &inner.options.endpoints {
            debug!("Connecting {} to {endpoint}", inner.options.client_id);
            let outcome = tokio::select! {
                outcome = inner.open_session(endpoint) => outcome,
                _ = wait_for_stop(&mut state) => return Err(ClientError::closed("start")),
            };
            match outcome {
                Ok(session) => return inner.activate(endpoint.clone(), session),
                Err(e) => {
                    warn!("Failed to connect to {endpoint}: {}", e.reason);
                    last_error = Some(e);
                }
            }
        }

        let err = ClientError::from(last_error.unwrap_or_else(|| {
            TransportError::new("<none>", "no service to connect to")
        }));
        if inner.transition_from(ClientState::Connecting, ClientState::Disconnected) {
            inner.events.emit_error(&err);
            Err(err)
        } else {
            Err(ClientError::closed("start"))
        }
    }

    /// Stops the client for good.
    ///
    /// Requests still in flight fail with [`ClientError::Closed`] and no
    /// further messages are dispatched. Handlers that are already running
    /// get a bounded grace period to return and confirm what they hold;
    /// deliveries still unconfirmed after that are abandoned. The client
    /// then moves to `Stopped` and drops the session. Stopping twice does
    /// nothing.
    pub async fn stop(&self) {
        let inner = &self.inner;
        if inner.stopping.swap(true, Ordering::SeqCst) {
            return;
        }

        let cancelled = inner
            .requests()
            .fail_all(|request| ClientError::closed(request.operation));
        if cancelled > 0 {
            debug!("Cancelled {cancelled} in-flight requests");
        }

        let (engines, streams): (Vec<_>, Vec<_>) = inner
            .registry()
            .drain()
            .into_iter()
            .map(|entry| {
                entry.engine.drain();
                (entry.engine, entry.stream)
            })
            .unzip();
        let drained = async {
            join_all(streams).await;
            join_all(engines.iter().map(|engine| engine.settled())).await;
        };
        if tokio::time::timeout(inner.options.drain_timeout, drained)
            .await
            .is_err()
        {
            warn!("Timed out waiting for message handlers to settle their deliveries");
        }
        for engine in &engines {
            engine.close();
        }

        if inner.state.send_replace(ClientState::Stopped) != ClientState::Stopped {
            inner.events.emit_state_change(ClientState::Stopped);
        }
        let session = inner.session().take();
        if let Some(session) = session {
            inner.link.send(&ClientFrame::Close);
            inner.link.detach();
            session.worker.abort();
            info!(
                "Client {} disconnected from {}",
                inner.options.client_id, session.endpoint
            );
        }
        inner.epoch.fetch_add(1, Ordering::SeqCst);
        info!("Client {} stopped", inner.options.client_id);
        inner.events.emit_stopped();
    }

    /// Subscribes to `pattern`, optionally as a member of the share group
    /// `share`. Completes once the broker has accepted the subscription.
    pub async fn subscribe(
        &self,
        pattern: &str,
        share: Option<&str>,
        options: SubscribeOptions,
    ) -> Result<Subscription> {
        let parsed = validate_request(pattern, share, &options)?;
        let inner = &self.inner;
        let epoch = inner.connected_epoch("subscribe", pattern, share)?;

        let key = SubscriptionKey::new(pattern, share);
        let engine = DeliveryEngine::new(parsed, share, options, inner.link.clone(), epoch);
        {
            let (tx, rx) = mpsc::unbounded_channel();
            let stream = spawn_stream(engine.clone(), rx, inner.events.clone());
            let entry = RegistryEntry {
                engine: engine.clone(),
                inbound: tx,
                stream,
            };
            let mut registry = inner.registry();
            if inner.is_stopping() {
                entry.engine.close();
                entry.stream.abort();
                return Err(ClientError::closed("subscribe"));
            }
            if let Err(rejected) = registry.insert(entry) {
                rejected.engine.close();
                rejected.stream.abort();
                return Err(ClientError::subscription(pattern, share, "already subscribed"));
            }
        }

        let (request_id, reply) = inner.requests().register("subscribe", key.clone());
        let frame = subscribe_frame(request_id, &engine);
        if !inner.link.send_in(epoch, &frame) {
            inner.requests().take(request_id);
            inner.discard(&key, &engine);
            return Err(ClientError::subscription(pattern, share, "client is not connected"));
        }

        match inner.await_reply(reply, "subscribe").await {
            Ok(()) => {
                info!(
                    "Subscribed to {key} ({}, credit {:?})",
                    engine.options().qos,
                    engine.options().credit
                );
                Ok(Subscription { engine })
            }
            Err(e) => {
                inner.discard(&key, &engine);
                Err(e)
            }
        }
    }

    /// Removes `subscription`. Its dispatch stream stops and deliveries it
    /// has not confirmed yet are abandoned.
    pub async fn unsubscribe(
        &self,
        subscription: &Subscription,
        options: UnsubscribeOptions,
    ) -> Result<()> {
        let inner = &self.inner;
        let key = subscription.key().clone();
        let epoch = inner.connected_epoch("unsubscribe", &key.pattern, key.share.as_deref())?;
        if !inner.registry().holds(&subscription.engine) {
            return Err(ClientError::subscription(
                &key.pattern,
                key.share.as_deref(),
                "not subscribed",
            ));
        }

        let (request_id, reply) = inner.requests().register("unsubscribe", key.clone());
        let frame = ClientFrame::Unsubscribe {
            request_id,
            pattern: key.pattern.clone(),
            share: key.share.clone(),
            ttl_ms: options.ttl.map(duration_ms),
        };
        if !inner.link.send_in(epoch, &frame) {
            inner.requests().take(request_id);
            return Err(ClientError::subscription(
                &key.pattern,
                key.share.as_deref(),
                "client is not connected",
            ));
        }

        inner.await_reply(reply, "unsubscribe").await?;
        inner.discard(&key, &subscription.engine);
        info!("Unsubscribed from {key}");
        Ok(())
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("service", &self.service())
            .field("subscriptions", &self.subscription_count())
            .finish()
    }
}

impl ClientInner {
    fn current_state(&self) -> ClientState {
        *self.state.borrow()
    }

    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Moves to `to` unless the client is stopped.
    fn transition(&self, to: ClientState) -> bool {
        let changed = self.state.send_if_modified(|s| {
            if *s == ClientState::Stopped || *s == to {
                return false;
            }
            *s = to;
            true
        });
        if changed {
            self.events.emit_state_change(to);
        }
        changed
    }

    fn transition_from(&self, from: ClientState, to: ClientState) -> bool {
        let changed = self.state.send_if_modified(|s| {
            if *s != from {
                return false;
            }
            *s = to;
            true
        });
        if changed {
            self.events.emit_state_change(to);
        }
        changed
    }

    async fn open_session(&self, endpoint: &ServiceUrl) -> std::result::Result<TransportSession, TransportError> {
        let failure = |reason: &str| TransportError::new(endpoint.to_string(), reason);

        let mut session = self.connector.connect(endpoint).await?;
        let open = ClientFrame::Open {
            client_id: self.options.client_id.clone(),
            username: endpoint.username().map(str::to_string),
            password: endpoint.password().map(str::to_string),
        };
        let bytes = encode_client_frame(&open).map_err(|e| failure(&e.to_string()))?;
        session
            .outgoing
            .send(bytes)
            .map_err(|_| failure("session closed during handshake"))?;

        let reply = tokio::time::timeout(HANDSHAKE_TIMEOUT, session.incoming.recv())
            .await
            .map_err(|_| failure("timed out waiting for the broker to open the session"))?;
        match reply {
            None => Err(failure("session closed during handshake")),
            Some(Err(e)) => Err(e),
            Some(Ok(raw)) => match parse_server_frame(&raw) {
                ParsedFrame::Frame(ServerFrame::Opened) => Ok(session),
                ParsedFrame::Frame(ServerFrame::Error { message, .. }) => {
                    Err(failure(&format!("broker refused the session: {message}")))
                }
                _ => Err(failure("unexpected frame during handshake")),
            },
        }
    }

    /// Makes a freshly opened session the current one.
    fn activate(self: &Arc<Self>, endpoint: ServiceUrl, session: TransportSession) -> Result<()> {
        if self.is_stopping() {
            return Err(ClientError::closed("start"));
        }
        let TransportSession { outgoing, incoming } = session;
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.link.attach(epoch, outgoing);

        let engines = self.registry().engines();
        for engine in &engines {
            engine.reset(epoch);
            let request_id = self
                .requests()
                .register_background("subscribe", engine.key().clone());
            self.link.send_in(epoch, &subscribe_frame(request_id, engine));
        }

        let worker = tokio::spawn(run_worker(
            Arc::downgrade(self),
            epoch,
            endpoint.to_string(),
            incoming,
        ));
        *self.session() = Some(ActiveSession {
            epoch,
            endpoint: endpoint.clone(),
            worker,
        });

        if !self.transition_from(ClientState::Connecting, ClientState::Connected) {
            // stopped while the handshake completed
            if let Some(session) = self.session().take() {
                session.worker.abort();
            }
            self.link.detach();
            return Err(ClientError::closed("start"));
        }

        info!(
            "Client {} connected to {endpoint} ({} subscriptions restored)",
            self.options.client_id,
            engines.len()
        );
        if self.has_started.swap(true, Ordering::SeqCst) {
            self.events.emit_restarted();
        } else {
            self.events.emit_started();
        }
        Ok(())
    }

    /// Epoch of the current session, or the error an operation gets when the
    /// client cannot reach the broker.
    fn connected_epoch(&self, operation: &str, pattern: &str, share: Option<&str>) -> Result<u64> {
        if self.is_stopping() {
            return Err(ClientError::closed(operation));
        }
        match self.current_state() {
            ClientState::Stopped => Err(ClientError::closed(operation)),
            ClientState::Connected => self
                .session()
                .as_ref()
                .map(|s| s.epoch)
                .ok_or_else(|| ClientError::subscription(pattern, share, "client is not connected")),
            other => Err(ClientError::subscription(
                pattern,
                share,
                format!("client is not connected (state: {other})"),
            )),
        }
    }

    async fn await_reply(
        &self,
        reply: oneshot::Receiver<Result<()>>,
        operation: &str,
    ) -> Result<()> {
        let mut state = self.state.subscribe();
        tokio::select! {
            outcome = reply => outcome.unwrap_or_else(|_| Err(ClientError::closed(operation))),
            _ = wait_for_stop(&mut state) => Err(ClientError::closed(operation)),
        }
    }

    fn discard(&self, key: &SubscriptionKey, engine: &Arc<DeliveryEngine>) {
        engine.close();
        // dropping the entry closes the queue, which ends the stream
        self.registry().remove_engine(key, engine);
    }

    fn route(&self, epoch: u64, endpoint: &str, raw: Vec<u8>) {
        let received_at = Utc::now();
        match parse_server_frame(&raw) {
            ParsedFrame::Frame(ServerFrame::Message(message)) => {
                let key = SubscriptionKey::new(message.pattern.clone(), message.share.as_deref());
                let inbound = Inbound {
                    epoch,
                    raw,
                    received_at,
                    kind: InboundKind::Message(message),
                };
                if self.enqueue(&key, inbound).is_err() {
                    debug!("Dropping message for unknown subscription {key}");
                }
            }
            ParsedFrame::Frame(ServerFrame::Subscribed { request_id })
            | ParsedFrame::Frame(ServerFrame::Unsubscribed { request_id }) => {
                self.resolve(request_id, Ok(()));
            }
            ParsedFrame::Frame(ServerFrame::Error {
                request_id: Some(request_id),
                message,
            }) => self.resolve(request_id, Err(message)),
            ParsedFrame::Frame(ServerFrame::Error {
                request_id: None,
                message,
            }) => {
                warn!("Broker error on {endpoint}: {message}");
                let err = TransportError::new(endpoint, format!("broker error: {message}"));
                self.events.emit_error(&err.into());
            }
            ParsedFrame::Frame(ServerFrame::Opened) => {
                debug!("Ignoring repeated open acknowledgement from {endpoint}");
            }
            ParsedFrame::Malformed {
                envelope: Some(envelope),
                reason,
            } => {
                let key = SubscriptionKey::new(envelope.pattern.clone(), envelope.share.as_deref());
                let topic = envelope.topic.clone();
                let inbound = Inbound {
                    epoch,
                    raw,
                    received_at,
                    kind: InboundKind::Malformed { envelope, reason },
                };
                if let Err(inbound) = self.enqueue(&key, inbound) {
                    let InboundKind::Malformed { reason, .. } = inbound.kind else {
                        return;
                    };
                    self.unattributed(inbound.raw, topic, reason);
                }
            }
            ParsedFrame::Malformed {
                envelope: None,
                reason,
            } => self.unattributed(raw, None, reason),
        }
    }

    fn enqueue(&self, key: &SubscriptionKey, inbound: Inbound) -> std::result::Result<(), Inbound> {
        let registry = self.registry();
        match registry.get(key) {
            Some(entry) => entry.inbound.send(inbound).map_err(|e| e.0),
            None => Err(inbound),
        }
    }

    fn unattributed(&self, raw: Vec<u8>, topic: Option<String>, reason: String) {
        warn!("Received a malformed frame that matches no subscription: {reason}");
        self.events.emit_malformed(MalformedMessage {
            raw,
            error: MalformedMessageError::new(topic, reason),
            delivery: None,
        });
    }

    fn resolve(&self, request_id: u64, outcome: std::result::Result<(), String>) {
        let Some(request) = self.requests().take(request_id) else {
            debug!("Reply to unknown request {request_id}");
            return;
        };
        let key = request.key;
        let outcome = outcome.map_err(|reason| {
            ClientError::subscription(&key.pattern, key.share.as_deref(), reason)
        });
        match request.waiter {
            Waiter::Caller(tx) => {
                let _ = tx.send(outcome);
            }
            Waiter::Background => match outcome {
                Ok(()) => debug!("Restored subscription {key}"),
                Err(e) => {
                    warn!("Failed to restore subscription {key}: {e}");
                    self.events.emit_error(&e);
                }
            },
        }
    }

    fn session_lost(&self, epoch: u64, error: TransportError) {
        {
            let mut session = self.session();
            match &*session {
                Some(active) if active.epoch == epoch => *session = None,
                _ => return,
            }
        }
        if self.is_stopping() {
            return;
        }
        self.link.detach();

        let next = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        for engine in self.registry().engines() {
            engine.reset(next);
        }

        let err = ClientError::from(error);
        self.requests().fail_all(|_| err.clone());
        warn!("Client {} lost its session: {err}", self.options.client_id);
        if self.transition_from(ClientState::Connected, ClientState::Disconnected) {
            self.events.emit_error(&err);
        }
    }

    fn session(&self) -> MutexGuard<'_, Option<ActiveSession>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn requests(&self) -> MutexGuard<'_, PendingRequests> {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn subscribe_frame(request_id: u64, engine: &DeliveryEngine) -> ClientFrame {
    let key = engine.key();
    let options = engine.options();
    ClientFrame::Subscribe {
        request_id,
        pattern: key.pattern.clone(),
        share: key.share.clone(),
        qos: options.qos.as_u8(),
        ttl_ms: options.ttl.map(duration_ms),
        credit: options.credit,
    }
}

async fn wait_for_stop(state: &mut watch::Receiver<ClientState>) {
    if state.wait_for(|s| *s == ClientState::Stopped).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Drains one session until it ends, then reports the loss.
async fn run_worker(
    client: Weak<ClientInner>,
    epoch: u64,
    endpoint: String,
    mut incoming: UnboundedReceiver<std::result::Result<Vec<u8>, TransportError>>,
) {
    let failure = loop {
        match incoming.recv().await {
            Some(Ok(raw)) => match client.upgrade() {
                Some(inner) => inner.route(epoch, &endpoint, raw),
                None => return,
            },
            Some(Err(e)) => break e,
            None => break TransportError::new(endpoint.as_str(), "session closed by the broker"),
        }
    };
    if let Some(inner) = client.upgrade() {
        inner.session_lost(epoch, failure);
    }
}
