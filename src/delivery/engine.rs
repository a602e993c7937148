//! Delivery engine
//!
//! One `DeliveryEngine` exists per subscription. It turns routed inbound
//! frames into application deliveries and settles them again:
//! - at-most-once messages are handed over immediately with no bookkeeping
//! - at-least-once messages first acquire one unit of credit; when none is
//!   left `admit` waits, which suspends the subscription's dispatch stream
//!   until a confirmation returns credit
//! - malformed frames are handed over in order without touching credit, but
//!   are still tracked for acknowledgement when they carry a delivery id
//!
//! Concurrency notes:
//! - the state mutex is never held across an `.await` or while application
//!   code runs, so `confirm` may be called from inside a handler
//! - `drain` stops admission but keeps confirmations working, so `stop` can
//!   let running handlers settle what they hold before `close` abandons it
//! - every session gets a new epoch; deliveries from an older epoch are
//!   abandoned and confirming them is a no-op (the broker redelivers them)

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::{debug, warn};

use super::credit::{CreditLedger, Release};
use super::message::{Confirmation, Delivery, DeliveryMessage, Destination, MalformedMessage, Payload};
use crate::subscription::{QoS, SubscribeOptions, SubscriptionKey, TopicPattern};
use crate::transport::OutboundLink;
use crate::transport::message::{ClientFrame, InboundMessage, PartialEnvelope};
use crate::utils::MalformedMessageError;

/// A frame routed to a subscription, tagged with the session it arrived on.
#[derive(Debug)]
pub(crate) struct Inbound {
    pub epoch: u64,
    pub raw: Vec<u8>,
    pub received_at: DateTime<Utc>,
    pub kind: InboundKind,
}

#[derive(Debug)]
pub(crate) enum InboundKind {
    Message(InboundMessage),
    Malformed {
        envelope: PartialEnvelope,
        reason: String,
    },
}

/// What the dispatch stream hands to the application.
#[derive(Debug)]
pub(crate) enum Dispatch {
    Message(Payload, Delivery),
    Malformed(MalformedMessage),
}

#[derive(Debug)]
struct EngineState {
    ledger: CreditLedger,
    epoch: u64,
    closed: bool,
    draining: bool,
    next_tag: u64,
}

impl EngineState {
    fn admits(&self, epoch: u64) -> bool {
        !self.closed && !self.draining && self.epoch == epoch
    }
}

#[derive(Debug)]
pub(crate) struct DeliveryEngine {
    key: SubscriptionKey,
    pattern: TopicPattern,
    options: SubscribeOptions,
    link: Arc<OutboundLink>,
    state: Mutex<EngineState>,
    credit_available: Notify,
    settled: Notify,
    me: Weak<DeliveryEngine>,
}

impl DeliveryEngine {
    pub(crate) fn new(
        pattern: TopicPattern,
        share: Option<&str>,
        options: SubscribeOptions,
        link: Arc<OutboundLink>,
        epoch: u64,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            key: SubscriptionKey::new(pattern.as_str(), share),
            state: Mutex::new(EngineState {
                ledger: CreditLedger::new(options.credit),
                epoch,
                closed: false,
                draining: false,
                next_tag: 0,
            }),
            pattern,
            options,
            link,
            credit_available: Notify::new(),
            settled: Notify::new(),
            me: me.clone(),
        })
    }

    pub(crate) fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    pub(crate) fn options(&self) -> &SubscribeOptions {
        &self.options
    }

    pub(crate) fn credit_remaining(&self) -> Option<u32> {
        self.lock().ledger.remaining()
    }

    pub(crate) fn pending_confirmations(&self) -> usize {
        self.lock().ledger.pending()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// True once the engine no longer admits frames.
    pub(crate) fn is_stopping(&self) -> bool {
        let st = self.lock();
        st.closed || st.draining
    }

    pub(crate) fn is_pending(&self, tag: u64, epoch: u64) -> bool {
        let st = self.lock();
        !st.closed && st.epoch == epoch && st.ledger.is_pending(tag)
    }

    /// Admit one routed frame, waiting for credit when the subscription is
    /// at-least-once. Returns `None` for frames that must not be dispatched:
    /// the engine is draining or closed, or the frame belongs to an earlier
    /// session.
    pub(crate) async fn admit(&self, inbound: Inbound) -> Option<Dispatch> {
        let Inbound {
            epoch,
            raw,
            received_at,
            kind,
        } = inbound;

        let msg = match kind {
            InboundKind::Message(msg) => msg,
            InboundKind::Malformed { envelope, reason } => {
                return self.admit_malformed(epoch, raw, received_at, envelope, reason);
            }
        };

        if !self.pattern.matches(&msg.topic) {
            warn!(
                "Topic '{}' routed to {} does not match its pattern",
                msg.topic, self.key
            );
        }

        let InboundMessage {
            delivery_id,
            topic,
            encoding,
            body,
            ttl_ms,
            ..
        } = msg;

        let payload = match Payload::decode(&encoding, body) {
            Ok(payload) => payload,
            Err(reason) => {
                let envelope = PartialEnvelope {
                    delivery_id: Some(delivery_id),
                    topic: Some(topic),
                    pattern: self.key.pattern.clone(),
                    share: self.key.share.clone(),
                    ttl_ms,
                };
                return self.admit_malformed(epoch, raw, received_at, envelope, reason);
            }
        };

        let confirmation = match self.options.qos {
            QoS::AtMostOnce => {
                if !self.is_current(epoch) {
                    return None;
                }
                Confirmation::none()
            }
            QoS::AtLeastOnce => {
                let tag = self.acquire_credit(epoch).await?;
                Confirmation::new(self.me.clone(), tag, epoch, delivery_id.clone())
            }
        };

        debug!("Delivering {delivery_id} on {} (topic {topic})", self.key);
        let delivery = self.delivery(topic, ttl_ms, received_at, Some(delivery_id), confirmation);
        Some(Dispatch::Message(payload, delivery))
    }

    fn admit_malformed(
        &self,
        epoch: u64,
        raw: Vec<u8>,
        received_at: DateTime<Utc>,
        envelope: PartialEnvelope,
        reason: String,
    ) -> Option<Dispatch> {
        let confirmation = {
            let mut st = self.lock();
            if !st.admits(epoch) {
                return None;
            }
            match (self.options.qos, &envelope.delivery_id) {
                (QoS::AtLeastOnce, Some(id)) => {
                    let tag = st.next_tag;
                    st.next_tag += 1;
                    st.ledger.track(tag);
                    Confirmation::new(self.me.clone(), tag, epoch, id.clone())
                }
                _ => Confirmation::none(),
            }
        };

        debug!("Malformed message on {}: {reason}", self.key);
        let error = MalformedMessageError::new(envelope.topic.clone(), reason);
        let delivery = self.delivery(
            envelope.topic.unwrap_or_default(),
            envelope.ttl_ms,
            received_at,
            envelope.delivery_id,
            confirmation,
        );
        Some(Dispatch::Malformed(MalformedMessage {
            raw,
            error,
            delivery: Some(delivery),
        }))
    }

    async fn acquire_credit(&self, epoch: u64) -> Option<u64> {
        let mut suspended = false;
        loop {
            {
                let mut st = self.lock();
                if !st.admits(epoch) {
                    return None;
                }
                let tag = st.next_tag;
                if st.ledger.try_acquire(tag) {
                    st.next_tag += 1;
                    if suspended {
                        debug!("Credit replenished on {}, resuming delivery", self.key);
                    }
                    return Some(tag);
                }
            }
            if !suspended {
                debug!("Credit exhausted on {}, suspending delivery", self.key);
                suspended = true;
            }
            self.credit_available.notified().await;
        }
    }

    /// Settle one delivery. See [`DeliveryMessage::confirm_delivery`].
    pub(crate) fn confirm(&self, tag: u64, epoch: u64, delivery_id: &str) -> bool {
        let (credit_returned, all_settled) = {
            let mut st = self.lock();
            if st.closed || st.epoch != epoch {
                debug!("Ignoring confirmation of abandoned delivery {delivery_id} on {}", self.key);
                return false;
            }
            match st.ledger.release(tag) {
                Release::NotPending => return false,
                Release::Released { credit_returned } => (credit_returned, st.ledger.pending() == 0),
            }
        };

        self.link.send_in(
            epoch,
            &ClientFrame::Ack {
                delivery_id: delivery_id.to_string(),
            },
        );
        if credit_returned {
            if self.options.credit.is_some() {
                self.link.send_in(
                    epoch,
                    &ClientFrame::Flow {
                        pattern: self.key.pattern.clone(),
                        share: self.key.share.clone(),
                        credit: 1,
                    },
                );
            }
            self.credit_available.notify_one();
        }
        if all_settled {
            self.settled.notify_waiters();
        }
        debug!("Confirmed {delivery_id} on {}", self.key);
        true
    }

    /// Stops admitting frames while leaving confirmations working. A stream
    /// waiting for credit is woken and ends.
    pub(crate) fn drain(&self) {
        self.lock().draining = true;
        self.credit_available.notify_one();
    }

    /// Resolves once no delivery is waiting for confirmation.
    pub(crate) async fn settled(&self) {
        loop {
            let notified = self.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let st = self.lock();
                if st.closed || st.ledger.pending() == 0 {
                    return;
                }
            }
            notified.await;
        }
    }

    /// Move to a new session epoch, abandoning every unconfirmed delivery.
    pub(crate) fn reset(&self, epoch: u64) -> usize {
        let abandoned = {
            let mut st = self.lock();
            st.epoch = epoch;
            st.ledger.abandon_all()
        };
        if abandoned > 0 {
            warn!("Abandoned {abandoned} unconfirmed deliveries on {}", self.key);
        }
        self.credit_available.notify_one();
        self.settled.notify_waiters();
        abandoned
    }

    /// Stop admitting frames. Unconfirmed deliveries are abandoned.
    pub(crate) fn close(&self) -> usize {
        let abandoned = {
            let mut st = self.lock();
            st.closed = true;
            st.ledger.abandon_all()
        };
        if abandoned > 0 {
            warn!("Abandoned {abandoned} unconfirmed deliveries on {}", self.key);
        }
        self.credit_available.notify_one();
        self.settled.notify_waiters();
        abandoned
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.lock().admits(epoch)
    }

    fn delivery(
        &self,
        topic: String,
        ttl_ms: Option<u64>,
        received_at: DateTime<Utc>,
        delivery_id: Option<String>,
        confirmation: Confirmation,
    ) -> Delivery {
        Delivery {
            message: DeliveryMessage {
                topic,
                ttl: ttl_ms.map(Duration::from_millis),
                received_at,
                delivery_id,
                confirmation,
            },
            destination: Destination {
                topic_pattern: self.key.pattern.clone(),
                share: self.key.share.clone(),
            },
        }
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
