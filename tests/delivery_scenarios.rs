use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tempfile::NamedTempFile;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::time::timeout;

use subflow::transport::message::{ClientFrame, InboundMessage, ServerFrame};
use subflow::transport::{MemoryBroker, MemoryBrokerSession, MemoryConnector};
use subflow::{
    Client, ClientError, ClientOptions, ClientState, Delivery, MalformedMessage, QoS,
    SubscribeOptions, Subscription, UnsubscribeOptions, create_client,
};

const QUIET: Duration = Duration::from_millis(100);
const PATIENCE: Duration = Duration::from_secs(2);

async fn connected(options: ClientOptions) -> (Client, MemoryBrokerSession, MemoryBroker) {
    let (connector, mut broker) = MemoryConnector::pair();
    let client = Client::new(options, connector).unwrap();
    let (started, accepted) = tokio::join!(client.start(), broker.accept_open());
    started.unwrap();
    let (session, _) = accepted.unwrap();
    (client, session, broker)
}

async fn subscribe(
    client: &Client,
    session: &mut MemoryBrokerSession,
    pattern: &str,
    share: Option<&str>,
    options: SubscribeOptions,
) -> Subscription {
    let (subscribed, frame) = tokio::join!(
        client.subscribe(pattern, share, options),
        session.next_frame_accepting()
    );
    assert!(matches!(frame, Some(ClientFrame::Subscribe { .. })));
    subscribed.unwrap()
}

fn message(id: &str, topic: &str, pattern: &str, body: &str) -> ServerFrame {
    ServerFrame::Message(InboundMessage {
        delivery_id: id.to_string(),
        topic: topic.to_string(),
        pattern: pattern.to_string(),
        share: None,
        encoding: "text".to_string(),
        body: body.to_string(),
        ttl_ms: None,
    })
}

fn deliveries(client: &Client) -> UnboundedReceiver<Delivery> {
    let (tx, rx) = mpsc::unbounded_channel();
    client.on_message(move |_, delivery| {
        let _ = tx.send(delivery);
    });
    rx
}

async fn next<T>(rx: &mut UnboundedReceiver<T>) -> T {
    timeout(PATIENCE, rx.recv())
        .await
        .expect("timed out")
        .expect("channel closed")
}

fn id(delivery: &Delivery) -> &str {
    delivery.message.delivery_id.as_deref().unwrap_or_default()
}

#[tokio::test]
async fn subscribe_reports_configured_credit() {
    let (client, mut session, _broker) = connected(ClientOptions::default()).await;
    let cases = [
        ("public", None, QoS::AtMostOnce, None),
        ("sports/+/score", Some("fans"), QoS::AtLeastOnce, Some(1)),
        ("sports/#", None, QoS::AtLeastOnce, Some(10)),
        ("#", Some("all"), QoS::AtMostOnce, Some(3)),
    ];
    for (pattern, share, qos, credit) in cases {
        let options = SubscribeOptions {
            qos,
            credit,
            ..SubscribeOptions::default()
        };
        let sub = subscribe(&client, &mut session, pattern, share, options).await;
        assert_eq!(sub.credit_remaining(), credit);
        assert_eq!(sub.pending_confirmations(), 0);
        assert_eq!(sub.share(), share);
        assert_eq!(sub.qos(), qos);
    }
    assert_eq!(client.subscription_count(), 4);
    assert!(client.subscription("sports/#", None).is_some());
}

#[tokio::test]
async fn subscribe_frame_carries_options() {
    let (client, mut session, _broker) = connected(ClientOptions::default()).await;
    let options = SubscribeOptions::at_least_once()
        .with_ttl(Duration::from_secs(2))
        .with_credit(4);
    let (_, frame) = tokio::join!(
        client.subscribe("a/+", Some("g"), options),
        session.next_frame_accepting()
    );
    match frame {
        Some(ClientFrame::Subscribe {
            pattern,
            share,
            qos,
            ttl_ms,
            credit,
            ..
        }) => {
            assert_eq!(pattern, "a/+");
            assert_eq!(share.as_deref(), Some("g"));
            assert_eq!(qos, 1);
            assert_eq!(ttl_ms, Some(2000));
            assert_eq!(credit, Some(4));
        }
        other => panic!("unexpected frame {other:?}"),
    }
}

#[tokio::test]
async fn confirm_returns_exactly_one_credit() {
    let (client, mut session, _broker) = connected(ClientOptions::default()).await;
    let mut rx = deliveries(&client);
    let options = SubscribeOptions::at_least_once()
        .with_auto_confirm(false)
        .with_credit(2);
    let sub = subscribe(&client, &mut session, "public", None, options).await;

    session.send(&message("d1", "public", "public", "hello"));
    let delivery = next(&mut rx).await;
    assert_eq!(sub.credit_remaining(), Some(1));

    assert!(delivery.message.confirm_delivery());
    assert_eq!(sub.credit_remaining(), Some(2));
    assert!(!delivery.message.confirm_delivery());
    assert!(!delivery.clone().message.confirm_delivery());
    assert_eq!(sub.credit_remaining(), Some(2));

    assert_eq!(
        session.next_frame().await,
        Some(ClientFrame::Ack {
            delivery_id: "d1".into()
        })
    );
    assert_eq!(
        session.next_frame().await,
        Some(ClientFrame::Flow {
            pattern: "public".into(),
            share: None,
            credit: 1
        })
    );
}

#[tokio::test]
async fn credit_exhaustion_suspends_delivery() {
    let (client, mut session, _broker) = connected(ClientOptions::default()).await;
    let mut rx = deliveries(&client);
    let options = SubscribeOptions::at_least_once()
        .with_auto_confirm(false)
        .with_credit(1);
    let sub = subscribe(&client, &mut session, "public", None, options).await;

    session.send(&message("d1", "public", "public", "one"));
    session.send(&message("d2", "public", "public", "two"));

    let first = next(&mut rx).await;
    assert_eq!(id(&first), "d1");
    assert!(timeout(QUIET, rx.recv()).await.is_err());
    assert_eq!(sub.credit_remaining(), Some(0));

    first.message.confirm_delivery();
    let second = next(&mut rx).await;
    assert_eq!(id(&second), "d2");
    assert_eq!(sub.credit_remaining(), Some(0));
}

#[tokio::test]
async fn trust_certificate_with_insecure_service_fails_before_connecting() {
    let cert = NamedTempFile::new().unwrap();
    let result = create_client(ClientOptions::new("amqp://x").with_trust_certificate(cert.path()));
    match result {
        Err(ClientError::Configuration { option, .. }) => {
            assert_eq!(option, "ssl_trust_certificate")
        }
        other => panic!("expected a configuration error, got {other:?}"),
    }

    let (connector, mut broker) = MemoryConnector::pair();
    let result = Client::new(
        ClientOptions::new("amqp://x").with_trust_certificate(cert.path()),
        connector,
    );
    assert!(result.is_err());
    // nothing ever reached the broker
    assert!(!matches!(timeout(QUIET, broker.accept()).await, Ok(Some(_))));
}

#[tokio::test]
async fn three_sequential_deliver_confirm_cycles() {
    let (client, mut session, _broker) = connected(ClientOptions::default()).await;
    let log = Arc::new(Mutex::new(Vec::new()));
    let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();
    let seen = log.clone();
    client.on_message(move |payload, delivery| {
        seen.lock()
            .unwrap()
            .push(format!("deliver:{}", payload.as_text().unwrap_or_default()));
        let _ = tx.send(delivery);
    });

    let confirmer = {
        let log = log.clone();
        tokio::spawn(async move {
            for _ in 0..3 {
                let delivery = next(&mut rx).await;
                tokio::time::sleep(Duration::ZERO).await;
                log.lock().unwrap().push(format!("confirm:{}", id(&delivery)));
                assert!(delivery.message.confirm_delivery());
            }
        })
    };

    let options = SubscribeOptions::at_least_once()
        .with_auto_confirm(false)
        .with_credit(1);
    let sub = subscribe(&client, &mut session, "public", None, options).await;
    for n in 1..=3 {
        session.send(&message(&format!("d{n}"), "public", "public", &format!("d{n}")));
    }
    confirmer.await.unwrap();

    assert_eq!(
        *log.lock().unwrap(),
        vec![
            "deliver:d1",
            "confirm:d1",
            "deliver:d2",
            "confirm:d2",
            "deliver:d3",
            "confirm:d3"
        ]
    );

    let mut acks = Vec::new();
    while acks.len() < 3 {
        if let Some(ClientFrame::Ack { delivery_id }) = session.next_frame().await {
            acks.push(delivery_id);
        }
    }
    assert_eq!(acks, vec!["d1", "d2", "d3"]);
    assert_eq!(sub.credit_remaining(), Some(1));
    assert_eq!(sub.pending_confirmations(), 0);
}

#[tokio::test]
async fn malformed_message_between_valid_messages() {
    let (client, mut session, _broker) = connected(ClientOptions::default()).await;
    let events = Arc::new(Mutex::new(Vec::new()));
    let (on_msg, on_bad) = (events.clone(), events.clone());
    let (bad_tx, mut bad_rx) = mpsc::unbounded_channel::<MalformedMessage>();
    client
        .on_message(move |payload, _| on_msg.lock().unwrap().push(format!("message:{payload}")))
        .on_malformed(move |malformed| {
            on_bad.lock().unwrap().push("malformed".to_string());
            let _ = bad_tx.send(malformed);
        });

    let options = SubscribeOptions::at_least_once().with_credit(1);
    subscribe(&client, &mut session, "public", None, options).await;

    session.send(&message("d1", "public", "public", "first"));
    session.send(&ServerFrame::Message(InboundMessage {
        encoding: "json".into(),
        ..match message("d2", "public", "public", "{broken") {
            ServerFrame::Message(m) => m,
            _ => unreachable!(),
        }
    }));
    session.send(&message("d3", "public", "public", "second"));

    let malformed = next(&mut bad_rx).await;
    assert!(malformed.raw_text().contains("{broken"));
    assert_eq!(malformed.error.topic.as_deref(), Some("public"));
    let delivery = malformed.delivery.expect("attributed to the subscription");
    assert_eq!(delivery.destination.topic_pattern, "public");

    timeout(PATIENCE, async {
        while events.lock().unwrap().len() < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(
        *events.lock().unwrap(),
        vec!["message:first", "malformed", "message:second"]
    );
}

#[tokio::test]
async fn broken_frames_are_reported_as_malformed() {
    let (client, mut session, _broker) = connected(ClientOptions::default()).await;
    let (tx, mut rx) = mpsc::unbounded_channel::<MalformedMessage>();
    client.on_malformed(move |m| {
        let _ = tx.send(m);
    });
    let options = SubscribeOptions::at_least_once()
        .with_auto_confirm(false)
        .with_credit(1);
    let sub = subscribe(&client, &mut session, "public", None, options).await;

    // names the subscription but lacks a body
    let salvaged = json!({"type": "message", "delivery_id": "d7", "topic": "public", "pattern": "public"});
    session.send_raw(salvaged.to_string());
    let attributed = next(&mut rx).await;
    let delivery = attributed.delivery.expect("salvaged envelope");
    assert_eq!(sub.pending_confirmations(), 1);
    assert_eq!(sub.credit_remaining(), Some(1));
    assert!(delivery.message.confirm_delivery());
    assert_eq!(
        session.next_frame().await,
        Some(ClientFrame::Ack {
            delivery_id: "d7".into()
        })
    );

    session.send_raw("garbage");
    let unattributed = next(&mut rx).await;
    assert!(unattributed.delivery.is_none());
    assert_eq!(unattributed.raw, b"garbage");
    assert_eq!(client.state(), ClientState::Connected);
}

#[tokio::test]
async fn stop_abandons_unconfirmed_deliveries_without_error() {
    let options = ClientOptions::default().with_drain_timeout(QUIET);
    let (client, mut session, _broker) = connected(options).await;
    let mut rx = deliveries(&client);
    let errors = Arc::new(Mutex::new(Vec::new()));
    let stopped = Arc::new(Mutex::new(0));
    {
        let errors = errors.clone();
        let stopped = stopped.clone();
        client
            .on_error(move |e| errors.lock().unwrap().push(e.clone()))
            .on_stopped(move || *stopped.lock().unwrap() += 1);
    }
    let options = SubscribeOptions::at_least_once()
        .with_auto_confirm(false)
        .with_credit(5);
    let sub = subscribe(&client, &mut session, "public", None, options).await;

    session.send(&message("d1", "public", "public", "a"));
    session.send(&message("d2", "public", "public", "b"));
    let first = next(&mut rx).await;
    let second = next(&mut rx).await;
    assert_eq!(sub.pending_confirmations(), 2);

    client.stop().await;
    assert!(!first.message.confirm_delivery());
    assert!(!second.message.is_pending());
    assert!(!sub.is_active());
    assert_eq!(client.subscription_count(), 0);
    assert!(errors.lock().unwrap().is_empty());
    assert_eq!(*stopped.lock().unwrap(), 1);

    let mut frames = Vec::new();
    while let Some(frame) = session.next_frame().await {
        frames.push(frame);
    }
    assert_eq!(frames, vec![ClientFrame::Close]);
}

#[tokio::test]
async fn stop_cancels_in_flight_subscribe() {
    let (client, mut session, _broker) = connected(ClientOptions::default()).await;
    let pending = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .subscribe("public", None, SubscribeOptions::default())
                .await
        })
    };
    // read the request but never answer it
    assert!(matches!(
        session.next_frame().await,
        Some(ClientFrame::Subscribe { .. })
    ));

    client.stop().await;
    let result = pending.await.unwrap();
    assert!(matches!(result, Err(ClientError::Closed { .. })));
}

#[tokio::test]
async fn stop_lets_running_handlers_confirm() {
    let (client, mut session, _broker) = connected(ClientOptions::default()).await;
    let (tx, mut confirmed) = mpsc::unbounded_channel::<bool>();
    let (seen_tx, mut seen) = mpsc::unbounded_channel::<()>();
    client.on_message(move |_, delivery| {
        let tx = tx.clone();
        let _ = seen_tx.send(());
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            let _ = tx.send(delivery.message.confirm_delivery());
        });
    });
    let options = SubscribeOptions::at_least_once()
        .with_auto_confirm(false)
        .with_credit(1);
    let sub = subscribe(&client, &mut session, "public", None, options).await;

    session.send(&message("d1", "public", "public", "slow"));
    next(&mut seen).await;
    assert_eq!(sub.pending_confirmations(), 1);

    client.stop().await;
    assert!(next(&mut confirmed).await);
    assert_eq!(client.state(), ClientState::Stopped);

    let mut frames = Vec::new();
    while let Some(frame) = session.next_frame().await {
        frames.push(frame);
    }
    assert_eq!(
        frames,
        vec![
            ClientFrame::Ack {
                delivery_id: "d1".into()
            },
            ClientFrame::Flow {
                pattern: "public".into(),
                share: None,
                credit: 1
            },
            ClientFrame::Close,
        ]
    );
}

#[tokio::test]
async fn stop_during_handshake_closes_start() {
    let (connector, mut broker) = MemoryConnector::pair();
    let client = Client::new(ClientOptions::default(), connector).unwrap();
    let starting = {
        let client = client.clone();
        tokio::spawn(async move { client.start().await })
    };
    // accept the connection but never answer `open`
    let mut session = broker.accept().await.unwrap();
    assert!(matches!(
        session.next_frame().await,
        Some(ClientFrame::Open { .. })
    ));
    assert_eq!(client.state(), ClientState::Connecting);

    client.stop().await;
    let result = timeout(PATIENCE, starting).await.unwrap().unwrap();
    assert!(matches!(result, Err(ClientError::Closed { .. })));
    assert_eq!(client.state(), ClientState::Stopped);
}

#[tokio::test]
async fn exhausted_subscription_does_not_hold_up_others() {
    let (client, mut session, _broker) = connected(ClientOptions::default()).await;
    let mut rx = deliveries(&client);
    let options = SubscribeOptions::at_least_once()
        .with_auto_confirm(false)
        .with_credit(1);
    let slow = subscribe(&client, &mut session, "slow", None, options.clone()).await;
    subscribe(&client, &mut session, "fast", None, options).await;

    session.send(&message("s1", "slow", "slow", "one"));
    session.send(&message("s2", "slow", "slow", "two"));
    let held = next(&mut rx).await;
    assert_eq!(id(&held), "s1");
    assert_eq!(slow.credit_remaining(), Some(0));

    for n in 1..=3 {
        let delivery_id = format!("f{n}");
        session.send(&message(&delivery_id, "fast", "fast", "go"));
        let delivery = next(&mut rx).await;
        assert_eq!(id(&delivery), delivery_id);
        assert_eq!(delivery.destination.topic_pattern, "fast");
        assert!(delivery.message.confirm_delivery());
    }

    assert!(held.message.confirm_delivery());
    let released = next(&mut rx).await;
    assert_eq!(id(&released), "s2");
}

#[tokio::test]
async fn broker_rejection_is_a_subscription_error() {
    let (client, mut session, _broker) = connected(ClientOptions::default()).await;
    let broker_side = async {
        if let Some(ClientFrame::Subscribe { request_id, .. }) = session.next_frame().await {
            session.send(&ServerFrame::Error {
                request_id: Some(request_id),
                message: "access denied".into(),
            });
        }
    };
    let (result, _) = tokio::join!(
        client.subscribe("secret/#", Some("spies"), SubscribeOptions::default()),
        broker_side
    );
    match result {
        Err(ClientError::Subscription {
            pattern,
            share,
            reason,
        }) => {
            assert_eq!(pattern, "secret/#");
            assert_eq!(share.as_deref(), Some("spies"));
            assert_eq!(reason, "access denied");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(client.subscription_count(), 0);
}

#[tokio::test]
async fn duplicate_and_invalid_subscriptions_are_rejected() {
    let (client, mut session, _broker) = connected(ClientOptions::default()).await;
    subscribe(&client, &mut session, "a/+", None, SubscribeOptions::default()).await;

    let dup = client
        .subscribe("a/+", None, SubscribeOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(dup, ClientError::Subscription { .. }));

    // same pattern in a share is a different subscription
    subscribe(&client, &mut session, "a/+", Some("g"), SubscribeOptions::default()).await;

    for (pattern, share) in [("a/#/b", None), ("", None), ("a", Some("x:y"))] {
        let err = client
            .subscribe(pattern, share, SubscribeOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Subscription { .. }));
    }
    let err = client
        .subscribe("b", None, SubscribeOptions::at_least_once().with_credit(0))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Subscription { .. }));
    assert_eq!(client.subscription_count(), 2);
}

#[tokio::test]
async fn messages_route_by_pattern_and_share() {
    let (client, mut session, _broker) = connected(ClientOptions::default()).await;
    let mut rx = deliveries(&client);
    subscribe(&client, &mut session, "news/+", None, SubscribeOptions::default()).await;
    subscribe(&client, &mut session, "news/+", Some("desk"), SubscribeOptions::default()).await;

    session.send(&ServerFrame::Message(InboundMessage {
        share: Some("desk".into()),
        ..match message("s1", "news/uk", "news/+", "shared") {
            ServerFrame::Message(m) => m,
            _ => unreachable!(),
        }
    }));
    let shared = next(&mut rx).await;
    assert_eq!(shared.destination.share.as_deref(), Some("desk"));
    assert_eq!(shared.message.topic, "news/uk");

    session.send(&message("p1", "news/fr", "news/+", "private"));
    let private = next(&mut rx).await;
    assert_eq!(private.destination.share, None);

    // nobody subscribed to this one
    session.send(&message("x1", "other", "other", "dropped"));
    assert!(timeout(QUIET, rx.recv()).await.is_err());
}

#[tokio::test]
async fn unsubscribe_stops_delivery() {
    let (client, mut session, _broker) = connected(ClientOptions::default()).await;
    let mut rx = deliveries(&client);
    let sub = subscribe(&client, &mut session, "public", None, SubscribeOptions::default()).await;

    let options = UnsubscribeOptions {
        ttl: Some(Duration::ZERO),
    };
    let (result, frame) = tokio::join!(
        client.unsubscribe(&sub, options.clone()),
        session.next_frame_accepting()
    );
    result.unwrap();
    match frame {
        Some(ClientFrame::Unsubscribe { pattern, ttl_ms, .. }) => {
            assert_eq!(pattern, "public");
            assert_eq!(ttl_ms, Some(0));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(!sub.is_active());

    session.send(&message("d1", "public", "public", "late"));
    assert!(timeout(QUIET, rx.recv()).await.is_err());

    let again = client.unsubscribe(&sub, options).await.unwrap_err();
    assert!(matches!(again, ClientError::Subscription { .. }));
}

#[tokio::test]
async fn session_loss_and_restart_resubscribes() {
    let (client, mut session, mut broker) = connected(ClientOptions::default()).await;
    let mut rx = deliveries(&client);
    let (error_tx, mut error_rx) = mpsc::unbounded_channel::<ClientError>();
    let restarted = Arc::new(Mutex::new(0));
    {
        let restarted = restarted.clone();
        client
            .on_error(move |e| {
                let _ = error_tx.send(e.clone());
            })
            .on_restarted(move || *restarted.lock().unwrap() += 1);
    }
    let options = SubscribeOptions::at_least_once()
        .with_auto_confirm(false)
        .with_credit(1);
    let sub = subscribe(&client, &mut session, "public", None, options).await;

    session.send(&message("d1", "public", "public", "before"));
    let before = next(&mut rx).await;
    assert_eq!(sub.credit_remaining(), Some(0));

    session.fail("connection reset");
    let err = next(&mut error_rx).await;
    assert!(matches!(err, ClientError::Transport(_)));
    let mut states = client.state_changes();
    states
        .wait_for(|s| *s == ClientState::Disconnected)
        .await
        .unwrap();

    // abandoned with the session: confirming is a no-op, credit is back
    assert!(!before.message.confirm_delivery());
    assert_eq!(sub.credit_remaining(), Some(1));
    assert!(sub.is_active());

    let (started, accepted) = tokio::join!(client.start(), broker.accept_open());
    started.unwrap();
    let (mut session, _) = accepted.unwrap();
    assert_eq!(*restarted.lock().unwrap(), 1);

    match session.next_frame_accepting().await {
        Some(ClientFrame::Subscribe {
            pattern, credit, ..
        }) => {
            assert_eq!(pattern, "public");
            assert_eq!(credit, Some(1));
        }
        other => panic!("expected a re-subscription, got {other:?}"),
    }

    session.send(&message("d1", "public", "public", "redelivered"));
    let again = next(&mut rx).await;
    assert_eq!(id(&again), "d1");
    assert!(again.message.confirm_delivery());
    assert_eq!(
        session.next_frame().await,
        Some(ClientFrame::Ack {
            delivery_id: "d1".into()
        })
    );
}

#[tokio::test]
async fn session_loss_fails_pending_requests() {
    let (client, mut session, _broker) = connected(ClientOptions::default()).await;
    let pending = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .subscribe("public", None, SubscribeOptions::default())
                .await
        })
    };
    assert!(matches!(
        session.next_frame().await,
        Some(ClientFrame::Subscribe { .. })
    ));
    session.close();

    let result = pending.await.unwrap();
    assert!(matches!(result, Err(ClientError::Transport(_))));
    assert_eq!(client.subscription_count(), 0);
}

#[tokio::test]
async fn handlers_may_confirm_and_call_the_client() {
    let (client, mut session, _broker) = connected(ClientOptions::default()).await;
    let (tx, mut rx) = mpsc::unbounded_channel::<bool>();
    let handle = client.clone();
    client.on_message(move |_, delivery| {
        let confirmed = delivery.message.confirm_delivery();
        let _ = tx.send(confirmed);
        let client = handle.clone();
        tokio::spawn(async move { client.stop().await });
    });
    let options = SubscribeOptions::at_least_once()
        .with_auto_confirm(false)
        .with_credit(1);
    subscribe(&client, &mut session, "public", None, options).await;
    session.send(&message("d1", "public", "public", "x"));

    assert!(next(&mut rx).await);
    let mut states = client.state_changes();
    timeout(PATIENCE, states.wait_for(|s| *s == ClientState::Stopped))
        .await
        .unwrap()
        .unwrap();
}
