//! Link resilience tests against the in-process clean-session broker
//!
//! Each test drives drops and restores through `MockBroker` and checks what the
//! broker saw: subscriptions re-applied on every fresh session before any
//! publish, publishes held back while the link is down, and observers notified
//! before suspended callers resume.

use bytes::Bytes;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use telemetry_agent::testing::{BrokerEvent, MockBroker};
use telemetry_agent::transport::{
    ConnectionHandle, ConnectionManager, InboundMessage, LinkState, Qos, ReconnectConfig,
    SubscriptionSet,
};

const TOPIC: &str = "home/room1/sensor1";

fn fast_reconnect() -> ReconnectConfig {
    ReconnectConfig {
        backoff_ms: vec![100, 200],
        sustained_delay_ms: 400,
    }
}

fn foo_subscription() -> SubscriptionSet {
    [("foo_topic", Qos::AtLeastOnce)].into_iter().collect()
}

async fn connect(broker: &MockBroker) -> ConnectionHandle {
    ConnectionManager::new(broker.connector(), fast_reconnect(), foo_subscription())
        .connect()
        .await
        .expect("mock broker is online")
}

async fn drop_and_restore(broker: &MockBroker, link: &ConnectionHandle) {
    broker.drop_link();
    link.wait_for(LinkState::Down).await.unwrap();
    broker.restore_link();
    link.wait_for(LinkState::Up).await.unwrap();
}

/// Events of one generation, in broker order
fn generation_events(log: &[BrokerEvent], generation: u64) -> Vec<BrokerEvent> {
    log.iter()
        .filter(|event| match event {
            BrokerEvent::Connected(g)
            | BrokerEvent::Subscribed(g, _)
            | BrokerEvent::Published(g, _)
            | BrokerEvent::Closed(g) => *g == generation,
        })
        .cloned()
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_subscription_active_after_initial_connect() {
    let broker = MockBroker::new();
    let link = connect(&broker).await;

    assert_eq!(link.link_state(), LinkState::Up);
    assert_eq!(
        broker.subscriptions(),
        vec![("foo_topic".to_string(), Qos::AtLeastOnce)]
    );

    link.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_resubscribes_before_publishing_on_every_session() {
    let broker = MockBroker::new();
    let link = connect(&broker).await;

    for _ in 0..2 {
        link.publish(TOPIC, Bytes::from_static(b"{}"), Qos::AtLeastOnce)
            .await
            .unwrap();
        drop_and_restore(&broker, &link).await;
    }
    link.publish(TOPIC, Bytes::from_static(b"{}"), Qos::AtLeastOnce)
        .await
        .unwrap();

    let log = broker.log();
    assert_eq!(broker.generation(), 3);
    for generation in 1..=3 {
        let events = generation_events(&log, generation);
        assert_eq!(
            &events[..3],
            &[
                BrokerEvent::Connected(generation),
                BrokerEvent::Subscribed(generation, "foo_topic".to_string()),
                BrokerEvent::Published(generation, TOPIC.to_string()),
            ],
            "generation {generation} must subscribe before its first publish"
        );
    }

    link.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_subscription_set_idempotent_across_cycles() {
    let broker = MockBroker::new();
    let link = connect(&broker).await;

    for _ in 0..3 {
        drop_and_restore(&broker, &link).await;
        assert_eq!(
            broker.subscriptions(),
            vec![("foo_topic".to_string(), Qos::AtLeastOnce)]
        );
    }

    // One SUBSCRIBE per session, never more
    let subscribes = broker
        .log()
        .iter()
        .filter(|event| matches!(event, BrokerEvent::Subscribed(..)))
        .count();
    assert_eq!(subscribes, 4);

    link.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_publish_while_down_waits_for_up() {
    let broker = MockBroker::new();
    let order = Arc::new(Mutex::new(Vec::new()));
    let observer_log = order.clone();

    let link = ConnectionManager::new(broker.connector(), fast_reconnect(), foo_subscription())
        .observe(move |state: LinkState| {
            observer_log
                .lock()
                .unwrap()
                .push(format!("observer:{}", state.as_str()))
        })
        .connect()
        .await
        .unwrap();

    broker.drop_link();
    link.wait_for(LinkState::Down).await.unwrap();

    let publisher = {
        let link = link.clone();
        let order = order.clone();
        tokio::spawn(async move {
            link.publish(TOPIC, Bytes::from_static(b"{}"), Qos::AtLeastOnce)
                .await
                .unwrap();
            order.lock().unwrap().push("publish:done".to_string());
        })
    };

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(!publisher.is_finished(), "publish must stay suspended while down");
    assert!(broker.published().is_empty());

    broker.restore_link();
    publisher.await.unwrap();

    assert_eq!(
        *order.lock().unwrap(),
        vec!["observer:up", "observer:down", "observer:up", "publish:done"]
    );
    let published = broker.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].generation, 2);

    link.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_rejected_resubscribe_restarts_session() {
    let broker = MockBroker::new();
    let link = connect(&broker).await;

    broker.reject_subscribes(1);
    drop_and_restore(&broker, &link).await;

    // Generation 2 was refused its SUBSCRIBE and discarded; 3 is the usable one
    assert_eq!(broker.generation(), 3);
    assert_eq!(
        broker.subscriptions(),
        vec![("foo_topic".to_string(), Qos::AtLeastOnce)]
    );
    assert!(broker.log().contains(&BrokerEvent::Closed(2)));

    link.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_runtime_subscribe_survives_reconnect() {
    let broker = MockBroker::new();
    let link = connect(&broker).await;

    link.subscribe("home/room1/commands", Qos::AtMostOnce)
        .await
        .unwrap();
    drop_and_restore(&broker, &link).await;

    assert_eq!(
        broker.subscriptions(),
        vec![
            ("foo_topic".to_string(), Qos::AtLeastOnce),
            ("home/room1/commands".to_string(), Qos::AtMostOnce),
        ]
    );

    link.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_messages_during_outage_are_lost() {
    let broker = MockBroker::new();
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();

    let link = ConnectionManager::new(broker.connector(), fast_reconnect(), foo_subscription())
        .on_message(move |message: &InboundMessage| {
            sink.lock()
                .unwrap()
                .push(String::from_utf8_lossy(&message.payload).to_string())
        })
        .connect()
        .await
        .unwrap();

    assert!(broker.deliver("foo_topic", b"before"));
    tokio::time::sleep(Duration::from_millis(10)).await;

    broker.drop_link();
    link.wait_for(LinkState::Down).await.unwrap();
    assert!(!broker.deliver("foo_topic", b"during"));

    broker.restore_link();
    link.wait_for(LinkState::Up).await.unwrap();
    assert!(broker.deliver("foo_topic", b"after"));
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(*received.lock().unwrap(), vec!["before", "after"]);

    link.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_close_while_down_releases_parked_publish() {
    let broker = MockBroker::new();
    let link = connect(&broker).await;

    broker.drop_link();
    link.wait_for(LinkState::Down).await.unwrap();

    let publisher = {
        let link = link.clone();
        tokio::spawn(async move {
            link.publish(TOPIC, Bytes::from_static(b"{}"), Qos::AtLeastOnce)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    link.close().await;

    assert!(publisher.await.unwrap().is_err());
    assert!(broker.published().is_empty());
    assert!(link.is_closed());
}

#[tokio::test(start_paused = true)]
async fn test_backoff_escalates_while_resubscribe_keeps_failing() {
    let broker = MockBroker::new();
    let link = ConnectionManager::new(
        broker.connector(),
        ReconnectConfig::default(),
        foo_subscription(),
    )
    .connect()
    .await
    .unwrap();

    broker.reject_subscribes(u32::MAX);
    broker.drop_link();
    link.wait_for(LinkState::Down).await.unwrap();
    broker.restore_link();
    let before = broker.connect_attempts();

    tokio::time::sleep(Duration::from_secs(20)).await;

    // 250 + 500 + 1000 ms, then one attempt every 2 s
    let attempts = broker.connect_attempts() - before;
    assert!(
        (10..=13).contains(&attempts),
        "{attempts} connect attempts in 20s with refused resubscribes"
    );
    assert_eq!(link.link_state(), LinkState::Down);

    broker.reject_subscribes(0);
    link.wait_for(LinkState::Up).await.unwrap();
    link.close().await;
}
