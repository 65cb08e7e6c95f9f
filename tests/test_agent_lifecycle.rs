//! Agent lifecycle tests with mock collaborators
//!
//! Covers startup when the broker is unreachable, steady-state publishing and
//! shutdown releasing the MQTT session.

use std::time::Duration;
use telemetry_agent::agent::TelemetryAgent;
use telemetry_agent::config::AgentConfig;
use telemetry_agent::error::AgentError;
use telemetry_agent::testing::{BrokerEvent, FixedClock, FixedSensor, MockBroker};
use tokio::sync::oneshot;

fn test_config() -> AgentConfig {
    AgentConfig::from_toml_str(
        r#"
[device]
id = "sensor-01"

[mqtt]
broker_url = "mqtt://localhost:1883"

[mqtt.reconnect]
backoff_ms = [100]
sustained_delay_ms = 100

[telemetry]
period_secs = 5
"#,
    )
    .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_broker_fails_startup() {
    let broker = MockBroker::unreachable();
    let agent = TelemetryAgent::new(test_config());

    let result = agent
        .run_with(
            broker.connector(),
            Box::new(FixedSensor::new(21.5, 1013.0)),
            Box::new(FixedClock(1_700_000_000)),
            std::future::pending::<()>(),
        )
        .await;

    assert!(matches!(result, Err(AgentError::Connection(_))));
    assert!(broker.published().is_empty());
    assert_eq!(broker.connect_attempts(), 1);
    assert_eq!(broker.open_sessions(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_runs_until_shutdown_and_closes_session() {
    let broker = MockBroker::new();
    let (stop, stopped) = oneshot::channel::<()>();

    let agent = TelemetryAgent::new(test_config());
    let run = tokio::spawn(agent.run_with(
        broker.connector(),
        Box::new(FixedSensor::new(21.5, 1013.0)),
        Box::new(FixedClock(1_700_000_000)),
        async move {
            let _ = stopped.await;
        },
    ));

    tokio::time::sleep(Duration::from_millis(11_000)).await;
    stop.send(()).unwrap();
    run.await.unwrap().unwrap();

    let published = broker.published();
    assert_eq!(published.len(), 2);
    assert!(published
        .iter()
        .all(|message| message.topic == "home/room1/sensor1"));
    assert_eq!(broker.closed_sessions(), 1);
    assert_eq!(broker.open_sessions(), 0);
    assert_eq!(broker.log().last(), Some(&BrokerEvent::Closed(1)));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_before_first_publish() {
    let broker = MockBroker::new();
    let (stop, stopped) = oneshot::channel::<()>();

    let agent = TelemetryAgent::new(test_config());
    let run = tokio::spawn(agent.run_with(
        broker.connector(),
        Box::new(FixedSensor::new(21.5, 1013.0)),
        Box::new(FixedClock(1_700_000_000)),
        async move {
            let _ = stopped.await;
        },
    ));

    tokio::time::sleep(Duration::from_secs(1)).await;
    stop.send(()).unwrap();
    run.await.unwrap().unwrap();

    assert!(broker.published().is_empty());
    assert_eq!(broker.closed_sessions(), 1);
    assert_eq!(broker.open_sessions(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_subscribes_configured_topics_on_startup() {
    let broker = MockBroker::new();
    let (stop, stopped) = oneshot::channel::<()>();

    let agent = TelemetryAgent::new(test_config());
    let run = tokio::spawn(agent.run_with(
        broker.connector(),
        Box::new(FixedSensor::new(21.5, 1013.0)),
        Box::new(FixedClock(1_700_000_000)),
        async move {
            let _ = stopped.await;
        },
    ));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        broker.log()[..2],
        [
            BrokerEvent::Connected(1),
            BrokerEvent::Subscribed(1, "foo_topic".to_string()),
        ]
    );

    stop.send(()).unwrap();
    run.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_while_awaiting_first_suback_closes_session() {
    let broker = MockBroker::new();
    broker.hold_subacks(true);
    let (stop, stopped) = oneshot::channel::<()>();

    let agent = TelemetryAgent::new(test_config());
    let run = tokio::spawn(agent.run_with(
        broker.connector(),
        Box::new(FixedSensor::new(21.5, 1013.0)),
        Box::new(FixedClock(1_700_000_000)),
        async move {
            let _ = stopped.await;
        },
    ));

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(broker.open_sessions(), 1);

    stop.send(()).unwrap();
    run.await.unwrap().unwrap();

    assert_eq!(broker.closed_sessions(), 1);
    assert_eq!(broker.open_sessions(), 0);
    assert!(broker.published().is_empty());
    assert_eq!(broker.log().last(), Some(&BrokerEvent::Closed(1)));
}
