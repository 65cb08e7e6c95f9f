//! Mock implementations for testing
//!
//! [`MockBroker`] behaves like a clean-session MQTT broker: every connect
//! starts a new generation with no subscriptions, acknowledges publishes
//! immediately, and forgets everything when the link drops. Tests control the
//! link with [`MockBroker::drop_link`] and [`MockBroker::restore_link`].

use crate::clock::{Clock, ClockError};
use crate::indicator::SignalPin;
use crate::sensor::{Reading, Sensor, SensorError};
use crate::transport::{
    Connector, InboundMessage, Qos, Session, SessionEvent, Ticket, TransportError,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::time::Instant;

/// Broker-side record of session activity, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    Connected(u64),
    Subscribed(u64, String),
    Published(u64, String),
    Closed(u64),
}

/// A publish accepted by the broker
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: Qos,
    pub generation: u64,
    pub at: Instant,
}

#[derive(Debug, Default)]
struct BrokerState {
    online: bool,
    generation: u64,
    subscriptions: BTreeMap<String, Qos>,
    published: Vec<PublishedMessage>,
    log: Vec<BrokerEvent>,
    inbound: VecDeque<(u64, InboundMessage)>,
    connect_attempts: u32,
    open_sessions: u32,
    closed_sessions: u32,
    reject_subscribes: u32,
    hold_subacks: bool,
}

/// In-process clean-session broker
#[derive(Debug, Clone)]
pub struct MockBroker {
    state: Arc<Mutex<BrokerState>>,
    epoch: Arc<watch::Sender<u64>>,
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBroker {
    /// Broker that accepts connections
    pub fn new() -> Self {
        let (epoch, _) = watch::channel(0);
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                online: true,
                ..Default::default()
            })),
            epoch: Arc::new(epoch),
        }
    }

    /// Broker that refuses every connection until restored
    pub fn unreachable() -> Self {
        let broker = Self::new();
        broker.state().online = false;
        broker
    }

    pub fn connector(&self) -> MockConnector {
        MockConnector {
            broker: self.clone(),
        }
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn bump(&self) {
        self.epoch.send_modify(|epoch| *epoch += 1);
    }

    /// Cut the link; the broker forgets all subscriptions
    pub fn drop_link(&self) {
        {
            let mut state = self.state();
            state.online = false;
            state.subscriptions.clear();
            state.inbound.clear();
        }
        self.bump();
    }

    pub fn restore_link(&self) {
        self.state().online = true;
        self.bump();
    }

    /// Refuse the next `count` SUBSCRIBE requests
    pub fn reject_subscribes(&self, count: u32) {
        self.state().reject_subscribes = count;
    }

    /// Leave SUBSCRIBE requests unanswered until released
    pub fn hold_subacks(&self, hold: bool) {
        self.state().hold_subacks = hold;
        self.bump();
    }

    /// Publish from another client; returns false if nobody is subscribed
    pub fn deliver(&self, topic: &str, payload: &[u8]) -> bool {
        let accepted = {
            let mut state = self.state();
            if !state.online || !state.subscriptions.contains_key(topic) {
                false
            } else {
                let generation = state.generation;
                state.inbound.push_back((
                    generation,
                    InboundMessage {
                        topic: topic.to_string(),
                        payload: Bytes::copy_from_slice(payload),
                        retain: false,
                    },
                ));
                true
            }
        };
        if accepted {
            self.bump();
        }
        accepted
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state().published.clone()
    }

    pub fn log(&self) -> Vec<BrokerEvent> {
        self.state().log.clone()
    }

    /// Active subscriptions on the current session
    pub fn subscriptions(&self) -> Vec<(String, Qos)> {
        self.state()
            .subscriptions
            .iter()
            .map(|(topic, qos)| (topic.clone(), *qos))
            .collect()
    }

    pub fn generation(&self) -> u64 {
        self.state().generation
    }

    pub fn connect_attempts(&self) -> u32 {
        self.state().connect_attempts
    }

    /// Sessions handed out and not yet released
    pub fn open_sessions(&self) -> u32 {
        self.state().open_sessions
    }

    /// Sessions released with an explicit close
    pub fn closed_sessions(&self) -> u32 {
        self.state().closed_sessions
    }
}

/// Connector handing out [`MockSession`]s
#[derive(Debug, Clone)]
pub struct MockConnector {
    broker: MockBroker,
}

#[async_trait]
impl Connector for MockConnector {
    type Session = MockSession;

    async fn connect(&mut self) -> Result<MockSession, TransportError> {
        let generation = {
            let mut state = self.broker.state();
            state.connect_attempts += 1;
            if !state.online {
                return Err(TransportError::Unreachable(
                    "mock broker offline".to_string(),
                ));
            }
            state.generation += 1;
            state.subscriptions.clear();
            state.inbound.clear();
            state.open_sessions += 1;
            let generation = state.generation;
            state.log.push(BrokerEvent::Connected(generation));
            generation
        };

        Ok(MockSession {
            broker: self.broker.clone(),
            epoch: self.broker.epoch.subscribe(),
            generation,
            next_ticket: 0,
            pending: VecDeque::new(),
            closed: false,
        })
    }
}

/// One generation of the mock broker connection
#[derive(Debug)]
pub struct MockSession {
    broker: MockBroker,
    epoch: watch::Receiver<u64>,
    generation: u64,
    next_ticket: u64,
    pending: VecDeque<SessionEvent>,
    closed: bool,
}

impl MockSession {
    fn alive(&self, state: &BrokerState) -> bool {
        !self.closed && state.online && state.generation == self.generation
    }

    fn dropped() -> TransportError {
        TransportError::Dropped("mock link down".to_string())
    }
}

#[async_trait]
impl Session for MockSession {
    fn publish(&mut self, topic: &str, payload: Bytes, qos: Qos) -> Result<Ticket, TransportError> {
        let mut state = self.broker.state();
        if !self.alive(&state) {
            return Err(Self::dropped());
        }
        state.published.push(PublishedMessage {
            topic: topic.to_string(),
            payload,
            qos,
            generation: self.generation,
            at: Instant::now(),
        });
        state
            .log
            .push(BrokerEvent::Published(self.generation, topic.to_string()));

        let ticket = Ticket::new(self.next_ticket);
        self.next_ticket += 1;
        self.pending.push_back(SessionEvent::Delivered(ticket));
        Ok(ticket)
    }

    async fn subscribe(&mut self, topic: &str, qos: Qos) -> Result<(), TransportError> {
        loop {
            {
                let mut state = self.broker.state();
                if !self.alive(&state) {
                    return Err(Self::dropped());
                }
                if !state.hold_subacks {
                    if state.reject_subscribes > 0 {
                        state.reject_subscribes -= 1;
                        return Err(TransportError::Rejected(topic.to_string()));
                    }
                    state.subscriptions.insert(topic.to_string(), qos);
                    state
                        .log
                        .push(BrokerEvent::Subscribed(self.generation, topic.to_string()));
                    break;
                }
            }
            if self.epoch.changed().await.is_err() {
                return Err(TransportError::Closed);
            }
        }
        // SUBACK round trip
        tokio::task::yield_now().await;
        Ok(())
    }

    async fn poll(&mut self) -> Result<SessionEvent, TransportError> {
        loop {
            {
                let mut state = self.broker.state();
                if !self.alive(&state) {
                    return Err(Self::dropped());
                }
                if let Some(event) = self.pending.pop_front() {
                    return Ok(event);
                }
                while let Some((generation, message)) = state.inbound.pop_front() {
                    if generation == self.generation {
                        return Ok(SessionEvent::Message(message));
                    }
                }
            }
            if self.epoch.changed().await.is_err() {
                return Err(TransportError::Closed);
            }
        }
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let mut state = self.broker.state();
        state.closed_sessions += 1;
        state.log.push(BrokerEvent::Closed(self.generation));
    }
}

impl Drop for MockSession {
    fn drop(&mut self) {
        let mut state = self.broker.state();
        state.open_sessions = state.open_sessions.saturating_sub(1);
    }
}

/// Sensor returning a fixed reading, optionally failing the first reads
#[derive(Debug, Clone)]
pub struct FixedSensor {
    reading: Reading,
    failures: u32,
}

impl FixedSensor {
    pub fn new(temperature: f64, pressure: f64) -> Self {
        Self {
            reading: Reading {
                temperature,
                pressure,
            },
            failures: 0,
        }
    }

    pub fn failing_first(mut self, failures: u32) -> Self {
        self.failures = failures;
        self
    }
}

impl Sensor for FixedSensor {
    fn read(&mut self) -> Result<Reading, SensorError> {
        if self.failures > 0 {
            self.failures -= 1;
            return Err(SensorError::Unavailable("mock sensor failure".to_string()));
        }
        Ok(self.reading)
    }
}

/// Clock frozen at a fixed Unix time
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub i64);

#[async_trait]
impl Clock for FixedClock {
    async fn sync(&mut self) -> Result<(), ClockError> {
        Ok(())
    }

    fn now(&self) -> i64 {
        self.0
    }
}

/// Signal pin that records every value it is set to
#[derive(Debug, Clone, Default)]
pub struct RecordingPin {
    history: Arc<Mutex<Vec<bool>>>,
}

impl RecordingPin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn history(&self) -> Vec<bool> {
        self.history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl SignalPin for RecordingPin {
    fn set(&mut self, active: bool) {
        self.history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(active);
    }
}
