//! Transport layer for telemetry publishing
//!
//! This module defines the session abstraction the connection manager drives,
//! the MQTT implementation of it, and the manager itself.
//!
//! A [`Connector`] produces one [`Session`] per successful connect. Sessions are
//! never reused across a link drop: the manager discards a dead session and asks
//! the connector for a fresh one.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod health_monitor;
pub mod manager;
pub mod mqtt;
pub mod reconnect;

pub use health_monitor::{ConnectionEvent, ConnectionState, HealthMonitor, ReconnectConfig};
pub use manager::{
    ConnectionError, ConnectionHandle, ConnectionManager, LinkError, LinkObserver, LinkState,
    MessageSink,
};
pub use reconnect::{ReconnectionHandler, SubscribeError, SubscriptionSet};

/// MQTT delivery quality supported by the agent
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(try_from = "u8", into = "u8")]
pub enum Qos {
    /// QoS 0 - fire and forget
    AtMostOnce,
    /// QoS 1 - acknowledged, may be delivered more than once
    #[default]
    AtLeastOnce,
}

impl TryFrom<u8> for Qos {
    type Error = String;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            0 => Ok(Qos::AtMostOnce),
            1 => Ok(Qos::AtLeastOnce),
            other => Err(format!("unsupported QoS level {other}, expected 0 or 1")),
        }
    }
}

impl From<Qos> for u8 {
    fn from(qos: Qos) -> Self {
        match qos {
            Qos::AtMostOnce => 0,
            Qos::AtLeastOnce => 1,
        }
    }
}

impl From<Qos> for rumqttc::QoS {
    fn from(qos: Qos) -> Self {
        match qos {
            Qos::AtMostOnce => rumqttc::QoS::AtMostOnce,
            Qos::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        }
    }
}

/// Identifies a publish accepted by a session until it is reported delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ticket(u64);

impl Ticket {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Message received on a subscribed topic
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub retain: bool,
}

/// Events surfaced by [`Session::poll`]
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The publish behind this ticket completed (PUBACK for QoS 1, written for QoS 0)
    Delivered(Ticket),
    /// A message arrived on one of the active subscriptions
    Message(InboundMessage),
}

/// Errors raised by a transport session
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    #[error("Broker unreachable: {0}")]
    Unreachable(String),
    #[error("Link dropped: {0}")]
    Dropped(String),
    #[error("Broker rejected subscription to {0}")]
    Rejected(String),
    #[error("Session closed")]
    Closed,
}

/// Creates transport sessions
///
/// Each successful `connect` yields a brand new session; with a clean session the
/// broker holds no subscriptions for it yet.
#[async_trait]
pub trait Connector: Send + 'static {
    type Session: Session + 'static;

    /// Single connection attempt, no internal retries
    async fn connect(&mut self) -> Result<Self::Session, TransportError>;
}

/// One live connection to the broker
#[async_trait]
pub trait Session: Send {
    /// Hand a publish to the session without waiting for it to complete
    fn publish(&mut self, topic: &str, payload: Bytes, qos: Qos) -> Result<Ticket, TransportError>;

    /// Subscribe and wait for the broker's acknowledgement
    async fn subscribe(&mut self, topic: &str, qos: Qos) -> Result<(), TransportError>;

    /// Drive the session until the next event. An `Err` means the session is dead.
    async fn poll(&mut self) -> Result<SessionEvent, TransportError>;

    /// Release the session, disconnecting from the broker if still connected
    async fn close(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qos_from_integer() {
        assert_eq!(Qos::try_from(0).unwrap(), Qos::AtMostOnce);
        assert_eq!(Qos::try_from(1).unwrap(), Qos::AtLeastOnce);
        assert!(Qos::try_from(2).is_err());
    }

    #[test]
    fn test_qos_maps_to_rumqttc() {
        assert_eq!(rumqttc::QoS::from(Qos::AtMostOnce), rumqttc::QoS::AtMostOnce);
        assert_eq!(rumqttc::QoS::from(Qos::AtLeastOnce), rumqttc::QoS::AtLeastOnce);
    }

    #[test]
    fn test_qos_defaults_to_at_least_once() {
        assert_eq!(Qos::default(), Qos::AtLeastOnce);
        assert_eq!(u8::from(Qos::default()), 1);
    }
}
