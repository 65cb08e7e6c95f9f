//! Impure I/O: the rumqttc event loop behind the session abstraction
//!
//! rumqttc reports outgoing publishes in the order they were requested, so
//! each accepted publish is queued with its ticket and matched against the
//! next `Outgoing::Publish`. QoS 0 publishes complete at that point; QoS 1
//! publishes complete when the PUBACK for their packet id arrives.

use super::connection::{configure_mqtt_options, BrokerAddress, MqttError};
use super::message_handler::{EventRoute, MessageHandler};
use crate::config::MqttSection;
use crate::transport::{
    Connector, InboundMessage, Qos, Session, SessionEvent, Ticket, TransportError,
};
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{AsyncClient, Event, EventLoop};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Request channel capacity between the client handle and the event loop
const REQUEST_CAPACITY: usize = 64;

const CLOSE_TIMEOUT: Duration = Duration::from_millis(500);

/// Opens one clean MQTT session per `connect`
pub struct MqttConnector {
    device_id: String,
    config: MqttSection,
}

impl MqttConnector {
    pub fn new(device_id: &str, config: MqttSection) -> Result<Self, MqttError> {
        BrokerAddress::parse(&config.broker_url)?;
        Ok(Self {
            device_id: device_id.to_string(),
            config,
        })
    }

    fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.config.connect_timeout_secs)
    }
}

/// Poll until CONNACK, failing on refusal or transport error
async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), TransportError> {
    loop {
        let event = eventloop
            .poll()
            .await
            .map_err(|e| TransportError::Unreachable(e.to_string()))?;
        match MessageHandler::route_event(&event) {
            EventRoute::ConnectionAcknowledged { accepted: true } => return Ok(()),
            EventRoute::ConnectionAcknowledged { accepted: false } => {
                return Err(TransportError::Unreachable(format!(
                    "broker refused connection: {event:?}"
                )));
            }
            _ => continue,
        }
    }
}

#[async_trait]
impl Connector for MqttConnector {
    type Session = MqttSession;

    async fn connect(&mut self) -> Result<MqttSession, TransportError> {
        let options = configure_mqtt_options(&self.device_id, &self.config)
            .map_err(|e| TransportError::Unreachable(e.to_string()))?;
        let client_id = options.client_id();
        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);

        match tokio::time::timeout(self.connect_timeout(), wait_for_connack(&mut eventloop)).await
        {
            Ok(Ok(())) => {
                info!(
                    broker = %self.config.broker_url,
                    client_id = %client_id,
                    "Connected to MQTT broker"
                );
                Ok(MqttSession::new(client, eventloop))
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(TransportError::Unreachable(
                "ConnAck timeout - no connection confirmation received".to_string(),
            )),
        }
    }
}

/// One live rumqttc connection
pub struct MqttSession {
    client: AsyncClient,
    eventloop: EventLoop,
    next_ticket: u64,
    submitted: VecDeque<(Ticket, Qos)>,
    awaiting_ack: HashMap<u16, Ticket>,
    backlog: VecDeque<SessionEvent>,
    dead: bool,
}

impl MqttSession {
    fn new(client: AsyncClient, eventloop: EventLoop) -> Self {
        Self {
            client,
            eventloop,
            next_ticket: 0,
            submitted: VecDeque::new(),
            awaiting_ack: HashMap::new(),
            backlog: VecDeque::new(),
            dead: false,
        }
    }

    fn ensure_alive(&self) -> Result<(), TransportError> {
        if self.dead {
            Err(TransportError::Dropped("session already dropped".to_string()))
        } else {
            Ok(())
        }
    }

    /// Next raw event; once this fails the session stays dead
    async fn next_event(&mut self) -> Result<Event, TransportError> {
        self.ensure_alive()?;
        match self.eventloop.poll().await {
            Ok(event) => Ok(event),
            Err(e) => {
                self.dead = true;
                Err(TransportError::Dropped(e.to_string()))
            }
        }
    }

    /// Update publish bookkeeping, returning anything the caller should see
    fn track(&mut self, event: &Event) -> Result<Option<SessionEvent>, TransportError> {
        match MessageHandler::route_event(event) {
            EventRoute::PublishSent(pkid) => match self.submitted.pop_front() {
                Some((ticket, Qos::AtMostOnce)) => Ok(Some(SessionEvent::Delivered(ticket))),
                Some((ticket, Qos::AtLeastOnce)) => {
                    self.awaiting_ack.insert(pkid, ticket);
                    Ok(None)
                }
                None => {
                    warn!(pkid, "Outgoing publish without a pending ticket");
                    Ok(None)
                }
            },
            EventRoute::PublishAcknowledged(pkid) => {
                Ok(self.awaiting_ack.remove(&pkid).map(SessionEvent::Delivered))
            }
            EventRoute::MessageReceived {
                topic,
                payload,
                retain,
            } => Ok(Some(SessionEvent::Message(InboundMessage {
                topic,
                payload,
                retain,
            }))),
            EventRoute::Disconnected => {
                self.dead = true;
                Err(TransportError::Dropped(
                    "broker closed the connection".to_string(),
                ))
            }
            EventRoute::InfrastructureEvent(event) => {
                debug!(target: "mqtt_transport", "MQTT event: {}", event);
                Ok(None)
            }
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl Session for MqttSession {
    fn publish(&mut self, topic: &str, payload: Bytes, qos: Qos) -> Result<Ticket, TransportError> {
        self.ensure_alive()?;
        self.client
            .try_publish(topic, qos.into(), false, payload.to_vec())
            .map_err(|e| TransportError::Dropped(e.to_string()))?;

        let ticket = Ticket::new(self.next_ticket);
        self.next_ticket += 1;
        self.submitted.push_back((ticket, qos));
        Ok(ticket)
    }

    async fn subscribe(&mut self, topic: &str, qos: Qos) -> Result<(), TransportError> {
        self.ensure_alive()?;
        self.client
            .try_subscribe(topic, qos.into())
            .map_err(|e| TransportError::Dropped(e.to_string()))?;

        let mut packet_id = None;
        loop {
            let event = self.next_event().await?;
            match MessageHandler::route_event(&event) {
                EventRoute::SubscribeSent(pkid) if packet_id.is_none() => {
                    packet_id = Some(pkid);
                }
                EventRoute::SubscriptionConfirmed {
                    packet_id: acked,
                    granted,
                } if packet_id == Some(acked) => {
                    return if granted {
                        Ok(())
                    } else {
                        Err(TransportError::Rejected(topic.to_string()))
                    };
                }
                _ => {
                    // Keep publish completions and messages for the next poll
                    if let Some(event) = self.track(&event)? {
                        self.backlog.push_back(event);
                    }
                }
            }
        }
    }

    async fn poll(&mut self) -> Result<SessionEvent, TransportError> {
        if let Some(event) = self.backlog.pop_front() {
            return Ok(event);
        }
        loop {
            let event = self.next_event().await?;
            if let Some(event) = self.track(&event)? {
                return Ok(event);
            }
        }
    }

    async fn close(&mut self) {
        if self.dead {
            return;
        }
        self.dead = true;

        if let Err(e) = self.client.try_disconnect() {
            debug!(error = %e, "Could not queue MQTT disconnect");
            return;
        }

        let eventloop = &mut self.eventloop;
        let flushed = tokio::time::timeout(CLOSE_TIMEOUT, async {
            loop {
                match eventloop.poll().await {
                    Ok(event) => {
                        if MessageHandler::route_event(&event) == EventRoute::DisconnectSent {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        })
        .await;

        match flushed {
            Ok(()) => info!("MQTT session closed"),
            Err(_) => warn!("Timed out flushing MQTT disconnect"),
        }
    }
}
