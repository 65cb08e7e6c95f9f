//! Pure routing decisions for rumqttc events

use bytes::Bytes;
use rumqttc::{ConnectReturnCode, Event, Outgoing, Packet, SubscribeReasonCode};

/// Pure classification of event loop output
pub struct MessageHandler;

impl MessageHandler {
    /// Route an MQTT event to the session bookkeeping that cares about it
    pub fn route_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(packet) => match packet {
                Packet::ConnAck(connack) => EventRoute::ConnectionAcknowledged {
                    accepted: connack.code == ConnectReturnCode::Success,
                },
                Packet::Publish(publish) => EventRoute::MessageReceived {
                    topic: publish.topic.clone(),
                    payload: publish.payload.clone(),
                    retain: publish.retain,
                },
                Packet::PubAck(puback) => EventRoute::PublishAcknowledged(puback.pkid),
                Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                    packet_id: suback.pkid,
                    granted: Self::subscription_granted(&suback.return_codes),
                },
                Packet::Disconnect => EventRoute::Disconnected,
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(outgoing) => match outgoing {
                Outgoing::Publish(pkid) => EventRoute::PublishSent(*pkid),
                Outgoing::Subscribe(pkid) => EventRoute::SubscribeSent(*pkid),
                Outgoing::Disconnect => EventRoute::DisconnectSent,
                _ => EventRoute::OutgoingEvent,
            },
        }
    }

    /// A SUBACK grants the subscription only if no filter was refused
    pub fn subscription_granted(return_codes: &[SubscribeReasonCode]) -> bool {
        !return_codes.is_empty()
            && return_codes
                .iter()
                .all(|code| matches!(code, SubscribeReasonCode::Success(_)))
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// CONNACK; `accepted` is false for any refusal code
    ConnectionAcknowledged { accepted: bool },
    /// Message received on a subscribed topic
    MessageReceived {
        topic: String,
        payload: Bytes,
        retain: bool,
    },
    /// Publish written to the socket (pkid is 0 for QoS 0)
    PublishSent(u16),
    /// PUBACK for a QoS 1 publish
    PublishAcknowledged(u16),
    SubscribeSent(u16),
    SubscriptionConfirmed { packet_id: u16, granted: bool },
    /// Broker closed the session
    Disconnected,
    DisconnectSent,
    /// PingResp and friends
    InfrastructureEvent(String),
    OutgoingEvent,
}
