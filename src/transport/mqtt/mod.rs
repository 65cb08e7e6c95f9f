//! MQTT 3.1.1 transport built on rumqttc
//!
//! - `connection`: broker options from configuration (pure)
//! - `message_handler`: event classification (pure)
//! - `client`: the [`Connector`](crate::transport::Connector) and
//!   [`Session`](crate::transport::Session) implementations driving the event loop

pub mod client;
pub mod connection;
pub mod message_handler;

pub use client::{MqttConnector, MqttSession};
pub use connection::{configure_mqtt_options, MqttError};
pub use message_handler::{EventRoute, MessageHandler};
