//! Pure broker option handling for the MQTT client

use crate::config::MqttSection;
use rumqttc::{MqttOptions, Transport};
use std::time::Duration;
use thiserror::Error;
use url::Url;
use uuid::Uuid;

/// MQTT configuration errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Unsupported broker URL scheme '{0}', expected mqtt or mqtts")]
    UnsupportedScheme(String),
}

/// Broker host, port and TLS flag parsed from a `mqtt://` or `mqtts://` URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl BrokerAddress {
    pub fn parse(broker_url: &str) -> Result<Self, MqttError> {
        let url =
            Url::parse(broker_url).map_err(|_| MqttError::InvalidBrokerUrl(broker_url.to_string()))?;

        let tls = match url.scheme() {
            "mqtt" => false,
            "mqtts" => true,
            other => return Err(MqttError::UnsupportedScheme(other.to_string())),
        };
        let host = url
            .host_str()
            .ok_or_else(|| MqttError::InvalidBrokerUrl(broker_url.to_string()))?
            .to_string();
        let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });

        Ok(Self { host, port, tls })
    }
}

/// Client id for one connection attempt
///
/// A short random suffix keeps a half-dead previous connection from
/// colliding with the new one at the broker.
pub fn client_id(device_id: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{device_id}-{}", &suffix[..8])
}

/// Build rumqttc options for a fresh clean session
pub fn configure_mqtt_options(
    device_id: &str,
    config: &MqttSection,
) -> Result<MqttOptions, MqttError> {
    let address = BrokerAddress::parse(&config.broker_url)?;
    let mut mqtt_options = MqttOptions::new(client_id(device_id), address.host, address.port);

    if address.tls {
        mqtt_options.set_transport(Transport::tls_with_default_config());
    }

    // Credentials come from the environment, never from the config file
    if let Some(username_env) = &config.username_env {
        if let Ok(username) = std::env::var(username_env) {
            let password = config
                .password_env
                .as_ref()
                .and_then(|env_name| std::env::var(env_name).ok())
                .unwrap_or_default();
            mqtt_options.set_credentials(username, password);
        }
    }

    mqtt_options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
    // The broker keeps nothing between sessions; subscriptions are re-applied
    mqtt_options.set_clean_session(true);

    Ok(mqtt_options)
}
