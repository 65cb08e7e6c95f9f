//! Agent configuration loaded from TOML
//!
//! Every section except `[device]` and `[mqtt]` is optional and falls back to
//! the defaults of the reference sensor node: publish to `home/room1/sensor1`
//! every 5 seconds at QoS 1, subscribe to `foo_topic`, heartbeat every 500 ms.

use crate::transport::{HealthMonitor, Qos, ReconnectConfig, SubscriptionSet};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Main agent configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentConfig {
    pub device: DeviceSection,
    pub mqtt: MqttSection,
    #[serde(default)]
    pub telemetry: TelemetrySection,
    #[serde(default)]
    pub sensor: SensorSection,
    #[serde(default)]
    pub clock: ClockSection,
    #[serde(default)]
    pub indicators: IndicatorSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSection {
    /// Device identifier (must match [a-zA-Z0-9._-]+)
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// MQTT broker URL, `mqtt://` or `mqtts://`
    pub broker_url: String,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// Only clean sessions are supported
    #[serde(default = "default_clean_session")]
    pub clean_session: bool,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_subscriptions")]
    pub subscriptions: Vec<SubscriptionEntry>,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            broker_url: "mqtt://localhost:1883".to_string(),
            username_env: None,
            password_env: None,
            keep_alive_secs: default_keep_alive(),
            clean_session: default_clean_session(),
            connect_timeout_secs: default_connect_timeout(),
            subscriptions: default_subscriptions(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl MqttSection {
    /// Subscriptions to re-apply on every session
    pub fn subscription_set(&self) -> SubscriptionSet {
        self.subscriptions
            .iter()
            .map(|entry| (entry.topic.clone(), entry.qos))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubscriptionEntry {
    pub topic: String,
    #[serde(default)]
    pub qos: Qos,
}

fn default_keep_alive() -> u64 {
    60
}

fn default_clean_session() -> bool {
    true
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_subscriptions() -> Vec<SubscriptionEntry> {
    vec![SubscriptionEntry {
        topic: "foo_topic".to_string(),
        qos: Qos::AtLeastOnce,
    }]
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TelemetrySection {
    /// Fixed publish topic
    pub topic: String,
    pub qos: Qos,
    pub period_secs: u64,
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            topic: "home/room1/sensor1".to_string(),
            qos: Qos::AtLeastOnce,
            period_secs: 5,
        }
    }
}

impl TelemetrySection {
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }
}

/// Sensor source selection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SensorSection {
    /// Deterministic values drifting around a baseline
    Simulated {
        #[serde(default = "default_temperature")]
        temperature: f64,
        #[serde(default = "default_pressure")]
        pressure: f64,
    },
    /// Linux IIO device directory, e.g. /sys/bus/iio/devices/iio:device0
    Iio { device_path: PathBuf },
}

impl Default for SensorSection {
    fn default() -> Self {
        SensorSection::Simulated {
            temperature: default_temperature(),
            pressure: default_pressure(),
        }
    }
}

fn default_temperature() -> f64 {
    21.5
}

fn default_pressure() -> f64 {
    1013.0
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClockSection {
    /// SNTP server as host or host:port; the system clock is used when absent
    pub ntp_server: Option<String>,
    pub timeout_ms: Option<u64>,
}

impl ClockSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.unwrap_or(2000))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IndicatorSection {
    pub heartbeat_ms: u64,
    /// LED class directory lit while the link is down
    pub link_led: Option<PathBuf>,
    /// LED class directory toggled by the heartbeat
    pub heartbeat_led: Option<PathBuf>,
}

impl Default for IndicatorSection {
    fn default() -> Self {
        Self {
            heartbeat_ms: 500,
            link_led: None,
            heartbeat_led: None,
        }
    }
}

impl IndicatorSection {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to render TOML: {0}")]
    TomlRender(#[from] toml::ser::Error),
    #[error("Invalid device ID format: {0}")]
    InvalidDeviceId(String),
    #[error("Invalid topic: {0}")]
    InvalidTopic(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl AgentConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: AgentConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Render the resolved configuration, defaults included
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_device_id(&self.device.id)?;
        self.validate_mqtt()?;
        validate_publish_topic(&self.telemetry.topic)?;

        if self.telemetry.period_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "telemetry.period_secs must be greater than 0".to_string(),
            ));
        }
        if self.indicators.heartbeat_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "indicators.heartbeat_ms must be greater than 0".to_string(),
            ));
        }
        if let SensorSection::Iio { device_path } = &self.sensor {
            if device_path.as_os_str().is_empty() {
                return Err(ConfigError::InvalidConfig(
                    "sensor.device_path must not be empty".to_string(),
                ));
            }
        }
        if matches!(self.clock.ntp_server.as_deref(), Some("")) {
            return Err(ConfigError::InvalidConfig(
                "clock.ntp_server must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    fn validate_mqtt(&self) -> Result<(), ConfigError> {
        let mqtt = &self.mqtt;

        let url = Url::parse(&mqtt.broker_url).map_err(|_| {
            ConfigError::InvalidConfig(format!("invalid broker URL '{}'", mqtt.broker_url))
        })?;
        if !matches!(url.scheme(), "mqtt" | "mqtts") || url.host_str().is_none() {
            return Err(ConfigError::InvalidConfig(format!(
                "broker URL '{}' must be mqtt://host[:port] or mqtts://host[:port]",
                mqtt.broker_url
            )));
        }

        if !mqtt.clean_session {
            return Err(ConfigError::InvalidConfig(
                "mqtt.clean_session = false is not supported".to_string(),
            ));
        }
        if mqtt.keep_alive_secs != 0 && mqtt.keep_alive_secs < 5 {
            return Err(ConfigError::InvalidConfig(
                "mqtt.keep_alive_secs must be 0 or at least 5".to_string(),
            ));
        }
        if mqtt.connect_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "mqtt.connect_timeout_secs must be greater than 0".to_string(),
            ));
        }
        for subscription in &mqtt.subscriptions {
            validate_topic_filter(&subscription.topic)?;
        }
        HealthMonitor::validate_reconnect_config(&mqtt.reconnect)
            .map_err(|e| ConfigError::InvalidConfig(format!("mqtt.reconnect: {e}")))
    }
}

/// Validate device ID format
fn validate_device_id(device_id: &str) -> Result<(), ConfigError> {
    let valid_chars = device_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');

    if device_id.is_empty() || !valid_chars {
        return Err(ConfigError::InvalidDeviceId(format!(
            "Device ID '{device_id}' must match pattern [a-zA-Z0-9._-]+"
        )));
    }

    Ok(())
}

/// Publish topics must be concrete: no wildcards
fn validate_publish_topic(topic: &str) -> Result<(), ConfigError> {
    if topic.is_empty() {
        return Err(ConfigError::InvalidTopic("publish topic is empty".to_string()));
    }
    if topic.contains(['+', '#']) {
        return Err(ConfigError::InvalidTopic(format!(
            "publish topic '{topic}' must not contain wildcards"
        )));
    }
    Ok(())
}

/// Subscription filters may use `+` for a whole level and `#` as the last level
fn validate_topic_filter(filter: &str) -> Result<(), ConfigError> {
    if filter.is_empty() {
        return Err(ConfigError::InvalidTopic(
            "subscription topic is empty".to_string(),
        ));
    }

    let levels: Vec<&str> = filter.split('/').collect();
    for (index, level) in levels.iter().enumerate() {
        let misplaced_hash = level.contains('#') && (*level != "#" || index + 1 != levels.len());
        let misplaced_plus = level.contains('+') && *level != "+";
        if misplaced_hash || misplaced_plus {
            return Err(ConfigError::InvalidTopic(format!(
                "subscription filter '{filter}' has a misplaced wildcard"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[device]
id = "sensor-01"

[mqtt]
broker_url = "mqtt://localhost:1883"
"#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = AgentConfig::from_toml_str(MINIMAL).unwrap();

        assert_eq!(config.telemetry.topic, "home/room1/sensor1");
        assert_eq!(config.telemetry.qos, Qos::AtLeastOnce);
        assert_eq!(config.telemetry.period(), Duration::from_secs(5));
        assert_eq!(config.indicators.heartbeat(), Duration::from_millis(500));
        assert!(config.mqtt.clean_session);
        assert_eq!(config.mqtt.keep_alive_secs, 60);
        assert!(config.mqtt.subscription_set().contains("foo_topic"));
        assert!(config.clock.ntp_server.is_none());
        assert_eq!(config.sensor, SensorSection::default());
    }

    #[test]
    fn test_full_config() {
        let toml_content = r#"
[device]
id = "node.kitchen_2"

[mqtt]
broker_url = "mqtts://broker.example.com"
username_env = "MQTT_USER"
password_env = "MQTT_PASS"
keep_alive_secs = 30

[[mqtt.subscriptions]]
topic = "home/+/commands"
qos = 0

[[mqtt.subscriptions]]
topic = "foo_topic"

[mqtt.reconnect]
backoff_ms = [500, 1000]
sustained_delay_ms = 5000

[telemetry]
topic = "home/kitchen/sensor2"
period_secs = 10

[sensor]
kind = "iio"
device_path = "/sys/bus/iio/devices/iio:device0"

[clock]
ntp_server = "pool.ntp.org"
timeout_ms = 1500

[indicators]
heartbeat_ms = 250
link_led = "/sys/class/leds/led0"
"#;
        let config = AgentConfig::from_toml_str(toml_content).unwrap();

        let subscriptions: Vec<(String, Qos)> = config
            .mqtt
            .subscription_set()
            .iter()
            .map(|(topic, qos)| (topic.to_string(), qos))
            .collect();
        assert_eq!(
            subscriptions,
            vec![
                ("foo_topic".to_string(), Qos::AtLeastOnce),
                ("home/+/commands".to_string(), Qos::AtMostOnce),
            ]
        );
        assert_eq!(config.mqtt.reconnect.calculate_backoff_delay(3), 5000);
        assert_eq!(
            config.sensor,
            SensorSection::Iio {
                device_path: PathBuf::from("/sys/bus/iio/devices/iio:device0")
            }
        );
        assert_eq!(config.clock.timeout(), Duration::from_millis(1500));
        assert_eq!(
            config.indicators.link_led,
            Some(PathBuf::from("/sys/class/leds/led0"))
        );
        assert!(config.indicators.heartbeat_led.is_none());
    }

    #[test]
    fn test_invalid_device_id() {
        assert!(validate_device_id("sensor-01").is_ok());
        assert!(validate_device_id("").is_err());
        assert!(validate_device_id("sensor 01").is_err());
        assert!(validate_device_id("sensor/01").is_err());
    }

    #[test]
    fn test_persistent_session_rejected() {
        let content = format!("{MINIMAL}clean_session = false\n");
        let err = AgentConfig::from_toml_str(&content).unwrap_err();
        assert!(err.to_string().contains("clean_session"));
    }

    #[test]
    fn test_keep_alive_bounds() {
        let mut config = AgentConfig::from_toml_str(MINIMAL).unwrap();
        config.mqtt.keep_alive_secs = 3;
        assert!(config.validate().is_err());

        config.mqtt.keep_alive_secs = 0;
        assert!(config.validate().is_ok());

        config.mqtt.keep_alive_secs = 5;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_qos_out_of_range_rejected() {
        let content = format!("{MINIMAL}\n[telemetry]\nqos = 2\n");
        assert!(matches!(
            AgentConfig::from_toml_str(&content),
            Err(ConfigError::TomlParse(_))
        ));
    }

    #[test]
    fn test_zero_period_rejected() {
        let mut config = AgentConfig::from_toml_str(MINIMAL).unwrap();
        config.telemetry.period_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_broker_scheme() {
        let mut config = AgentConfig::from_toml_str(MINIMAL).unwrap();
        config.mqtt.broker_url = "http://localhost:1883".to_string();
        assert!(config.validate().is_err());

        config.mqtt.broker_url = "localhost".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_topic_rules() {
        assert!(validate_publish_topic("home/room1/sensor1").is_ok());
        assert!(validate_publish_topic("").is_err());
        assert!(validate_publish_topic("home/+/sensor1").is_err());
        assert!(validate_publish_topic("home/#").is_err());

        assert!(validate_topic_filter("foo_topic").is_ok());
        assert!(validate_topic_filter("home/+/sensor1").is_ok());
        assert!(validate_topic_filter("home/#").is_ok());
        assert!(validate_topic_filter("#").is_ok());
        assert!(validate_topic_filter("home/#/sensor").is_err());
        assert!(validate_topic_filter("home/room+").is_err());
    }

    #[test]
    fn test_zero_sustained_backoff_rejected() {
        let mut config = AgentConfig::from_toml_str(MINIMAL).unwrap();
        config.mqtt.reconnect.sustained_delay_ms = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidConfig(message)) if message.contains("reconnect")
        ));
    }

    #[test]
    fn test_rendered_config_reloads() {
        let config = AgentConfig::from_toml_str(MINIMAL).unwrap();
        let rendered = config.to_toml_string().unwrap();
        assert_eq!(AgentConfig::from_toml_str(&rendered).unwrap(), config);
    }
}
