//! Top-level error type for the agent

use crate::config::ConfigError;
use crate::telemetry::TelemetryError;
use crate::transport::mqtt::MqttError;
use crate::transport::ConnectionError;
use thiserror::Error;

/// Main error type for agent operations
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("MQTT error: {0}")]
    Mqtt(#[from] MqttError),

    #[error("Telemetry error: {0}")]
    Telemetry(#[from] TelemetryError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for agent operations
pub type AgentResult<T> = Result<T, AgentError>;
