//! Telemetry Agent
//!
//! A sensor telemetry agent that samples a sensor on a fixed period, stamps each
//! reading with a synchronized clock and publishes it to an MQTT broker.
//!
//! # Overview
//!
//! The crate is organized around a connection manager that owns the broker
//! session and keeps it usable across link drops:
//! - Clean-session MQTT transport with QoS 0/1 publishes
//! - Automatic reconnect with a configurable backoff pattern
//! - Re-subscription of every configured topic on each fresh session, before
//!   the link is reported up
//! - Link observers (e.g. a status LED) notified on every up/down edge
//! - A periodic telemetry loop whose publishes are suspended while the link is down
//!
//! # Quick Start
//!
//! ```rust
//! use telemetry_agent::sensor::Reading;
//! use telemetry_agent::telemetry::{Measurement, Payload};
//!
//! let reading = Reading { temperature: 21.5, pressure: 1013.2 };
//! let payload = Payload::encode(&Measurement::new(reading, 1_700_000_000)).unwrap();
//! assert_eq!(payload.to_string(), r#"{"temperature": 21.5, "pressure": 1013.2}"#);
//! ```

pub mod agent;
pub mod clock;
pub mod config;
pub mod error;
pub mod indicator;
pub mod observability;
pub mod scheduler;
pub mod sensor;
pub mod telemetry;
pub mod testing;
pub mod transport;

pub use agent::TelemetryAgent;
pub use config::{AgentConfig, ConfigError};
pub use error::{AgentError, AgentResult};
pub use transport::{ConnectionHandle, ConnectionManager, LinkState, Qos};
