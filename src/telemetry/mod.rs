//! Periodic sample-and-publish pipeline

pub mod payload;
pub mod telemetry_loop;

pub use payload::{Measurement, Payload, PayloadFields};
pub use telemetry_loop::{TelemetryLoop, TelemetryOptions};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("Connection manager closed")]
    LinkClosed,
    #[error("Failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
}
