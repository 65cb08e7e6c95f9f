//! Top-level orchestration of the telemetry agent

pub mod lifecycle;

pub use lifecycle::{build_clock, build_sensor, TelemetryAgent};
