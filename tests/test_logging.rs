//! Tests for logging configuration and the span helpers
//!
//! Exercises the public logging surface the binary relies on: format and level
//! parsing from environment values, repeated initialization, and span macros
//! usable from outside the crate.

use telemetry_agent::observability::logging::{init_logging, parse_level, LogFormat};
use telemetry_agent::{lifecycle_span, mqtt_span, telemetry_span};
use tracing::Level;

#[test]
fn test_log_format_parse_is_case_insensitive() {
    assert_eq!(LogFormat::parse("json"), LogFormat::Json);
    assert_eq!(LogFormat::parse("PRETTY"), LogFormat::Pretty);
    assert_eq!(LogFormat::parse("Compact"), LogFormat::Compact);
}

#[test]
fn test_log_format_parse_invalid_defaults_to_json() {
    for value in ["", "xml", "yaml", "123"] {
        assert_eq!(LogFormat::parse(value), LogFormat::Json);
    }
}

#[test]
fn test_parse_level_defaults_to_info() {
    assert_eq!(parse_level("debug"), Level::DEBUG);
    assert_eq!(parse_level("WARN"), Level::WARN);
    assert_eq!(parse_level("verbose"), Level::INFO);
    assert_eq!(parse_level(""), Level::INFO);
}

#[test]
fn test_span_macros_accept_fields() {
    init_logging(Level::TRACE, LogFormat::Compact, false);

    let device_id = "sensor-01";
    let lifecycle = lifecycle_span!(device_id = %device_id);
    let _lifecycle = lifecycle.enter();

    let mqtt = mqtt_span!(component = "connection_manager");
    let telemetry = telemetry_span!(seq = 7u64);
    mqtt.in_scope(|| tracing::info!("inside mqtt span"));
    telemetry.in_scope(|| tracing::debug!(topic = "home/room1/sensor1", "inside telemetry span"));
}

#[test]
fn test_repeated_init_is_harmless() {
    init_logging(Level::INFO, LogFormat::Json, true);
    init_logging(Level::DEBUG, LogFormat::Pretty, false);
    tracing::info!("still logging");
}
