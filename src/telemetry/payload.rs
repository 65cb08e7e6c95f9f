//! Wire encoding of a measurement
//!
//! The record carries exactly two fields and is written with a space after
//! `:` and `,`, e.g. `{"temperature": 21.5, "pressure": 1013.0}`. Consumers on
//! the broker side match this text layout, so it must not drift.

use super::TelemetryError;
use crate::sensor::Reading;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::ser::Formatter;
use std::fmt;
use std::io;

/// One timestamped reading, consumed by [`Payload::encode`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    pub temperature: f64,
    pub pressure: f64,
    /// Unix seconds
    pub timestamp: i64,
}

impl Measurement {
    pub fn new(reading: Reading, timestamp: i64) -> Self {
        Self {
            temperature: reading.temperature,
            pressure: reading.pressure,
            timestamp,
        }
    }
}

/// The two fields that go on the wire, in wire order
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PayloadFields {
    pub temperature: f64,
    pub pressure: f64,
}

/// JSON with `": "` and `", "` separators on a single line
struct SpacedFormatter;

impl Formatter for SpacedFormatter {
    fn begin_object_key<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_value<W>(&mut self, writer: &mut W) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        writer.write_all(b": ")
    }
}

/// Encoded measurement, immutable once built
///
/// The timestamp travels alongside the bytes for logging only.
#[derive(Debug, Clone, PartialEq)]
pub struct Payload {
    bytes: Bytes,
    timestamp: i64,
}

impl Payload {
    pub fn encode(measurement: &Measurement) -> Result<Self, TelemetryError> {
        let fields = PayloadFields {
            temperature: measurement.temperature,
            pressure: measurement.pressure,
        };
        if !fields.temperature.is_finite() || !fields.pressure.is_finite() {
            return Err(TelemetryError::Encode(serde::ser::Error::custom(
                "measurement is not finite",
            )));
        }

        let mut buffer = Vec::with_capacity(48);
        let mut serializer = serde_json::Serializer::with_formatter(&mut buffer, SpacedFormatter);
        fields.serialize(&mut serializer)?;

        Ok(Self {
            bytes: Bytes::from(buffer),
            timestamp: measurement.timestamp,
        })
    }

    pub fn decode(bytes: &[u8]) -> Result<PayloadFields, TelemetryError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.bytes))
    }
}
