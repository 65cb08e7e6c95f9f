//! Sample, stamp, encode and publish on a fixed period
//!
//! The period sleep starts only after the previous publish completed. An
//! outage therefore stretches the current cycle instead of producing a burst
//! of catch-up publishes once the link returns.

use super::payload::{Measurement, Payload};
use super::TelemetryError;
use crate::clock::Clock;
use crate::observability::metrics::metrics;
use crate::sensor::Sensor;
use crate::telemetry_span;
use crate::transport::{ConnectionHandle, Qos};
use std::time::Duration;
use tracing::{debug, info, warn, Instrument};

/// Where and how often to publish
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryOptions {
    pub topic: String,
    pub qos: Qos,
    pub period: Duration,
}

pub struct TelemetryLoop {
    link: ConnectionHandle,
    sensor: Box<dyn Sensor>,
    clock: Box<dyn Clock>,
    options: TelemetryOptions,
    seq: u64,
}

impl TelemetryLoop {
    pub fn new(
        link: ConnectionHandle,
        sensor: Box<dyn Sensor>,
        clock: Box<dyn Clock>,
        options: TelemetryOptions,
    ) -> Self {
        Self {
            link,
            sensor,
            clock,
            options,
            seq: 0,
        }
    }

    /// Run until the connection manager goes away
    pub async fn run(mut self) -> Result<(), TelemetryError> {
        info!(
            topic = %self.options.topic,
            period_secs = self.options.period.as_secs_f64(),
            "Telemetry loop started"
        );
        loop {
            tokio::time::sleep(self.options.period).await;
            let span = telemetry_span!(seq = self.seq);
            self.cycle().instrument(span).await?;
        }
    }

    async fn cycle(&mut self) -> Result<(), TelemetryError> {
        metrics().record_telemetry_cycle();

        let reading = match self.sensor.read() {
            Ok(reading) if reading.is_finite() => reading,
            Ok(reading) => {
                metrics().record_sensor_failure();
                warn!(?reading, "Non-finite sensor reading, skipping cycle");
                return Ok(());
            }
            Err(e) => {
                metrics().record_sensor_failure();
                warn!(error = %e, "Sensor read failed, skipping cycle");
                return Ok(());
            }
        };

        let payload = Payload::encode(&Measurement::new(reading, self.clock.now()))?;
        info!(
            seq = self.seq,
            topic = %self.options.topic,
            timestamp = payload.timestamp(),
            payload = %payload,
            "Publishing measurement"
        );

        self.link
            .publish(&self.options.topic, payload.bytes().clone(), self.options.qos)
            .await
            .map_err(|_| TelemetryError::LinkClosed)?;

        debug!(seq = self.seq, "Measurement delivered");
        self.seq += 1;
        Ok(())
    }
}
