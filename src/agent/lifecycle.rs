//! Agent lifecycle: startup, steady state and shutdown
//!
//! Startup order: liveness signal, clock sync, broker connect, telemetry loop.
//! A failed clock sync is tolerated; a failed initial connect is not. On
//! shutdown the MQTT session is always released before returning.

use crate::clock::{Clock, SntpClock, SystemClock};
use crate::config::{AgentConfig, ClockSection, SensorSection};
use crate::error::AgentResult;
use crate::indicator::{pin_for, LinkStatusIndicator, LivenessIndicator};
use crate::lifecycle_span;
use crate::observability::metrics::metrics;
use crate::scheduler::Scheduler;
use crate::sensor::{IioSensor, Sensor, SimulatedSensor};
use crate::telemetry::{TelemetryLoop, TelemetryOptions};
use crate::transport::mqtt::MqttConnector;
use crate::transport::{
    ConnectionError, ConnectionManager, Connector, LinkObserver, LinkState, TransportError,
};
use std::future::Future;
use tracing::{info, warn, Instrument};

/// Sensor selected by configuration
pub fn build_sensor(section: &SensorSection) -> Box<dyn Sensor> {
    match section {
        SensorSection::Simulated {
            temperature,
            pressure,
        } => Box::new(SimulatedSensor::new(*temperature, *pressure)),
        SensorSection::Iio { device_path } => Box::new(IioSensor::new(device_path.clone())),
    }
}

/// SNTP clock when a server is configured, otherwise the system clock
pub fn build_clock(section: &ClockSection) -> Box<dyn Clock> {
    match &section.ntp_server {
        Some(server) => Box::new(SntpClock::new(server.clone(), section.timeout())),
        None => Box::new(SystemClock),
    }
}

pub struct TelemetryAgent {
    config: AgentConfig,
}

impl TelemetryAgent {
    pub fn new(config: AgentConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Run with the MQTT transport and the configured sensor and clock
    pub async fn run<F>(self, shutdown: F) -> AgentResult<()>
    where
        F: Future<Output = ()>,
    {
        let connector = MqttConnector::new(&self.config.device.id, self.config.mqtt.clone())?;
        let sensor = build_sensor(&self.config.sensor);
        let clock = build_clock(&self.config.clock);
        self.run_with(connector, sensor, clock, shutdown).await
    }

    /// Run until `shutdown` resolves, with injected collaborators
    pub async fn run_with<C, F>(
        self,
        connector: C,
        sensor: Box<dyn Sensor>,
        clock: Box<dyn Clock>,
        shutdown: F,
    ) -> AgentResult<()>
    where
        C: Connector,
        F: Future<Output = ()>,
    {
        let span = lifecycle_span!(device_id = %self.config.device.id);
        self.run_inner(connector, sensor, clock, shutdown)
            .instrument(span)
            .await
    }

    async fn run_inner<C, F>(
        self,
        connector: C,
        sensor: Box<dyn Sensor>,
        mut clock: Box<dyn Clock>,
        shutdown: F,
    ) -> AgentResult<()>
    where
        C: Connector,
        F: Future<Output = ()>,
    {
        let config = self.config;
        info!("Starting telemetry agent");
        tokio::pin!(shutdown);

        let mut scheduler = Scheduler::new();
        scheduler.spawn(
            "liveness",
            LivenessIndicator::new(
                pin_for(config.indicators.heartbeat_led.as_ref(), "heartbeat"),
                config.indicators.heartbeat(),
            )
            .run(),
        );

        if let Err(e) = clock.sync().await {
            warn!(error = %e, "Clock sync failed, using the system clock");
        }

        // Lit until the first connection is up
        let mut link_indicator =
            LinkStatusIndicator::new(pin_for(config.indicators.link_led.as_ref(), "link"));
        link_indicator.on_link_change(LinkState::Down);

        let manager = ConnectionManager::new(
            connector,
            config.mqtt.reconnect.clone(),
            config.mqtt.subscription_set(),
        )
        .observe(link_indicator);

        // No session exists until `start` returns
        let link = tokio::select! {
            result = manager.start() => result?,
            _ = &mut shutdown => {
                info!("Shutdown requested before the first connection");
                scheduler.shutdown().await;
                return Ok(());
            }
        };

        tokio::select! {
            result = link.wait_for(LinkState::Up) => {
                if result.is_err() {
                    scheduler.shutdown().await;
                    return Err(ConnectionError::Unreachable(TransportError::Closed).into());
                }
            }
            _ = &mut shutdown => {
                info!("Shutdown requested before the link came up");
                link.close().await;
                scheduler.shutdown().await;
                return Ok(());
            }
        }

        scheduler.spawn(
            "telemetry",
            TelemetryLoop::new(
                link.clone(),
                sensor,
                clock,
                TelemetryOptions {
                    topic: config.telemetry.topic.clone(),
                    qos: config.telemetry.qos,
                    period: config.telemetry.period(),
                },
            )
            .run(),
        );
        info!(tasks = scheduler.len(), "Telemetry agent running");

        scheduler.run_until(&mut shutdown).await;

        info!("Shutting down telemetry agent");
        link.close().await;

        match serde_json::to_string(&metrics().snapshot()) {
            Ok(snapshot) => info!(metrics = %snapshot, "Final metrics"),
            Err(e) => warn!(error = %e, "Failed to serialize metrics"),
        }
        info!("Telemetry agent stopped");
        Ok(())
    }
}
