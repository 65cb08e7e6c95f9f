//! Thread-safe metrics collection
//!
//! Atomic counters for link and telemetry activity. The agent logs a snapshot
//! at shutdown; nothing is exported over the network.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

/// Thread-safe metrics collector using atomics
pub struct MetricsCollector {
    // Link metrics
    link_up: AtomicBool,
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    link_drops: AtomicU64,
    resubscriptions: AtomicU64,

    // Traffic metrics
    messages_delivered: AtomicU64,
    publish_retries: AtomicU64,
    messages_received: AtomicU64,

    // Telemetry loop metrics
    telemetry_cycles: AtomicU64,
    sensor_failures: AtomicU64,
    last_publish: AtomicU64,

    uptime_start: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            link_up: AtomicBool::new(false),
            connection_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            link_drops: AtomicU64::new(0),
            resubscriptions: AtomicU64::new(0),
            messages_delivered: AtomicU64::new(0),
            publish_retries: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            telemetry_cycles: AtomicU64::new(0),
            sensor_failures: AtomicU64::new(0),
            last_publish: AtomicU64::new(0),
            uptime_start: AtomicU64::new(current_timestamp()),
        }
    }

    // Link metrics
    pub fn record_connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_link_drop(&self) {
        self.link_drops.fetch_add(1, Ordering::Relaxed);
        self.link_up.store(false, Ordering::Relaxed);
    }

    /// Subscriptions re-applied and the link reported up
    pub fn record_resubscription(&self) {
        self.resubscriptions.fetch_add(1, Ordering::Relaxed);
        self.link_up.store(true, Ordering::Relaxed);
    }

    pub fn set_link_up(&self, up: bool) {
        self.link_up.store(up, Ordering::Relaxed);
    }

    // Traffic metrics
    pub fn record_message_delivered(&self) {
        self.messages_delivered.fetch_add(1, Ordering::Relaxed);
        self.last_publish
            .store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn record_publish_retry(&self) {
        self.publish_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    // Telemetry loop metrics
    pub fn record_telemetry_cycle(&self) {
        self.telemetry_cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sensor_failure(&self) {
        self.sensor_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        MetricsSnapshot {
            timestamp: now,
            uptime_seconds: now.saturating_sub(self.uptime_start.load(Ordering::Relaxed)),
            link: LinkMetrics {
                up: self.link_up.load(Ordering::Relaxed),
                connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
                connections_established: self.connections_established.load(Ordering::Relaxed),
                link_drops: self.link_drops.load(Ordering::Relaxed),
                resubscriptions: self.resubscriptions.load(Ordering::Relaxed),
                messages_delivered: self.messages_delivered.load(Ordering::Relaxed),
                publish_retries: self.publish_retries.load(Ordering::Relaxed),
                messages_received: self.messages_received.load(Ordering::Relaxed),
            },
            telemetry: TelemetryMetrics {
                cycles: self.telemetry_cycles.load(Ordering::Relaxed),
                sensor_failures: self.sensor_failures.load(Ordering::Relaxed),
                last_publish: self.last_publish.load(Ordering::Relaxed),
            },
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub timestamp: u64,
    pub uptime_seconds: u64,
    pub link: LinkMetrics,
    pub telemetry: TelemetryMetrics,
}

#[derive(Debug, Clone, Serialize)]
pub struct LinkMetrics {
    pub up: bool,
    pub connection_attempts: u64,
    pub connections_established: u64,
    pub link_drops: u64,
    pub resubscriptions: u64,
    pub messages_delivered: u64,
    pub publish_retries: u64,
    pub messages_received: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TelemetryMetrics {
    pub cycles: u64,
    pub sensor_failures: u64,
    /// Unix seconds of the last delivered publish, 0 if none
    pub last_publish: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
