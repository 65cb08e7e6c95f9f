//! Pure connection state and reconnection backoff logic
//!
//! This module contains pure functions for connection state transitions,
//! backoff delay calculation, and transition logging. The connection manager
//! supervisor feeds it events and applies the resulting state.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, info, warn};

/// Connection state tracked by the connection manager supervisor
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Initial state - attempting the first connection
    Connecting,
    /// Session established and subscriptions applied
    Up,
    /// Session lost with reason
    Down(String),
    /// Attempting to reconnect (attempt count)
    Reconnecting(u32),
    /// Session released on shutdown
    Closed,
}

impl ConnectionState {
    /// Whether application traffic can flow in this state
    pub fn is_up(&self) -> bool {
        matches!(self, ConnectionState::Up)
    }
}

/// Connection events that trigger state transitions
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Session established and the connect handler completed
    Established,
    /// Transport error or broker disconnect
    LinkLost(String),
    /// Re-subscription failed on a fresh session
    SubscribeFailed(String),
    /// Reconnection attempt started
    ReconnectionStarted(u32),
    /// Explicit shutdown
    Shutdown,
}

/// Reconnection backoff configuration
///
/// Retries are unbounded: the pattern is walked once, then the sustained delay
/// repeats until the broker is reachable again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Backoff pattern in milliseconds
    pub backoff_ms: Vec<u64>,
    /// Delay to use after the pattern is exhausted
    pub sustained_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            backoff_ms: vec![250, 500, 1000, 2000],
            sustained_delay_ms: 2000,
        }
    }
}

impl ReconnectConfig {
    /// Calculate backoff delay for given attempt (1-based)
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let index = attempt.saturating_sub(1) as usize;
        self.backoff_ms
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay_ms)
    }

    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.calculate_backoff_delay(attempt))
    }
}

/// Pure state transition and validation helpers
pub struct HealthMonitor;

impl HealthMonitor {
    /// Determine next state after connection event (pure function)
    pub fn determine_next_state(
        current: &ConnectionState,
        event: ConnectionEvent,
    ) -> ConnectionState {
        match (current, event) {
            (ConnectionState::Closed, _) => ConnectionState::Closed,
            (_, ConnectionEvent::Shutdown) => ConnectionState::Closed,
            (_, ConnectionEvent::Established) => ConnectionState::Up,
            (_, ConnectionEvent::LinkLost(reason)) => ConnectionState::Down(reason),
            (_, ConnectionEvent::SubscribeFailed(reason)) => {
                ConnectionState::Down(format!("re-subscription failed: {reason}"))
            }
            (_, ConnectionEvent::ReconnectionStarted(attempt)) => {
                ConnectionState::Reconnecting(attempt)
            }
        }
    }

    /// Log connection state transition
    pub fn log_state_transition(from: &ConnectionState, to: &ConnectionState) {
        match (from, to) {
            (ConnectionState::Connecting, ConnectionState::Up) => {
                info!("MQTT connection established successfully");
            }
            (ConnectionState::Up, ConnectionState::Down(reason)) => {
                warn!("MQTT connection lost: {}", reason);
            }
            (ConnectionState::Reconnecting(attempt), ConnectionState::Up) => {
                info!("Reconnection successful after {} attempt(s)", attempt);
            }
            (_, ConnectionState::Reconnecting(attempt)) => {
                info!("Starting reconnection attempt {}", attempt);
            }
            (_, ConnectionState::Down(reason)) => {
                error!("MQTT session unusable: {}", reason);
            }
            (_, ConnectionState::Closed) => {
                info!("MQTT session closed");
            }
            _ => {
                info!("MQTT connection state: {:?} -> {:?}", from, to);
            }
        }
    }

    /// Validate reconnection configuration
    pub fn validate_reconnect_config(config: &ReconnectConfig) -> Result<(), String> {
        if config.sustained_delay_ms == 0 {
            return Err("sustained_delay_ms must be greater than 0".to_string());
        }

        if config.backoff_ms.iter().any(|&delay| delay == 0) {
            return Err("backoff_ms entries must be greater than 0".to_string());
        }

        Ok(())
    }
}
