//! Liveness and link-status signals
//!
//! Both indicators drive a [`SignalPin`]: a Linux LED-class device when one is
//! configured, otherwise a trace log line.

use crate::transport::{LinkObserver, LinkState};
use std::convert::Infallible;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, trace, warn};

/// Binary output such as an LED
pub trait SignalPin: Send {
    fn set(&mut self, active: bool);
}

/// LED driven through `/sys/class/leds/<name>/brightness`
pub struct SysfsLed {
    brightness: PathBuf,
    warned: bool,
}

impl SysfsLed {
    pub fn new(led_dir: impl Into<PathBuf>) -> Self {
        Self {
            brightness: led_dir.into().join("brightness"),
            warned: false,
        }
    }
}

impl SignalPin for SysfsLed {
    fn set(&mut self, active: bool) {
        let value = if active { "1" } else { "0" };
        if let Err(e) = std::fs::write(&self.brightness, value) {
            // Warn once per pin
            if !self.warned {
                warn!(path = %self.brightness.display(), error = %e, "Failed to drive LED");
                self.warned = true;
            }
        }
    }
}

/// Pin that only logs, for hosts without an LED
pub struct LogPin {
    name: &'static str,
}

impl LogPin {
    pub fn new(name: &'static str) -> Self {
        Self { name }
    }
}

impl SignalPin for LogPin {
    fn set(&mut self, active: bool) {
        trace!(pin = self.name, active, "Signal");
    }
}

/// Pick the sysfs LED when configured, otherwise a logging pin
pub fn pin_for(led_dir: Option<&PathBuf>, name: &'static str) -> Box<dyn SignalPin> {
    match led_dir {
        Some(dir) => Box::new(SysfsLed::new(dir.clone())),
        None => Box::new(LogPin::new(name)),
    }
}

impl SignalPin for Box<dyn SignalPin> {
    fn set(&mut self, active: bool) {
        (**self).set(active)
    }
}

/// Lit while the link is down
pub struct LinkStatusIndicator<P> {
    pin: P,
}

impl<P: SignalPin> LinkStatusIndicator<P> {
    pub fn new(pin: P) -> Self {
        Self { pin }
    }
}

impl<P: SignalPin> LinkObserver for LinkStatusIndicator<P> {
    fn on_link_change(&mut self, state: LinkState) {
        self.pin.set(state == LinkState::Down);
        match state {
            LinkState::Up => info!("Link is up"),
            LinkState::Down => warn!("Link is down"),
        }
    }
}

/// Toggles its pin on a fixed interval to show the process is alive
pub struct LivenessIndicator<P> {
    pin: P,
    interval: Duration,
    lit: bool,
}

impl<P: SignalPin> LivenessIndicator<P> {
    pub fn new(pin: P, interval: Duration) -> Self {
        Self {
            pin,
            interval,
            lit: false,
        }
    }

    /// Blink forever; cancelled by the scheduler on shutdown
    pub async fn run(mut self) -> Result<(), Infallible> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            self.lit = !self.lit;
            self.pin.set(self.lit);
        }
    }
}
