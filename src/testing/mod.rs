//! Testing utilities and mock implementations
//!
//! In-process stand-ins for the broker, sensor, clock and LEDs so the agent can
//! be exercised without hardware or a network.

pub mod mocks;

pub use mocks::*;
