//! Testing utilities and mock implementations
//!
//! Lets the transport be exercised without a real MQTT broker: a recording
//! in-memory broker, a recording adapter and a counting reboot handler.

pub mod mocks;

pub use mocks::*;
