//! Observability for the transport
//!
//! Structured logging setup and the span macros used across the crate.

pub mod logging;

pub use logging::{init_default_logging, init_logging, LogFormat};

// Span macros for structured logging
pub use logging::{cache_span, mqtt_span, pairing_span, transport_span};
