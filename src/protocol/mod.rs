//! Astarte MQTT v1 protocol types
//!
//! Outbound message model, value payload encoding and topic conventions.

pub mod message;
pub mod topics;
pub mod value;

pub use message::{Expiry, InterfaceType, Message, MessageId, Qos, Reliability, Retention};
pub use value::{AstarteValue, DecodedPayload, PayloadError};
