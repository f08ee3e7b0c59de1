//! Astarte device transport
//!
//! The device side of the Astarte MQTT v1 protocol: it pairs the device with
//! the pairing service, keeps one mutual-TLS MQTT session to the broker, and
//! makes sure property state and retained messages survive disconnects and
//! restarts.
//!
//! # Overview
//!
//! - [`cache::PersistentCache`] - property state, in-flight and retry queues
//!   backed by SQLite
//! - [`pairing::PairingClient`] - credentials secret, device key and client
//!   certificate lifecycle
//! - [`transport::mqtt`] - the broker session wrapper over rumqttc
//! - [`transport::Transport`] - the orchestrator tying them together
//!
//! # Quick Start
//!
//! ```no_run
//! use astarte_transport::interface::{Direction, InterfaceMetadata, Introspection};
//! use astarte_transport::protocol::{AstarteValue, InterfaceType};
//! use astarte_transport::transport::mqtt::RumqttcFactory;
//! use astarte_transport::transport::{PublishRequest, Transport};
//! use astarte_transport::TransportConfig;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = TransportConfig::new(
//!     "https://api.example.com/pairing/v1/myrealm",
//!     "/var/lib/astarte",
//! );
//! let introspection = Introspection::new().with(InterfaceMetadata::new(
//!     "org.example.Sensors",
//!     1,
//!     0,
//!     Direction::Producer,
//!     InterfaceType::DataStream,
//! ));
//!
//! let transport = Transport::new(
//!     &config,
//!     "dGVzdC1oYXJkd2FyZS1pZA",
//!     introspection,
//!     Arc::new(RumqttcFactory::default()),
//! )?;
//! let handle = transport.handle();
//! tokio::spawn(transport.run());
//!
//! handle
//!     .publish(PublishRequest::new(
//!         "org.example.Sensors",
//!         "/room/temperature",
//!         AstarteValue::Double(21.5),
//!     ))
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod interface;
pub mod observability;
pub mod pairing;
pub mod protocol;
pub mod retry;
pub mod testing;
pub mod transport;

pub use cache::{CacheError, PersistentCache};
pub use config::{Config, ConfigError, TransportConfig};
pub use error::{ErrorSeverity, TransportError, TransportResult};
pub use pairing::{PairingClient, PairingError, PairingState};
pub use protocol::{AstarteValue, InterfaceType, Message, Reliability, Retention};
pub use transport::{InterfaceAdapter, PublishRequest, Transport, TransportHandle};
