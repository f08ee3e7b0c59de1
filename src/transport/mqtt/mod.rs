//! Broker session wrapper
//!
//! This module separates pure functions from I/O the same way the rest of
//! the transport does:
//!
//! - [`connection`] - rumqttc options from broker URL and TLS identity
//! - [`message_handler`] - event routing and publish id tracking
//! - [`health_monitor`] - connection status transitions
//! - [`client`] - the rumqttc-backed [`MqttClient`] and its event loop
//!
//! The orchestrator only sees the [`MqttClient`] trait and a stream of
//! [`BrokerEvent`]s, and builds clients through a [`BrokerFactory`] so that
//! tests can substitute an in-memory broker.
//!
//! ```
//! use astarte_transport::pairing::{BrokerInfo, TlsIdentity};
//! use astarte_transport::protocol::Qos;
//! use astarte_transport::testing::MockBroker;
//! use astarte_transport::transport::mqtt::{BrokerEvent, BrokerFactory, ConnectionStatus, MqttClient};
//! use tokio::sync::mpsc;
//!
//! # tokio_test::block_on(async {
//! let broker = MockBroker::new();
//! let (events_tx, mut events) = mpsc::unbounded_channel();
//! let info = BrokerInfo {
//!     url: "mqtts://broker.example.com:8883".to_string(),
//!     version: "1.0".to_string(),
//! };
//! let identity = TlsIdentity {
//!     ca: Vec::new(),
//!     certificate: Vec::new(),
//!     private_key: Vec::new(),
//! };
//!
//! let mut client = broker
//!     .factory()
//!     .create(&info, &identity, "realm/device", events_tx)
//!     .unwrap();
//! client.connect().await.unwrap();
//! broker.accept_connection(false);
//! client
//!     .publish("realm/device/org.example.Sensors/t", vec![1], Qos::AtLeastOnce, false)
//!     .await
//!     .unwrap();
//!
//! assert_eq!(
//!     events.recv().await,
//!     Some(BrokerEvent::StatusChanged(ConnectionStatus::Connecting))
//! );
//! assert_eq!(client.status(), ConnectionStatus::Connected);
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod health_monitor;
pub mod message_handler;

pub use client::{RumqttcClient, RumqttcFactory};
pub use connection::{ConnectionStatus, MqttError};
pub use health_monitor::{ConnectionEvent, HealthMonitor};
pub use message_handler::{EventRoute, MessageHandler, PublishTracker};

use crate::pairing::{BrokerInfo, TlsIdentity};
use crate::protocol::{MessageId, Qos};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Everything a broker session reports back to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    StatusChanged(ConnectionStatus),
    /// Sent right after `StatusChanged(Connected)`.
    Connected { session_present: bool },
    MessageReceived { topic: String, payload: Vec<u8> },
    PublishConfirmed(MessageId),
    /// No CONNACK within the randomized watchdog interval.
    ConnackTimeout,
    ConnectionFailed(String),
}

pub type BrokerEventSender = mpsc::UnboundedSender<BrokerEvent>;
pub type BrokerEventReceiver = mpsc::UnboundedReceiver<BrokerEvent>;

/// One MQTT session bound to the device certificate.
#[async_trait]
pub trait MqttClient: Send + Sync {
    /// Start connecting; progress is reported through [`BrokerEvent`]s.
    async fn connect(&mut self) -> Result<(), MqttError>;

    async fn disconnect(&mut self) -> Result<(), MqttError>;

    /// Hand a message to the client library. The returned id is confirmed
    /// later through [`BrokerEvent::PublishConfirmed`].
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: Qos,
        retain: bool,
    ) -> Result<MessageId, MqttError>;

    /// Fire-and-forget subscription; not retried on failure.
    async fn subscribe(&self, topic: &str, qos: Qos) -> Result<(), MqttError>;

    fn status(&self) -> ConnectionStatus;
}

/// Builds broker sessions for the orchestrator.
pub trait BrokerFactory: Send + Sync {
    fn create(
        &self,
        broker: &BrokerInfo,
        identity: &TlsIdentity,
        client_id: &str,
        events: BrokerEventSender,
    ) -> Result<Box<dyn MqttClient>, MqttError>;
}
